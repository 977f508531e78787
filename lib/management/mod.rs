//! Container lifecycle and metadata store.

mod db;
mod lifecycle;
mod models;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use db::*;
pub use lifecycle::*;
pub use models::*;
