//! Configuration types and validation.

mod admin;
mod defaults;
mod nestcore;
mod spec;
mod validate;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use admin::*;
pub use defaults::*;
pub use nestcore::*;
pub use spec::*;
