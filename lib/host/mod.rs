//! Host command invoker and inspector.

mod inspector;
mod invoker;

#[cfg(test)]
pub(crate) mod mock;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use inspector::*;
pub use invoker::*;
