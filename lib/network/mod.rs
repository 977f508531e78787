//! Port forwarding backed by host firewall DNAT rules.

mod forward;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use forward::*;
