//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Environment variable for the address the admin surface binds to.
pub const HOST_ENV_VAR: &str = "HOST";

/// Environment variable for the port the admin surface binds to.
pub const PORT_ENV_VAR: &str = "PORT";

/// Environment variable for the machines directory.
pub const MACHINES_DIR_ENV_VAR: &str = "MACHINES_DIR";

/// Environment variable for the systemd-nspawn unit file directory.
pub const UNITS_DIR_ENV_VAR: &str = "UNITS_DIR";

/// Environment variable for the nestcore state directory.
pub const STATE_DIR_ENV_VAR: &str = "STATE_DIR";
