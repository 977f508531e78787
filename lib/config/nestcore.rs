//! Host-level nestcore configuration.

use std::path::PathBuf;

use getset::Getters;
use typed_builder::TypedBuilder;

use crate::{
    utils::{
        ADMIN_CONFIG_FILENAME, HOST_ENV_VAR, MACHINES_DIR_ENV_VAR, PORT_ENV_VAR, STATE_DIR_ENV_VAR,
        UNITS_DIR_ENV_VAR,
    },
    NestcoreError, NestcoreResult,
};

use super::{
    DEFAULT_BRIDGE, DEFAULT_HOST, DEFAULT_MACHINES_DIR, DEFAULT_PORT, DEFAULT_STATE_DIR,
    DEFAULT_UNITS_DIR,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The nestcore host configuration.
///
/// Threaded explicitly through constructors; nothing in the crate reads process
/// environment or global state after startup.
#[derive(Debug, Clone, PartialEq, Eq, Getters, TypedBuilder)]
#[getset(get = "pub with_prefix")]
pub struct NestcoreConfig {
    /// The address the admin surface binds to.
    #[builder(default = DEFAULT_HOST.to_string(), setter(into))]
    host: String,

    /// The port the admin surface binds to.
    #[builder(default = DEFAULT_PORT)]
    port: u16,

    /// The directory under which container root filesystems live.
    #[builder(default = PathBuf::from(DEFAULT_MACHINES_DIR), setter(into))]
    machines_dir: PathBuf,

    /// The directory for host-side systemd-nspawn unit files.
    #[builder(default = PathBuf::from(DEFAULT_UNITS_DIR), setter(into))]
    units_dir: PathBuf,

    /// The directory for nestcore state.
    #[builder(default = PathBuf::from(DEFAULT_STATE_DIR), setter(into))]
    state_dir: PathBuf,

    /// The host bridge new containers are attached to.
    #[builder(default = DEFAULT_BRIDGE.to_string(), setter(into))]
    bridge: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NestcoreConfig {
    /// Builds a configuration from the process environment, falling back to defaults
    /// for anything unset.
    ///
    /// Consulted variables: `HOST`, `PORT`, `MACHINES_DIR`, `UNITS_DIR`, `STATE_DIR`.
    pub fn from_env() -> NestcoreResult<Self> {
        let config = NestcoreConfig {
            host: std::env::var(HOST_ENV_VAR).unwrap_or_else(|_| DEFAULT_HOST.to_string()),
            port: match std::env::var(PORT_ENV_VAR) {
                Result::Ok(raw) => raw.parse().map_err(|_| {
                    NestcoreError::Validation(format!("invalid {}: {}", PORT_ENV_VAR, raw))
                })?,
                Err(_) => DEFAULT_PORT,
            },
            machines_dir: env_path(MACHINES_DIR_ENV_VAR, DEFAULT_MACHINES_DIR),
            units_dir: env_path(UNITS_DIR_ENV_VAR, DEFAULT_UNITS_DIR),
            state_dir: env_path(STATE_DIR_ENV_VAR, DEFAULT_STATE_DIR),
            bridge: DEFAULT_BRIDGE.to_string(),
        };

        Ok(config)
    }

    /// Returns the path of the admin credentials file.
    pub fn admin_config_path(&self) -> PathBuf {
        self.state_dir.join(ADMIN_CONFIG_FILENAME)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn env_path(var: &str, default: &str) -> PathBuf {
    std::env::var_os(var)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
