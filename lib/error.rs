//! `nestcore::error` is a module containing error types for the nestcore project.

use std::{
    error::Error,
    fmt::{self, Display},
    time::Duration,
};

use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a nestcore-related operation.
pub type NestcoreResult<T> = Result<T, NestcoreError>;

/// An error that occurred during a nestcore operation.
#[derive(Debug, Error)]
pub enum NestcoreError {
    /// A container spec failed validation.
    #[error("invalid container spec: {0}")]
    Validation(String),

    /// A container, job, or machine directory with the same name already exists.
    #[error("name conflict: {0}")]
    NameConflict(String),

    /// The requested distribution or architecture is not in the catalog.
    #[error("unsupported distribution or architecture: {0}")]
    Unsupported(String),

    /// The root filesystem bootstrap tool failed.
    #[error("bootstrap failed: {0}")]
    BootstrapFailed(String),

    /// Writing the root password into the guest shadow file failed.
    #[error("root password setup failed: {0}")]
    PasswordFailed(String),

    /// Guest network configuration failed.
    #[error("network configuration failed: {0}")]
    NetworkFailed(String),

    /// SSH server installation inside the guest failed.
    #[error("ssh installation failed: {0}")]
    SshFailed(String),

    /// WireGuard configuration or installation inside the guest failed.
    #[error("wireguard configuration failed: {0}")]
    WireGuardFailed(String),

    /// Writing the host-side unit file failed.
    #[error("host unit file write failed: {0}")]
    UnitFailed(String),

    /// The container could not be started.
    #[error("container start failed: {0}")]
    StartFailed(String),

    /// The container could not be stopped.
    #[error("container stop failed: {0}")]
    StopFailed(String),

    /// The container could not be deleted.
    #[error("container delete failed: {0}")]
    DeleteFailed(String),

    /// A port-forward rule conflicts with an existing rule.
    #[error("port forward rule conflict: {0}")]
    RuleConflict(String),

    /// An external command exceeded its timeout and was killed.
    #[error("command `{command}` timed out after {timeout:?}")]
    Timeout {
        /// The program that was being executed.
        command: String,

        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// An underlying privileged command returned a non-zero exit status.
    #[error("host command `{command}` failed with exit code {exit_code:?}: {stderr}")]
    HostError {
        /// The program that was being executed.
        command: String,

        /// The exit code of the command, if it exited normally.
        exit_code: Option<i32>,

        /// The tail of the captured stderr.
        stderr: String,
    },

    /// The requested container or rule does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An error that occurred when performing an IO operation.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that occurred in the metadata database.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An error that occurred serializing or deserializing JSON state.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error that occurred parsing a YAML configuration file.
    #[error("config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Custom error.
    #[error("custom error: {0}")]
    Custom(#[from] AnyError),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NestcoreError {
    /// Creates a new `NestcoreError` from any error.
    pub fn custom(error: impl Into<anyhow::Error>) -> NestcoreError {
        NestcoreError::Custom(AnyError {
            error: error.into(),
        })
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `NestcoreResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> NestcoreResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}
