//! Admin credentials file loading.

use std::path::Path;

use getset::Getters;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::{NestcoreError, NestcoreResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Admin credentials for the external HTTP surface, read once at startup.
///
/// nestcore only loads and hands these to the surface; password hashing and
/// verification happen outside the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct AdminCredentials {
    /// The admin username.
    username: String,

    /// The admin password hash, in whatever format the surface verifies.
    password_hash: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl AdminCredentials {
    /// Loads credentials from a YAML file.
    pub async fn load(path: impl AsRef<Path>) -> NestcoreResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(NestcoreError::NotFound(format!(
                "admin credentials file {}",
                path.display()
            )));
        }

        let contents = fs::read_to_string(path).await?;
        let credentials = serde_yaml::from_str(&contents)?;

        Ok(credentials)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
