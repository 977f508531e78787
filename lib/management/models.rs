//! Database and observable models for nestcore containers.

use chrono::{DateTime, Utc};
use getset::Getters;
use serde::Serialize;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The authored part of a container record, persisted at creation time.
///
/// This is the spec echo: everything here was chosen by the caller and never
/// changes. Observed state (status, addresses, uptime) is re-queried from the
/// machine manager on every read.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Machine {
    /// The container name.
    pub name: String,

    /// The distribution the container was bootstrapped from, e.g. `debian:bookworm`.
    pub distro: String,

    /// CPU quota percentage (100 = one full core).
    pub cpu_quota_percent: i64,

    /// Memory cap in MB.
    pub memory_mb: i64,

    /// Disk quota in GB.
    pub disk_gb: i64,

    /// Whether SSH was installed at provisioning time.
    pub enable_ssh: bool,

    /// The IPv6 mode the container was provisioned with.
    pub ipv6_mode: String,

    /// When the container was created.
    pub created_at: DateTime<Utc>,
}

/// Observed machine status, as reported by the machine manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineStatus {
    /// The machine is running.
    Running,

    /// The machine exists on disk but is not running.
    Stopped,

    /// The machine manager reports the machine as degraded or failed.
    Failed,

    /// The state could not be determined.
    Unknown,
}

/// The observable state of an existing container.
///
/// Authored fields come from the metadata store (and are `None` for containers
/// nestcore did not create); observed fields are live queries.
#[derive(Debug, Clone, Serialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct ContainerRecord {
    /// The container name.
    name: String,

    /// The observed status.
    status: MachineStatus,

    /// The distribution, when known.
    distro: Option<String>,

    /// CPU quota percentage, when known.
    cpu_quota_percent: Option<i64>,

    /// Memory cap in MB, when known.
    memory_mb: Option<i64>,

    /// Disk quota in GB, when known.
    disk_gb: Option<i64>,

    /// The container's IPv4 address, when running.
    ipv4_address: Option<String>,

    /// The container's IPv6 address, when running.
    ipv6_address: Option<String>,

    /// When the container was created, when known.
    created_at: Option<DateTime<Utc>>,

    /// How long the container has been up, when running.
    uptime: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MachineStatus {
    /// Returns the lowercase wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }
}

impl ContainerRecord {
    /// Assembles a record from observed and authored parts.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        status: MachineStatus,
        machine: Option<&Machine>,
        ipv4_address: Option<String>,
        ipv6_address: Option<String>,
        uptime: Option<String>,
    ) -> Self {
        Self {
            name,
            status,
            distro: machine.map(|m| m.distro.clone()),
            cpu_quota_percent: machine.map(|m| m.cpu_quota_percent),
            memory_mb: machine.map(|m| m.memory_mb),
            disk_gb: machine.map(|m| m.disk_gb),
            ipv4_address,
            ipv6_address,
            created_at: machine.map(|m| m.created_at),
            uptime,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl std::fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
