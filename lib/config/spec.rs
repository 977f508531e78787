//! Container provisioning specs.

use std::{fmt, str::FromStr};

use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::NestcoreError;

use super::{DEFAULT_CPU_QUOTA_PERCENT, DEFAULT_DISK_GB, DEFAULT_MEMORY_MB};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The input to container provisioning. Immutable once submitted.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub with_prefix")]
pub struct ContainerSpec {
    /// The container name. Lowercase, `^[a-z][a-z0-9-]{0,62}$`.
    #[builder(setter(into))]
    name: String,

    /// The distribution in `distro:release` form, e.g. `debian:bookworm`, `ubuntu:22.04`.
    #[builder(setter(into))]
    distro: String,

    /// The plaintext root password. Used exactly once during provisioning, then discarded.
    #[builder(setter(into))]
    root_password: String,

    /// CPU quota percentage, where 100 = one full core.
    #[builder(default = DEFAULT_CPU_QUOTA_PERCENT)]
    #[serde(default = "default_cpu_quota_percent")]
    cpu_quota_percent: u32,

    /// Memory cap in MB.
    #[builder(default = DEFAULT_MEMORY_MB)]
    #[serde(default = "default_memory_mb")]
    memory_mb: u32,

    /// Disk quota in GB.
    #[builder(default = DEFAULT_DISK_GB)]
    #[serde(default = "default_disk_gb")]
    disk_gb: u32,

    /// Whether to install and enable an SSH server inside the guest.
    #[builder(default = true)]
    #[serde(default = "default_enable_ssh")]
    enable_ssh: bool,

    /// The IPv6 connectivity mode for the guest.
    #[builder(default)]
    #[serde(default)]
    ipv6: Ipv6Mode,

    /// The WireGuard configuration blob. Required when `ipv6` is `wireguard`.
    #[builder(default, setter(strip_option, into))]
    #[serde(skip_serializing_if = "Option::is_none", default)]
    wireguard_config: Option<String>,
}

/// The IPv6 connectivity mode of a container.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Ipv6Mode {
    /// No IPv6 connectivity.
    #[default]
    Disabled,

    /// Native IPv6 via router advertisements on the bridge.
    Native,

    /// IPv6 through a 6in4 tunnel configured on the host.
    SixInFour,

    /// IPv6 through a WireGuard tunnel configured inside the guest.
    Wireguard,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ContainerSpec {
    /// Returns true if the guest should accept IPv6 router advertisements.
    pub fn wants_ipv6(&self) -> bool {
        self.ipv6 != Ipv6Mode::Disabled
    }
}

impl Ipv6Mode {
    /// Returns the wire name of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Native => "native",
            Self::SixInFour => "sixin4",
            Self::Wireguard => "wireguard",
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn default_cpu_quota_percent() -> u32 {
    DEFAULT_CPU_QUOTA_PERCENT
}

fn default_memory_mb() -> u32 {
    DEFAULT_MEMORY_MB
}

fn default_disk_gb() -> u32 {
    DEFAULT_DISK_GB
}

fn default_enable_ssh() -> bool {
    true
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Debug for ContainerSpec {
    /// Secrets are redacted; this is what ends up in logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerSpec")
            .field("name", &self.name)
            .field("distro", &self.distro)
            .field("root_password", &"<redacted>")
            .field("cpu_quota_percent", &self.cpu_quota_percent)
            .field("memory_mb", &self.memory_mb)
            .field("disk_gb", &self.disk_gb)
            .field("enable_ssh", &self.enable_ssh)
            .field("ipv6", &self.ipv6)
            .field(
                "wireguard_config",
                &self.wireguard_config.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

impl FromStr for Ipv6Mode {
    type Err = NestcoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disabled" => Result::Ok(Self::Disabled),
            "native" => Result::Ok(Self::Native),
            "sixin4" => Result::Ok(Self::SixInFour),
            "wireguard" => Result::Ok(Self::Wireguard),
            other => Err(NestcoreError::Validation(format!(
                "unknown ipv6 mode: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Ipv6Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for Ipv6Mode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Ipv6Mode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
