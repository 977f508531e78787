//! Read-only host resource queries.

use std::{path::Path, sync::Arc};

use getset::Getters;
use serde::Serialize;
use sysinfo::System;

use crate::{
    config::{NestcoreConfig, FILE_OP_TIMEOUT},
    distro::normalize_arch,
    NestcoreError, NestcoreResult,
};

use super::{argv, CommandSpec, Invoke};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Read-only queries about the host nestcore runs on.
pub struct HostInspector {
    config: NestcoreConfig,
    invoker: Arc<dyn Invoke>,
}

/// A snapshot of host resources and container-relevant state.
#[derive(Debug, Clone, Serialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct HostInfo {
    /// Normalized host architecture, e.g. `amd64`.
    arch: String,

    /// The host's node name.
    hostname: String,

    /// Number of logical CPUs.
    cpu_count: usize,

    /// Total physical memory in MB.
    total_memory_mb: u64,

    /// Available memory in MB.
    available_memory_mb: u64,

    /// Total size of the filesystem holding the machines directory, in GB.
    disk_total_gb: f64,

    /// Available space of the filesystem holding the machines directory, in GB.
    disk_available_gb: f64,

    /// Seconds since boot.
    uptime_secs: u64,

    /// State of the container bridge.
    bridge: BridgeInfo,
}

/// State of the host bridge new containers attach to.
#[derive(Debug, Clone, Serialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct BridgeInfo {
    /// The bridge interface name.
    name: String,

    /// Whether the interface exists.
    present: bool,

    /// The bridge's IPv4 subnet in CIDR form, when one is assigned.
    ipv4_subnet: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HostInspector {
    /// Creates a new inspector.
    pub fn new(config: NestcoreConfig, invoker: Arc<dyn Invoke>) -> Self {
        Self { config, invoker }
    }

    /// Returns the normalized host architecture.
    pub fn arch(&self) -> NestcoreResult<String> {
        let uts = nix::sys::utsname::uname().map_err(|e| {
            NestcoreError::custom(anyhow::anyhow!("uname failed: {}", e))
        })?;

        Ok(normalize_arch(&uts.machine().to_string_lossy()))
    }

    /// Collects a full host snapshot.
    pub async fn info(&self) -> NestcoreResult<HostInfo> {
        let mut system = System::new_all();
        system.refresh_memory();

        let (disk_total_gb, disk_available_gb) = disk_stats(self.config.get_machines_dir())?;

        let bridge = self.bridge_info().await;

        Ok(HostInfo {
            arch: self.arch()?,
            hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
            cpu_count: system.cpus().len(),
            total_memory_mb: system.total_memory() / (1024 * 1024),
            available_memory_mb: system.available_memory() / (1024 * 1024),
            disk_total_gb,
            disk_available_gb,
            uptime_secs: System::uptime(),
            bridge,
        })
    }

    /// Returns bridge presence and subnet.
    pub async fn bridge_info(&self) -> BridgeInfo {
        let name = self.config.get_bridge().clone();
        let present = Path::new("/sys/class/net").join(&name).exists();

        let ipv4_subnet = if present {
            self.bridge_subnet(&name).await
        } else {
            None
        };

        BridgeInfo {
            name,
            present,
            ipv4_subnet,
        }
    }

    async fn bridge_subnet(&self, bridge: &str) -> Option<String> {
        let output = self
            .invoker
            .run(
                CommandSpec::builder()
                    .scope("host_inspector")
                    .argv(argv(&["ip", "-o", "-4", "addr", "show", "dev", bridge]))
                    .timeout(FILE_OP_TIMEOUT)
                    .build(),
            )
            .await
            .ok()?;

        if !output.success() {
            return None;
        }

        // `ip -o` prints one line per address: "4: br0    inet 10.0.0.1/24 ..."
        output
            .get_stdout()
            .split_whitespace()
            .skip_while(|token| *token != "inet")
            .nth(1)
            .map(|cidr| cidr.to_string())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn disk_stats(path: &Path) -> NestcoreResult<(f64, f64)> {
    // The machines directory may not exist yet on a fresh host.
    let probe = if path.exists() { path } else { Path::new("/") };

    let stats = nix::sys::statvfs::statvfs(probe)
        .map_err(|e| NestcoreError::custom(anyhow::anyhow!("statvfs failed: {}", e)))?;

    let frag = stats.fragment_size() as u64;
    let total = stats.blocks() as u64 * frag;
    let available = stats.blocks_available() as u64 * frag;
    let gb = 1024.0 * 1024.0 * 1024.0;

    Ok((total as f64 / gb, available as f64 / gb))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
