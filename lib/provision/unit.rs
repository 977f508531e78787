//! Host-side systemd-nspawn unit files.

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::{config::ContainerSpec, utils::unit_file_path, NestcoreError, NestcoreResult};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Renders the host-side unit file for a container.
///
/// The guest boots a full init, attaches to the host bridge over a virtual
/// ethernet pair, and gets `/dev/net/tun` plus `CAP_NET_ADMIN` so a WireGuard
/// tunnel can live entirely inside the guest. Resource caps are emitted
/// unconditionally; the disk quota is honored only on filesystems that
/// support it.
pub fn render_unit(spec: &ContainerSpec, bridge: &str) -> String {
    format!(
        "[Exec]\n\
         Boot=yes\n\
         Capability=CAP_NET_ADMIN\n\
         \n\
         [Network]\n\
         VirtualEthernet=yes\n\
         Bridge={bridge}\n\
         \n\
         [Files]\n\
         Bind=/dev/net/tun\n\
         \n\
         [Resource]\n\
         CPUQuota={cpu}%\n\
         MemoryMax={memory}M\n\
         DiskQuota={disk}G\n",
        bridge = bridge,
        cpu = spec.get_cpu_quota_percent(),
        memory = spec.get_memory_mb(),
        disk = spec.get_disk_gb(),
    )
}

/// Writes the unit file for a container, creating the units directory if needed.
pub async fn write_unit(
    units_dir: &Path,
    spec: &ContainerSpec,
    bridge: &str,
) -> NestcoreResult<PathBuf> {
    fs::create_dir_all(units_dir).await.map_err(|e| {
        NestcoreError::UnitFailed(format!("create {}: {}", units_dir.display(), e))
    })?;

    let path = unit_file_path(units_dir, spec.get_name());
    fs::write(&path, render_unit(spec, bridge))
        .await
        .map_err(|e| NestcoreError::UnitFailed(format!("write {}: {}", path.display(), e)))?;

    tracing::info!("wrote host unit file {}", path.display());

    Ok(path)
}

/// Removes the unit file for a container. Missing files are not an error.
pub async fn remove_unit(units_dir: &Path, name: &str) -> NestcoreResult<()> {
    let path = unit_file_path(units_dir, name);

    match fs::remove_file(&path).await {
        Result::Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(NestcoreError::UnitFailed(format!(
            "remove {}: {}",
            path.display(),
            e
        ))),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
