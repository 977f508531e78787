use std::path::{Path, PathBuf};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The filename of the persistent port-forward rule store.
pub const PORT_FORWARDS_FILENAME: &str = "port_forwards.json";

/// The filename of the container metadata database.
pub const MACHINE_DB_FILENAME: &str = "machines.db";

/// The filename of the admin credentials file.
pub const ADMIN_CONFIG_FILENAME: &str = "admin.yaml";

/// The file extension of host-side container unit files.
pub const NSPAWN_UNIT_EXTENSION: &str = "nspawn";

/// The path of the guest networkd unit, relative to the guest root.
pub const GUEST_NETWORK_UNIT_RELPATH: &str = "etc/systemd/network/80-container-host0.network";

/// The path of the guest WireGuard configuration, relative to the guest root.
pub const GUEST_WIREGUARD_CONFIG_RELPATH: &str = "etc/wireguard/wg0.conf";

/// The filename of the staged SSH install script inside the guest `/tmp`.
pub const SSH_INSTALL_SCRIPT_FILENAME: &str = "install_ssh.sh";

/// The filename of the staged WireGuard install script inside the guest `/tmp`.
pub const WIREGUARD_INSTALL_SCRIPT_FILENAME: &str = "install_wg.sh";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the path of the host-side unit file for a container.
pub fn unit_file_path(units_dir: impl AsRef<Path>, name: &str) -> PathBuf {
    units_dir
        .as_ref()
        .join(format!("{}.{}", name, NSPAWN_UNIT_EXTENSION))
}

/// Returns the root filesystem directory of a container.
pub fn machine_root_path(machines_dir: impl AsRef<Path>, name: &str) -> PathBuf {
    machines_dir.as_ref().join(name)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
