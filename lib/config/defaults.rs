use std::{sync::LazyLock, time::Duration};

use regex::Regex;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default address the admin surface binds to.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// The default port the admin surface binds to.
pub const DEFAULT_PORT: u16 = 8080;

/// The default directory under which container root filesystems live.
pub const DEFAULT_MACHINES_DIR: &str = "/var/lib/machines";

/// The default directory for host-side systemd-nspawn unit files.
pub const DEFAULT_UNITS_DIR: &str = "/etc/systemd/nspawn";

/// The default directory for nestcore state (port forwards, metadata db, admin config).
pub const DEFAULT_STATE_DIR: &str = "/var/lib/nestcore";

/// The default host bridge new containers are attached to.
pub const DEFAULT_BRIDGE: &str = "br0";

/// The default CPU quota percentage (100 = one full core).
pub const DEFAULT_CPU_QUOTA_PERCENT: u32 = 100;

/// The default memory cap in MB.
pub const DEFAULT_MEMORY_MB: u32 = 512;

/// The default disk quota in GB.
pub const DEFAULT_DISK_GB: u32 = 10;

/// The nameservers written into a freshly bootstrapped guest.
pub const DNS_SERVERS: [&str; 2] = ["8.8.8.8", "1.1.1.1"];

/// Timeout for the root filesystem bootstrap tool.
pub const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(1800);

/// Timeout for in-guest package installation.
pub const PACKAGE_INSTALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Timeout for machine-manager operations.
pub const MACHINE_OP_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for firewall operations.
pub const FIREWALL_OP_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for generic file operations run through the invoker.
pub const FILE_OP_TIMEOUT: Duration = Duration::from_secs(5);

/// Graceful stop timeout (T1).
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Signal-based stop timeout (T2).
pub const DEFAULT_FORCE_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a freshly started machine is given to report `running`.
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(5);

/// How long terminal creation jobs are retained before being reaped.
pub const DEFAULT_JOB_TTL: Duration = Duration::from_secs(300);

/// Pattern a container name must match.
pub static CONTAINER_NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][a-z0-9-]{0,62}$").expect("container name pattern is valid")
});

/// The minimum root password length.
pub const MIN_ROOT_PASSWORD_LEN: usize = 8;

/// The valid range for the CPU quota percentage.
pub const CPU_QUOTA_PERCENT_RANGE: std::ops::RangeInclusive<u32> = 25..=400;

/// The valid range for the memory cap in MB.
pub const MEMORY_MB_RANGE: std::ops::RangeInclusive<u32> = 256..=8192;

/// The valid range for the disk quota in GB.
pub const DISK_GB_RANGE: std::ops::RangeInclusive<u32> = 5..=100;
