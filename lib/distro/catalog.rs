//! Maps `(distro, release, arch)` to a bootstrap plan.

use std::fmt;

use getset::Getters;

use crate::{NestcoreError, NestcoreResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The Debian-family bootstrap tool.
pub const DEBOOTSTRAP: &str = "debootstrap";

/// The Debian mirror, identical for all architectures.
pub const DEBIAN_MIRROR: &str = "http://deb.debian.org/debian";

/// The Ubuntu mirror for amd64.
pub const UBUNTU_MIRROR: &str = "http://archive.ubuntu.com/ubuntu";

/// The Ubuntu ports mirror, used for arm64.
pub const UBUNTU_PORTS_MIRROR: &str = "http://ports.ubuntu.com/ubuntu-ports";

/// Ubuntu release number to suite codename mapping.
const UBUNTU_SUITES: [(&str, &str); 3] = [
    ("24.04", "noble"),
    ("22.04", "jammy"),
    ("20.04", "focal"),
];

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A distribution known to the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distro {
    /// Debian.
    Debian,

    /// Ubuntu.
    Ubuntu,
}

/// A fully resolved bootstrap plan for one container.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct DistroTarget {
    /// The distribution family.
    distro: Distro,

    /// The suite codename the bootstrap tool consumes, e.g. `bookworm`, `jammy`.
    suite: String,

    /// The normalized architecture, e.g. `amd64`, `arm64`.
    arch: String,

    /// The mirror URL the bootstrap tool downloads from.
    mirror: String,

    /// The bootstrap tool to invoke.
    bootstrap_tool: &'static str,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Normalizes a raw machine architecture string.
///
/// `x86_64`/`amd64` map to `amd64`, `aarch64`/`arm64` map to `arm64`; anything
/// else passes through unchanged.
pub fn normalize_arch(raw: &str) -> String {
    match raw {
        "x86_64" | "amd64" => "amd64".to_string(),
        "aarch64" | "arm64" => "arm64".to_string(),
        other => other.to_string(),
    }
}

/// Resolves a `distro:release` string and a normalized architecture into a bootstrap plan.
///
/// Distributions outside the catalog (arch Linux in particular) are rejected here
/// so provisioning fails at the top of the pipeline, not halfway through.
pub fn resolve(distro_spec: &str, arch: &str) -> NestcoreResult<DistroTarget> {
    let (name, release) = distro_spec.split_once(':').ok_or_else(|| {
        NestcoreError::Unsupported(format!(
            "distro '{}' must have the form '<distro>:<release>'",
            distro_spec
        ))
    })?;

    match name {
        "debian" => Ok(DistroTarget {
            distro: Distro::Debian,
            suite: release.to_string(),
            arch: arch.to_string(),
            mirror: DEBIAN_MIRROR.to_string(),
            bootstrap_tool: DEBOOTSTRAP,
        }),
        "ubuntu" => Ok(DistroTarget {
            distro: Distro::Ubuntu,
            suite: ubuntu_suite(release),
            arch: arch.to_string(),
            mirror: ubuntu_mirror(arch).to_string(),
            bootstrap_tool: DEBOOTSTRAP,
        }),
        other => Err(NestcoreError::Unsupported(format!(
            "distribution '{}' is not supported",
            other
        ))),
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn ubuntu_mirror(arch: &str) -> &'static str {
    if arch == "arm64" {
        UBUNTU_PORTS_MIRROR
    } else {
        UBUNTU_MIRROR
    }
}

fn ubuntu_suite(release: &str) -> String {
    UBUNTU_SUITES
        .iter()
        .find(|(number, _)| *number == release)
        .map(|(_, suite)| suite.to_string())
        .unwrap_or_else(|| release.to_string())
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for Distro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debian => write!(f, "debian"),
            Self::Ubuntu => write!(f, "ubuntu"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_normalize_arch() {
        assert_eq!(normalize_arch("x86_64"), "amd64");
        assert_eq!(normalize_arch("amd64"), "amd64");
        assert_eq!(normalize_arch("aarch64"), "arm64");
        assert_eq!(normalize_arch("arm64"), "arm64");
        assert_eq!(normalize_arch("riscv64"), "riscv64");
    }

    #[test]
    fn test_catalog_debian_any_arch() -> anyhow::Result<()> {
        for arch in ["amd64", "arm64"] {
            let target = resolve("debian:bookworm", arch)?;
            assert_eq!(*target.get_distro(), Distro::Debian);
            assert_eq!(target.get_suite(), "bookworm");
            assert_eq!(target.get_mirror(), DEBIAN_MIRROR);
            assert_eq!(*target.get_bootstrap_tool(), DEBOOTSTRAP);
        }

        Ok(())
    }

    #[test]
    fn test_catalog_ubuntu_mirror_by_arch() -> anyhow::Result<()> {
        let target = resolve("ubuntu:22.04", "arm64")?;
        assert_eq!(target.get_mirror(), UBUNTU_PORTS_MIRROR);
        assert_eq!(target.get_suite(), "jammy");

        let target = resolve("ubuntu:22.04", "amd64")?;
        assert_eq!(target.get_mirror(), UBUNTU_MIRROR);

        Ok(())
    }

    #[test]
    fn test_catalog_ubuntu_suite_map() -> anyhow::Result<()> {
        assert_eq!(resolve("ubuntu:24.04", "amd64")?.get_suite(), "noble");
        assert_eq!(resolve("ubuntu:22.04", "amd64")?.get_suite(), "jammy");
        assert_eq!(resolve("ubuntu:20.04", "amd64")?.get_suite(), "focal");

        // Unknown releases pass through so pre-release suites still work.
        assert_eq!(resolve("ubuntu:devel", "amd64")?.get_suite(), "devel");

        Ok(())
    }

    #[test]
    fn test_catalog_rejects_unsupported_distro() {
        assert!(matches!(
            resolve("arch:latest", "amd64"),
            Err(NestcoreError::Unsupported(_))
        ));
        assert!(matches!(
            resolve("fedora:40", "amd64"),
            Err(NestcoreError::Unsupported(_))
        ));
        assert!(matches!(
            resolve("debian", "amd64"),
            Err(NestcoreError::Unsupported(_))
        ));
    }
}
