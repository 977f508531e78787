use crate::{NestcoreError, NestcoreResult};

use super::{
    ContainerSpec, Ipv6Mode, CONTAINER_NAME_PATTERN, CPU_QUOTA_PERCENT_RANGE, DISK_GB_RANGE,
    MEMORY_MB_RANGE, MIN_ROOT_PASSWORD_LEN,
};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ContainerSpec {
    /// Performs comprehensive validation of the container spec.
    ///
    /// All violations are collected so the caller sees every problem at once.
    /// Catalog membership of the distribution is not checked here; an unknown
    /// distribution fails fast at the top of the provisioning pipeline instead.
    pub fn validate(&self) -> NestcoreResult<()> {
        let mut errors = Vec::new();

        if !CONTAINER_NAME_PATTERN.is_match(self.get_name()) {
            errors.push(format!(
                "name '{}' must match {}",
                self.get_name(),
                CONTAINER_NAME_PATTERN.as_str()
            ));
        }

        self.validate_distro_shape(&mut errors);

        if self.get_root_password().len() < MIN_ROOT_PASSWORD_LEN {
            errors.push(format!(
                "root password must be at least {} characters",
                MIN_ROOT_PASSWORD_LEN
            ));
        }

        if !CPU_QUOTA_PERCENT_RANGE.contains(self.get_cpu_quota_percent()) {
            errors.push(format!(
                "cpu quota {}% outside {}..={}",
                self.get_cpu_quota_percent(),
                CPU_QUOTA_PERCENT_RANGE.start(),
                CPU_QUOTA_PERCENT_RANGE.end()
            ));
        }

        if !MEMORY_MB_RANGE.contains(self.get_memory_mb()) {
            errors.push(format!(
                "memory {}MB outside {}..={}",
                self.get_memory_mb(),
                MEMORY_MB_RANGE.start(),
                MEMORY_MB_RANGE.end()
            ));
        }

        if !DISK_GB_RANGE.contains(self.get_disk_gb()) {
            errors.push(format!(
                "disk {}GB outside {}..={}",
                self.get_disk_gb(),
                DISK_GB_RANGE.start(),
                DISK_GB_RANGE.end()
            ));
        }

        if *self.get_ipv6() == Ipv6Mode::Wireguard {
            let blob = self
                .get_wireguard_config()
                .as_deref()
                .map(str::trim)
                .unwrap_or_default();
            if blob.is_empty() {
                errors.push("ipv6 mode 'wireguard' requires a non-empty wireguard_config".into());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(NestcoreError::Validation(errors.join("\n")))
        }
    }

    /// Checks that the distribution string has the `distro:release` shape.
    fn validate_distro_shape(&self, errors: &mut Vec<String>) {
        match self.get_distro().split_once(':') {
            Some((name, release)) if !name.is_empty() && !release.is_empty() => {}
            _ => errors.push(format!(
                "distro '{}' must have the form '<distro>:<release>'",
                self.get_distro()
            )),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
