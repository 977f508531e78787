//! Mutations applied to a freshly bootstrapped root filesystem.
//!
//! Every change happens by writing files on the host side of the guest tree;
//! the guest is never booted for any of these. The two in-guest package
//! installs (SSH, WireGuard) run through `systemd-nspawn --quiet --register=no`
//! with the host's resolv.conf bind-mounted read-only so DNS works during apt.

use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use chrono::Utc;
use rand::Rng;
use sha_crypt::{sha512_crypt_b64, Sha512Params};
use tokio::fs;

use crate::{
    config::{DNS_SERVERS, PACKAGE_INSTALL_TIMEOUT},
    host::{argv, CommandSpec, Invoke},
    utils::{
        GUEST_NETWORK_UNIT_RELPATH, GUEST_WIREGUARD_CONFIG_RELPATH, SSH_INSTALL_SCRIPT_FILENAME,
        WIREGUARD_INSTALL_SCRIPT_FILENAME,
    },
    NestcoreError, NestcoreResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Salt length of generated shadow hashes.
const SHADOW_SALT_LEN: usize = 22;

/// The crypt base64 alphabet used for shadow salts.
const SHADOW_SALT_ALPHABET: &[u8] =
    b"./0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

const INSTALL_SSH_SCRIPT: &str = r#"#!/bin/bash
set -e
export DEBIAN_FRONTEND=noninteractive
apt-get update
apt-get install -y openssh-server
systemctl enable ssh
grep -qx 'PermitRootLogin yes' /etc/ssh/sshd_config || echo 'PermitRootLogin yes' >> /etc/ssh/sshd_config
grep -qx 'PasswordAuthentication yes' /etc/ssh/sshd_config || echo 'PasswordAuthentication yes' >> /etc/ssh/sshd_config
exit 0
"#;

const INSTALL_WIREGUARD_SCRIPT: &str = r#"#!/bin/bash
set -e
export DEBIAN_FRONTEND=noninteractive
apt-get update
apt-get install -y wireguard wireguard-tools
systemctl enable wg-quick@wg0
exit 0
"#;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Writes the root password into `<rootfs>/etc/shadow` using the direct-shadow method.
///
/// Confirms a `root:` entry exists in the guest passwd, generates a fresh
/// SHA-512 crypt hash, replaces the hash and last-change fields of the root
/// shadow entry (prepending a new entry if none exists), and writes the file
/// back with mode 0640, owned by root. The guest is never booted and no
/// in-guest password tooling is invoked.
pub async fn set_root_password(rootfs: &Path, password: &str) -> NestcoreResult<()> {
    let passwd_path = rootfs.join("etc/passwd");
    let passwd = fs::read_to_string(&passwd_path).await.map_err(|e| {
        NestcoreError::PasswordFailed(format!("cannot read {}: {}", passwd_path.display(), e))
    })?;

    if !passwd.lines().any(|line| line.starts_with("root:")) {
        return Err(NestcoreError::PasswordFailed(format!(
            "no root entry in {}",
            passwd_path.display()
        )));
    }

    let shadow_path = rootfs.join("etc/shadow");
    let shadow = match fs::read_to_string(&shadow_path).await {
        Result::Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            return Err(NestcoreError::PasswordFailed(format!(
                "cannot read {}: {}",
                shadow_path.display(),
                e
            )))
        }
    };

    let hash = sha512_shadow_hash(password)?;
    let days = Utc::now().timestamp() / 86_400;

    let updated = rewrite_shadow(&shadow, &hash, days);
    fs::write(&shadow_path, updated).await.map_err(|e| {
        NestcoreError::PasswordFailed(format!("cannot write {}: {}", shadow_path.display(), e))
    })?;

    fs::set_permissions(&shadow_path, std::fs::Permissions::from_mode(0o640))
        .await
        .map_err(|e| NestcoreError::PasswordFailed(format!("chmod shadow: {}", e)))?;

    if nix::unistd::geteuid().is_root() {
        nix::unistd::chown(
            &shadow_path,
            Some(nix::unistd::Uid::from_raw(0)),
            Some(nix::unistd::Gid::from_raw(0)),
        )
        .map_err(|e| NestcoreError::PasswordFailed(format!("chown shadow: {}", e)))?;
    }

    tracing::info!("root password written into {}", shadow_path.display());

    Ok(())
}

/// Points the guest at public nameservers.
///
/// A freshly bootstrapped guest often carries a dangling resolv.conf symlink;
/// it is replaced by a plain file.
pub async fn configure_dns(rootfs: &Path) -> NestcoreResult<()> {
    let resolv = rootfs.join("etc/resolv.conf");

    if let Result::Ok(metadata) = fs::symlink_metadata(&resolv).await {
        if metadata.file_type().is_symlink() {
            fs::remove_file(&resolv)
                .await
                .map_err(|e| NestcoreError::NetworkFailed(format!("unlink resolv.conf: {}", e)))?;
        }
    }

    let contents: String = DNS_SERVERS
        .iter()
        .map(|server| format!("nameserver {}\n", server))
        .collect();

    fs::write(&resolv, contents)
        .await
        .map_err(|e| NestcoreError::NetworkFailed(format!("write resolv.conf: {}", e)))?;

    Ok(())
}

/// Writes the guest networkd unit placing the container on the host bridge with
/// DHCP for IPv4, and enables systemd-networkd inside the guest.
pub async fn write_network_unit(rootfs: &Path, accept_ipv6: bool) -> NestcoreResult<()> {
    let unit_path = rootfs.join(GUEST_NETWORK_UNIT_RELPATH);
    let unit_dir = unit_path
        .parent()
        .ok_or_else(|| NestcoreError::NetworkFailed("network unit path has no parent".into()))?;

    fs::create_dir_all(unit_dir)
        .await
        .map_err(|e| NestcoreError::NetworkFailed(format!("create {}: {}", unit_dir.display(), e)))?;

    let mut unit = String::from("[Match]\nName=host0\n\n[Network]\nDHCP=yes\n");
    if accept_ipv6 {
        unit.push_str("IPv6AcceptRA=yes\n");
    }

    fs::write(&unit_path, unit)
        .await
        .map_err(|e| NestcoreError::NetworkFailed(format!("write network unit: {}", e)))?;

    enable_networkd(rootfs).await?;

    Ok(())
}

/// Installs and enables the SSH server inside the guest.
///
/// Stages a script under the guest `/tmp` and executes it through the
/// namespace-container tool in non-interactive, unregistered mode. The script
/// itself is idempotent: sshd_config lines are check-before-append.
pub async fn install_ssh(invoker: &dyn Invoke, rootfs: &Path) -> NestcoreResult<()> {
    run_guest_script(
        invoker,
        rootfs,
        SSH_INSTALL_SCRIPT_FILENAME,
        INSTALL_SSH_SCRIPT,
        "install_ssh",
    )
    .await
    .map_err(|e| match e {
        NestcoreError::Timeout { .. } => e,
        other => NestcoreError::SshFailed(other.to_string()),
    })
}

/// Writes the user-supplied WireGuard configuration and installs the tooling.
///
/// The config lands at `etc/wireguard/wg0.conf` with mode 0600 before any
/// package installation runs; `wg-quick@wg0` is enabled so the tunnel comes up
/// inside the guest at boot. Nothing is configured on the host side.
pub async fn configure_wireguard(
    invoker: &dyn Invoke,
    rootfs: &Path,
    config: &str,
) -> NestcoreResult<()> {
    let config_path = rootfs.join(GUEST_WIREGUARD_CONFIG_RELPATH);
    let config_dir = config_path
        .parent()
        .ok_or_else(|| NestcoreError::WireGuardFailed("wireguard path has no parent".into()))?;

    fs::create_dir_all(config_dir).await.map_err(|e| {
        NestcoreError::WireGuardFailed(format!("create {}: {}", config_dir.display(), e))
    })?;

    fs::write(&config_path, config)
        .await
        .map_err(|e| NestcoreError::WireGuardFailed(format!("write wg0.conf: {}", e)))?;

    fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600))
        .await
        .map_err(|e| NestcoreError::WireGuardFailed(format!("chmod wg0.conf: {}", e)))?;

    run_guest_script(
        invoker,
        rootfs,
        WIREGUARD_INSTALL_SCRIPT_FILENAME,
        INSTALL_WIREGUARD_SCRIPT,
        "configure_wireguard",
    )
    .await
    .map_err(|e| match e {
        NestcoreError::Timeout { .. } => e,
        other => NestcoreError::WireGuardFailed(other.to_string()),
    })
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn sha512_shadow_hash(password: &str) -> NestcoreResult<String> {
    let mut rng = rand::thread_rng();
    let salt: String = (0..SHADOW_SALT_LEN)
        .map(|_| SHADOW_SALT_ALPHABET[rng.gen_range(0..SHADOW_SALT_ALPHABET.len())] as char)
        .collect();

    let params = Sha512Params::default();
    let digest = sha512_crypt_b64(password.as_bytes(), salt.as_bytes(), &params)
        .map_err(|e| NestcoreError::PasswordFailed(format!("sha512-crypt failed: {:?}", e)))?;

    Ok(format!("$6${}${}", salt, digest))
}

/// Rewrites the root entry of a shadow file: field 2 becomes the hash, field 3
/// the day count. Other fields and all other entries are preserved. If no root
/// entry exists, one is prepended.
fn rewrite_shadow(shadow: &str, hash: &str, days: i64) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut replaced = false;

    for line in shadow.lines() {
        if line.starts_with("root:") {
            let mut fields: Vec<&str> = line.split(':').collect();
            while fields.len() < 9 {
                fields.push("");
            }
            let days_field = days.to_string();
            fields[1] = hash;
            fields[2] = &days_field;
            lines.push(fields.join(":"));
            replaced = true;
        } else {
            lines.push(line.to_string());
        }
    }

    if !replaced {
        lines.insert(0, format!("root:{}:{}:0:99999:7:::", hash, days));
    }

    let mut result = lines.join("\n");
    result.push('\n');
    result
}

async fn enable_networkd(rootfs: &Path) -> NestcoreResult<()> {
    let wants_dir = rootfs.join("etc/systemd/system/multi-user.target.wants");
    fs::create_dir_all(&wants_dir)
        .await
        .map_err(|e| NestcoreError::NetworkFailed(format!("create wants dir: {}", e)))?;

    let link = wants_dir.join("systemd-networkd.service");
    if fs::symlink_metadata(&link).await.is_err() {
        tokio::fs::symlink("/lib/systemd/system/systemd-networkd.service", &link)
            .await
            .map_err(|e| NestcoreError::NetworkFailed(format!("enable networkd: {}", e)))?;
    }

    Ok(())
}

async fn run_guest_script(
    invoker: &dyn Invoke,
    rootfs: &Path,
    script_name: &str,
    script: &str,
    scope: &str,
) -> NestcoreResult<()> {
    let script_path = stage_script(rootfs, script_name, script).await?;

    let mut nspawn_argv = argv(&[
        "systemd-nspawn",
        "--quiet",
        "--register=no",
        "-D",
    ]);
    nspawn_argv.push(rootfs.to_string_lossy().into_owned());
    nspawn_argv.push("--bind-ro=/etc/resolv.conf".to_string());
    nspawn_argv.push(format!("/tmp/{}", script_name));

    let result = invoker
        .run(
            CommandSpec::builder()
                .scope(scope)
                .argv(nspawn_argv)
                .timeout(PACKAGE_INSTALL_TIMEOUT)
                .build(),
        )
        .await;

    // The staged script is always removed, even when the install failed.
    let _ = fs::remove_file(&script_path).await;

    let output = result?;
    if !output.success() {
        return Err(NestcoreError::HostError {
            command: "systemd-nspawn".to_string(),
            exit_code: *output.get_exit_code(),
            stderr: output.stderr_tail(),
        });
    }

    Ok(())
}

async fn stage_script(rootfs: &Path, name: &str, contents: &str) -> NestcoreResult<PathBuf> {
    let tmp_dir = rootfs.join("tmp");
    fs::create_dir_all(&tmp_dir).await?;
    fs::set_permissions(&tmp_dir, std::fs::Permissions::from_mode(0o1777)).await?;

    let script_path = tmp_dir.join(name);
    fs::write(&script_path, contents).await?;
    fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).await?;

    Ok(script_path)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sha_crypt::sha512_check;
    use tempfile::TempDir;

    use crate::host::mock::MockInvoker;

    use super::*;

    mod fixtures {
        use super::*;

        pub fn rootfs_skeleton() -> anyhow::Result<TempDir> {
            let dir = TempDir::new()?;
            std::fs::create_dir_all(dir.path().join("etc"))?;
            std::fs::write(
                dir.path().join("etc/passwd"),
                "root:x:0:0:root:/root:/bin/bash\ndaemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin\n",
            )?;
            std::fs::write(
                dir.path().join("etc/shadow"),
                "root:*:19000:0:99999:7:::\ndaemon:*:19000:0:99999:7:::\n",
            )?;
            Ok(dir)
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_rootfs_set_root_password_layout() -> anyhow::Result<()> {
        let rootfs = fixtures::rootfs_skeleton()?;
        set_root_password(rootfs.path(), "hunter2!").await?;

        let shadow = std::fs::read_to_string(rootfs.path().join("etc/shadow"))?;
        let root_line = shadow
            .lines()
            .find(|line| line.starts_with("root:"))
            .expect("root entry should exist");

        let fields: Vec<&str> = root_line.split(':').collect();
        assert_eq!(fields.len(), 9);

        // root:$6$<22-char-salt>$<86-char-hash>:<days>:0:99999:7:::
        let hash_parts: Vec<&str> = fields[1].split('$').collect();
        assert_eq!(hash_parts[1], "6");
        assert_eq!(hash_parts[2].len(), 22);
        assert_eq!(hash_parts[3].len(), 86);

        let days: i64 = fields[2].parse()?;
        assert_eq!(days, Utc::now().timestamp() / 86_400);
        assert_eq!(&fields[3..], &["0", "99999", "7", "", "", ""]);

        // The daemon entry is untouched.
        assert!(shadow.contains("daemon:*:19000:0:99999:7:::"));

        let mode = std::fs::metadata(rootfs.path().join("etc/shadow"))?
            .permissions()
            .mode();
        assert_eq!(mode & 0o7777, 0o640);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_rootfs_password_round_trip() -> anyhow::Result<()> {
        let rootfs = fixtures::rootfs_skeleton()?;
        set_root_password(rootfs.path(), "hunter2!").await?;

        let shadow = std::fs::read_to_string(rootfs.path().join("etc/shadow"))?;
        let root_line = shadow.lines().find(|l| l.starts_with("root:")).unwrap();
        let hash = root_line.split(':').nth(1).unwrap();

        assert!(sha512_check("hunter2!", hash).is_ok());
        assert!(sha512_check("not-the-password", hash).is_err());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_rootfs_password_prepends_missing_root_entry() -> anyhow::Result<()> {
        let rootfs = fixtures::rootfs_skeleton()?;
        std::fs::write(
            rootfs.path().join("etc/shadow"),
            "daemon:*:19000:0:99999:7:::\n",
        )?;

        set_root_password(rootfs.path(), "hunter2!").await?;

        let shadow = std::fs::read_to_string(rootfs.path().join("etc/shadow"))?;
        assert!(shadow.starts_with("root:$6$"));
        assert!(shadow.contains("daemon:*"));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_rootfs_password_requires_passwd_entry() -> anyhow::Result<()> {
        let rootfs = fixtures::rootfs_skeleton()?;
        std::fs::write(rootfs.path().join("etc/passwd"), "daemon:x:1:1::/:/bin/false\n")?;

        let result = set_root_password(rootfs.path(), "hunter2!").await;
        assert!(matches!(result, Err(NestcoreError::PasswordFailed(_))));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_rootfs_configure_dns_replaces_symlink() -> anyhow::Result<()> {
        let rootfs = fixtures::rootfs_skeleton()?;
        let resolv = rootfs.path().join("etc/resolv.conf");
        std::os::unix::fs::symlink("../run/systemd/resolve/stub-resolv.conf", &resolv)?;

        configure_dns(rootfs.path()).await?;

        let metadata = std::fs::symlink_metadata(&resolv)?;
        assert!(metadata.file_type().is_file());

        let contents = std::fs::read_to_string(&resolv)?;
        assert_eq!(contents, "nameserver 8.8.8.8\nnameserver 1.1.1.1\n");

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_rootfs_network_unit_contents() -> anyhow::Result<()> {
        let rootfs = fixtures::rootfs_skeleton()?;
        write_network_unit(rootfs.path(), true).await?;

        let unit = std::fs::read_to_string(rootfs.path().join(GUEST_NETWORK_UNIT_RELPATH))?;
        assert!(unit.contains("[Match]\nName=host0"));
        assert!(unit.contains("DHCP=yes"));
        assert!(unit.contains("IPv6AcceptRA=yes"));

        let link = rootfs
            .path()
            .join("etc/systemd/system/multi-user.target.wants/systemd-networkd.service");
        assert!(std::fs::symlink_metadata(link)?.file_type().is_symlink());

        // Without IPv6 the RA line is absent.
        let rootfs = fixtures::rootfs_skeleton()?;
        write_network_unit(rootfs.path(), false).await?;
        let unit = std::fs::read_to_string(rootfs.path().join(GUEST_NETWORK_UNIT_RELPATH))?;
        assert!(!unit.contains("IPv6AcceptRA"));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_rootfs_install_ssh_invocation() -> anyhow::Result<()> {
        let rootfs = fixtures::rootfs_skeleton()?;
        let invoker = Arc::new(MockInvoker::new());

        install_ssh(invoker.as_ref(), rootfs.path()).await?;

        let calls = invoker.calls_matching("install_ssh.sh");
        assert_eq!(calls.len(), 1);
        let joined = calls[0].join(" ");
        assert!(joined.starts_with("systemd-nspawn --quiet --register=no -D"));
        assert!(joined.contains("--bind-ro=/etc/resolv.conf"));

        // The staged script is removed after the run.
        assert!(!rootfs.path().join("tmp/install_ssh.sh").exists());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_rootfs_install_ssh_failure_is_ssh_failed() -> anyhow::Result<()> {
        let rootfs = fixtures::rootfs_skeleton()?;
        let invoker = Arc::new(MockInvoker::new());
        invoker.respond("install_ssh.sh", 1, "", "E: Unable to locate package");

        let result = install_ssh(invoker.as_ref(), rootfs.path()).await;
        match result {
            Err(NestcoreError::SshFailed(message)) => {
                assert!(message.contains("Unable to locate package"));
            }
            other => panic!("expected SshFailed, got {:?}", other),
        }

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_rootfs_configure_wireguard_writes_config() -> anyhow::Result<()> {
        let rootfs = fixtures::rootfs_skeleton()?;
        let invoker = Arc::new(MockInvoker::new());
        let config = "[Interface]\nPrivateKey=abc\nAddress=fd00::2/64\n";

        configure_wireguard(invoker.as_ref(), rootfs.path(), config).await?;

        let config_path = rootfs.path().join(GUEST_WIREGUARD_CONFIG_RELPATH);
        assert_eq!(std::fs::read_to_string(&config_path)?, config);

        let mode = std::fs::metadata(&config_path)?.permissions().mode();
        assert_eq!(mode & 0o7777, 0o600);

        assert_eq!(invoker.calls_matching("install_wg.sh").len(), 1);

        Ok(())
    }

    #[test]
    fn test_rootfs_rewrite_shadow_preserves_other_fields() {
        let shadow = "root:oldhash:18000:5:88888:6:2::\nuser:*:19000:0:99999:7:::\n";
        let updated = rewrite_shadow(shadow, "$6$salt$hash", 20000);

        let root_line = updated.lines().next().unwrap();
        assert_eq!(root_line, "root:$6$salt$hash:20000:5:88888:6:2::");
        assert!(updated.contains("user:*:19000:0:99999:7:::"));
    }
}
