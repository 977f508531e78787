//! Machinectl-backed container lifecycle operations.
//!
//! All verbs are idempotent where the target state permits, and operations on
//! the same container serialize under a per-name lock. Observed state is always
//! re-queried from the machine manager; only the authored spec echo comes from
//! the metadata store.

use std::{
    collections::{HashMap, HashSet},
    net::Ipv4Addr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::{fs, sync::Mutex, time::Instant};
use typed_builder::TypedBuilder;

use crate::{
    config::{
        NestcoreConfig, DEFAULT_FORCE_STOP_TIMEOUT, DEFAULT_START_TIMEOUT, DEFAULT_STOP_TIMEOUT,
        MACHINE_OP_TIMEOUT,
    },
    host::{argv, CommandSpec, Invoke},
    network::ResolveAddress,
    provision::remove_unit,
    utils::machine_root_path,
    NestcoreError, NestcoreResult,
};

use super::{ContainerRecord, MachineStatus, MachineStore};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Lifecycle operations for existing containers.
#[derive(TypedBuilder)]
pub struct LifecycleController {
    /// Host configuration.
    config: NestcoreConfig,

    /// The invoker all machinectl calls go through.
    invoker: Arc<dyn Invoke>,

    /// Optional metadata store supplying the authored part of records.
    #[builder(default)]
    store: Option<Arc<MachineStore>>,

    /// Per-name serialization locks.
    #[builder(default, setter(skip))]
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,

    /// Graceful stop timeout (T1).
    #[builder(default = DEFAULT_STOP_TIMEOUT)]
    stop_timeout: Duration,

    /// Signal-based stop timeout (T2).
    #[builder(default = DEFAULT_FORCE_STOP_TIMEOUT)]
    force_stop_timeout: Duration,

    /// How long a started machine may take to report `running`.
    #[builder(default = DEFAULT_START_TIMEOUT)]
    start_timeout: Duration,

    /// State poll interval.
    #[builder(default = Duration::from_millis(500))]
    poll_interval: Duration,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LifecycleController {
    /// Starts the machine if not already running. Succeeds once the final state
    /// is `running`.
    pub async fn start(&self, name: &str) -> NestcoreResult<()> {
        let guard = self.name_lock(name).await;
        let _guard = guard.lock().await;
        self.start_locked(name).await
    }

    /// Gracefully stops the machine. Succeeds once the final state is `stopped`.
    pub async fn stop(&self, name: &str) -> NestcoreResult<()> {
        let guard = self.name_lock(name).await;
        let _guard = guard.lock().await;
        self.stop_locked(name).await
    }

    /// Signal-based stop for unresponsive machines.
    pub async fn force_stop(&self, name: &str) -> NestcoreResult<()> {
        let guard = self.name_lock(name).await;
        let _guard = guard.lock().await;

        if self.status(name).await? != MachineStatus::Running {
            return Ok(());
        }

        let output = self
            .machinectl(&["terminate", name], "force_stop")
            .await?;
        if !output.success() {
            return Err(NestcoreError::StopFailed(format!(
                "machinectl terminate {}: {}",
                name,
                output.stderr_tail()
            )));
        }

        self.await_status(name, MachineStatus::Stopped, self.force_stop_timeout)
            .await
            .map_err(|_| {
                NestcoreError::StopFailed(format!(
                    "{} still running {}s after terminate",
                    name,
                    self.force_stop_timeout.as_secs()
                ))
            })
    }

    /// Stops (when running) and starts the machine.
    pub async fn restart(&self, name: &str) -> NestcoreResult<()> {
        let guard = self.name_lock(name).await;
        let _guard = guard.lock().await;

        self.stop_locked(name).await?;
        self.start_locked(name).await
    }

    /// Deletes the container: stops it (ignoring failures when it is already
    /// down), removes the host unit file, the root filesystem directory, and
    /// the authored record. Fails only if the directory cannot be removed.
    pub async fn delete(&self, name: &str) -> NestcoreResult<()> {
        let guard = self.name_lock(name).await;
        let _guard = guard.lock().await;

        if let Err(e) = self.stop_locked(name).await {
            tracing::warn!("ignoring stop failure while deleting {}: {}", name, e);
        }

        if let Err(e) = remove_unit(self.config.get_units_dir(), name).await {
            tracing::warn!("ignoring unit file removal failure for {}: {}", name, e);
        }

        let rootfs = self.rootfs(name);
        match fs::remove_dir_all(&rootfs).await {
            Result::Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(NestcoreError::DeleteFailed(format!(
                    "remove {}: {}",
                    rootfs.display(),
                    e
                )))
            }
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.remove(name).await {
                tracing::warn!("ignoring metadata removal failure for {}: {}", name, e);
            }
        }

        tracing::info!("container {} deleted", name);

        Ok(())
    }

    /// Lists all containers by reconciling the machines directory with the
    /// machine manager's live list.
    pub async fn list(&self) -> NestcoreResult<Vec<ContainerRecord>> {
        let running = self.running_machines().await;

        let mut records = Vec::new();
        let mut entries = match fs::read_dir(self.config.get_machines_dir()).await {
            Result::Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            let status = if running.contains(&name) {
                MachineStatus::Running
            } else {
                MachineStatus::Stopped
            };

            let machine = match &self.store {
                Some(store) => store.get(&name).await.unwrap_or(None),
                None => None,
            };

            records.push(ContainerRecord::new(
                name,
                status,
                machine.as_ref(),
                None,
                None,
                None,
            ));
        }

        records.sort_by(|a, b| a.get_name().cmp(b.get_name()));

        Ok(records)
    }

    /// Returns the full record of one container, including live addresses and
    /// uptime when it is running.
    pub async fn inspect(&self, name: &str) -> NestcoreResult<ContainerRecord> {
        if !self.rootfs(name).exists() {
            return Err(NestcoreError::NotFound(format!("container '{}'", name)));
        }

        let status = self.status(name).await.unwrap_or(MachineStatus::Unknown);

        let (ipv4, ipv6, uptime) = if status == MachineStatus::Running {
            self.observed(name).await
        } else {
            (None, None, None)
        };

        let machine = match &self.store {
            Some(store) => store.get(name).await.unwrap_or(None),
            None => None,
        };

        Ok(ContainerRecord::new(
            name.to_string(),
            status,
            machine.as_ref(),
            ipv4,
            ipv6,
            uptime,
        ))
    }

    /// Returns the observed status of one container.
    pub async fn status(&self, name: &str) -> NestcoreResult<MachineStatus> {
        let output = self
            .machinectl(&["show", name, "--property=State"], "status")
            .await?;

        if output.success() {
            return Ok(parse_state(output.get_stdout()));
        }

        // Machines are registered only while running; an on-disk tree without a
        // registration is a stopped container.
        if self.rootfs(name).exists() {
            Ok(MachineStatus::Stopped)
        } else {
            Err(NestcoreError::NotFound(format!("container '{}'", name)))
        }
    }

    async fn start_locked(&self, name: &str) -> NestcoreResult<()> {
        if self.status(name).await? == MachineStatus::Running {
            return Ok(());
        }

        let output = self.machinectl(&["start", name], "start").await?;
        if !output.success() {
            return Err(NestcoreError::StartFailed(format!(
                "machinectl start {}: {}",
                name,
                output.stderr_tail()
            )));
        }

        self.await_status(name, MachineStatus::Running, self.start_timeout)
            .await
            .map_err(|_| {
                NestcoreError::StartFailed(format!(
                    "{} did not reach running state within {}s",
                    name,
                    self.start_timeout.as_secs()
                ))
            })?;

        tracing::info!("container {} started", name);

        Ok(())
    }

    async fn stop_locked(&self, name: &str) -> NestcoreResult<()> {
        if self.status(name).await? != MachineStatus::Running {
            return Ok(());
        }

        let output = self.machinectl(&["stop", name], "stop").await?;
        if !output.success() {
            return Err(NestcoreError::StopFailed(format!(
                "machinectl stop {}: {}",
                name,
                output.stderr_tail()
            )));
        }

        self.await_status(name, MachineStatus::Stopped, self.stop_timeout)
            .await
            .map_err(|_| {
                NestcoreError::StopFailed(format!(
                    "{} did not stop within {}s",
                    name,
                    self.stop_timeout.as_secs()
                ))
            })?;

        tracing::info!("container {} stopped", name);

        Ok(())
    }

    async fn await_status(
        &self,
        name: &str,
        want: MachineStatus,
        timeout: Duration,
    ) -> Result<(), ()> {
        let deadline = Instant::now() + timeout;

        loop {
            if self.status(name).await.map(|s| s == want).unwrap_or(false) {
                return Result::Ok(());
            }

            if Instant::now() >= deadline {
                return Err(());
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Parses live addresses and uptime for a running machine.
    async fn observed(&self, name: &str) -> (Option<String>, Option<String>, Option<String>) {
        let (mut ipv4, mut ipv6) = (None, None);

        if let Result::Ok(output) = self.machinectl(&["status", name], "inspect").await {
            if output.success() {
                (ipv4, ipv6) = parse_addresses(output.get_stdout());
            }
        }

        let mut uptime = None;
        if let Result::Ok(output) = self
            .machinectl(&["show", name, "--property=Timestamp"], "inspect")
            .await
        {
            if output.success() {
                uptime = output
                    .get_stdout()
                    .trim()
                    .strip_prefix("Timestamp=")
                    .and_then(parse_timestamp)
                    .map(|since| humanize(Utc::now() - since));
            }
        }

        (ipv4, ipv6, uptime)
    }

    async fn running_machines(&self) -> HashSet<String> {
        let mut running = HashSet::new();

        match self
            .machinectl(&["list", "--no-legend"], "list")
            .await
        {
            Result::Ok(output) if output.success() => {
                for line in output.get_stdout().lines() {
                    if let Some(name) = line.split_whitespace().next() {
                        running.insert(name.to_string());
                    }
                }
            }
            _ => {
                tracing::warn!("machinectl list failed; falling back to directory scan only");
            }
        }

        running
    }

    async fn machinectl(
        &self,
        args: &[&str],
        scope: &str,
    ) -> NestcoreResult<crate::host::CommandOutput> {
        let mut full = argv(&["machinectl"]);
        full.extend(args.iter().map(|arg| arg.to_string()));

        self.invoker
            .run(
                CommandSpec::builder()
                    .scope(scope)
                    .argv(full)
                    .timeout(MACHINE_OP_TIMEOUT)
                    .build(),
            )
            .await
    }

    async fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn rootfs(&self, name: &str) -> PathBuf {
        machine_root_path(self.config.get_machines_dir(), name)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn parse_state(stdout: &str) -> MachineStatus {
    match stdout.trim().strip_prefix("State=") {
        Some("running") => MachineStatus::Running,
        Some("degraded") | Some("failed") => MachineStatus::Failed,
        Some(_) => MachineStatus::Unknown,
        None => MachineStatus::Unknown,
    }
}

/// Extracts the first IPv4 and IPv6 address from `machinectl status` output.
fn parse_addresses(stdout: &str) -> (Option<String>, Option<String>) {
    let mut ipv4 = None;
    let mut ipv6 = None;
    let mut in_addresses = false;

    for line in stdout.lines() {
        let trimmed = line.trim();

        if let Some(rest) = trimmed
            .strip_prefix("Addresses:")
            .or_else(|| trimmed.strip_prefix("Address:"))
        {
            in_addresses = true;
            classify_tokens(rest, &mut ipv4, &mut ipv6);
            continue;
        }

        if in_addresses {
            // Continuation lines carry bare addresses; any labelled line ends the block.
            if trimmed.contains(": ") || trimmed.ends_with(':') || trimmed.is_empty() {
                break;
            }
            classify_tokens(trimmed, &mut ipv4, &mut ipv6);
        }
    }

    (ipv4, ipv6)
}

fn classify_tokens(text: &str, ipv4: &mut Option<String>, ipv6: &mut Option<String>) {
    for token in text.split_whitespace() {
        if ipv4.is_none() && token.parse::<Ipv4Addr>().is_ok() {
            *ipv4 = Some(token.to_string());
        } else if ipv6.is_none() && token.contains(':') && token.parse::<std::net::Ipv6Addr>().is_ok()
        {
            *ipv6 = Some(token.to_string());
        }
    }
}

/// Parses a machinectl `Timestamp=` value like `Tue 2024-01-02 03:04:05 UTC`.
/// Only UTC values are handled; anything else yields no uptime.
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let tokens: Vec<&str> = value.split_whitespace().collect();
    if tokens.len() < 4 || tokens[3] != "UTC" {
        return None;
    }

    NaiveDateTime::parse_from_str(&format!("{} {}", tokens[1], tokens[2]), "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

fn humanize(duration: chrono::Duration) -> String {
    let minutes = duration.num_minutes().max(0);
    let (days, hours, mins) = (minutes / 1440, (minutes % 1440) / 60, minutes % 60);

    if days > 0 {
        format!("{}d {}h {}m", days, hours, mins)
    } else if hours > 0 {
        format!("{}h {}m", hours, mins)
    } else {
        format!("{}m", mins)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ResolveAddress for LifecycleController {
    async fn ipv4_address(&self, name: &str) -> NestcoreResult<Ipv4Addr> {
        let record = self.inspect(name).await?;

        let address = record.get_ipv4_address().as_deref().ok_or_else(|| {
            NestcoreError::NotFound(format!("no IPv4 address for container '{}'", name))
        })?;

        address
            .parse()
            .map_err(|e| NestcoreError::custom(anyhow::anyhow!("bad address '{}': {}", address, e)))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::host::mock::MockInvoker;

    use super::*;

    mod fixtures {
        use super::*;

        pub struct Harness {
            pub machines: TempDir,
            pub units: TempDir,
            pub invoker: Arc<MockInvoker>,
            pub controller: LifecycleController,
        }

        pub fn harness() -> anyhow::Result<Harness> {
            let machines = TempDir::new()?;
            let units = TempDir::new()?;
            let invoker = Arc::new(MockInvoker::new());

            let config = NestcoreConfig::builder()
                .machines_dir(machines.path())
                .units_dir(units.path())
                .build();

            let controller = LifecycleController::builder()
                .config(config)
                .invoker(invoker.clone())
                .stop_timeout(Duration::from_millis(50))
                .force_stop_timeout(Duration::from_millis(50))
                .start_timeout(Duration::from_millis(50))
                .poll_interval(Duration::from_millis(5))
                .build();

            Result::Ok(Harness {
                machines,
                units,
                invoker,
                controller,
            })
        }

        pub fn create_machine_dir(harness: &Harness, name: &str) {
            std::fs::create_dir_all(harness.machines.path().join(name)).expect("mkdir");
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_lifecycle_start_is_idempotent_when_running() -> anyhow::Result<()> {
        let harness = fixtures::harness()?;
        harness.invoker.respond("machinectl show", 0, "State=running", "");

        harness.controller.start("alpha").await?;

        assert!(harness.invoker.calls_matching("machinectl start").is_empty());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_lifecycle_start_from_stopped() -> anyhow::Result<()> {
        let harness = fixtures::harness()?;
        fixtures::create_machine_dir(&harness, "alpha");

        // First status query: unregistered (stopped); afterwards: running.
        harness.invoker.respond("machinectl show", 0, "State=running", "");
        harness
            .invoker
            .respond_once("machinectl show", 1, "", "No machine 'alpha' known");

        harness.controller.start("alpha").await?;

        assert_eq!(harness.invoker.calls_matching("machinectl start").len(), 1);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_lifecycle_start_failure_surfaces_stderr() -> anyhow::Result<()> {
        let harness = fixtures::harness()?;
        fixtures::create_machine_dir(&harness, "alpha");

        harness
            .invoker
            .respond("machinectl show", 1, "", "No machine 'alpha' known");
        harness
            .invoker
            .respond("machinectl start", 1, "", "Failed to start machine");

        let result = harness.controller.start("alpha").await;
        match result {
            Err(NestcoreError::StartFailed(message)) => {
                assert!(message.contains("Failed to start machine"));
            }
            other => panic!("expected StartFailed, got {:?}", other),
        }

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_lifecycle_stop_waits_for_state() -> anyhow::Result<()> {
        let harness = fixtures::harness()?;
        fixtures::create_machine_dir(&harness, "alpha");

        // Running for the initial check, then unregistered after the stop.
        harness
            .invoker
            .respond("machinectl show", 1, "", "No machine 'alpha' known");
        harness
            .invoker
            .respond_once("machinectl show", 0, "State=running", "");

        harness.controller.stop("alpha").await?;
        assert_eq!(harness.invoker.calls_matching("machinectl stop").len(), 1);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_lifecycle_stop_times_out() -> anyhow::Result<()> {
        let harness = fixtures::harness()?;
        fixtures::create_machine_dir(&harness, "alpha");

        harness.invoker.respond("machinectl show", 0, "State=running", "");

        let result = harness.controller.stop("alpha").await;
        assert!(matches!(result, Err(NestcoreError::StopFailed(_))));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_lifecycle_force_stop_uses_terminate() -> anyhow::Result<()> {
        let harness = fixtures::harness()?;
        fixtures::create_machine_dir(&harness, "alpha");

        harness
            .invoker
            .respond("machinectl show", 1, "", "No machine 'alpha' known");
        harness
            .invoker
            .respond_once("machinectl show", 0, "State=running", "");

        harness.controller.force_stop("alpha").await?;
        assert_eq!(
            harness.invoker.calls_matching("machinectl terminate").len(),
            1
        );

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_lifecycle_delete_removes_dir_and_unit() -> anyhow::Result<()> {
        let harness = fixtures::harness()?;
        fixtures::create_machine_dir(&harness, "alpha");
        std::fs::write(harness.units.path().join("alpha.nspawn"), "[Exec]\n")?;

        harness
            .invoker
            .respond("machinectl show", 1, "", "No machine 'alpha' known");

        harness.controller.delete("alpha").await?;

        assert!(!harness.machines.path().join("alpha").exists());
        assert!(!harness.units.path().join("alpha.nspawn").exists());

        // Deleting again is fine.
        harness.controller.delete("alpha").await?;

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_lifecycle_list_reconciles_disk_and_manager() -> anyhow::Result<()> {
        let harness = fixtures::harness()?;
        fixtures::create_machine_dir(&harness, "alpha");
        fixtures::create_machine_dir(&harness, "beta");

        harness.invoker.respond(
            "machinectl list",
            0,
            "alpha container systemd-nspawn debian 12 -\n",
            "",
        );

        let records = harness.controller.list().await?;
        assert_eq!(records.len(), 2);

        assert_eq!(records[0].get_name(), "alpha");
        assert_eq!(*records[0].get_status(), MachineStatus::Running);
        assert_eq!(records[1].get_name(), "beta");
        assert_eq!(*records[1].get_status(), MachineStatus::Stopped);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_lifecycle_inspect_parses_addresses() -> anyhow::Result<()> {
        let harness = fixtures::harness()?;
        fixtures::create_machine_dir(&harness, "alpha");

        harness.invoker.respond("machinectl show alpha --property=State", 0, "State=running", "");
        harness.invoker.respond(
            "machinectl status alpha",
            0,
            "alpha(abc123):\n           Since: Tue 2024-01-02 03:04:05 UTC; 1h ago\n         Address: 10.0.0.5\n                  fd00::2\n              OS: Debian GNU/Linux 12\n",
            "",
        );

        let record = harness.controller.inspect("alpha").await?;
        assert_eq!(*record.get_status(), MachineStatus::Running);
        assert_eq!(record.get_ipv4_address().as_deref(), Some("10.0.0.5"));
        assert_eq!(record.get_ipv6_address().as_deref(), Some("fd00::2"));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_lifecycle_inspect_missing_container() -> anyhow::Result<()> {
        let harness = fixtures::harness()?;

        assert!(matches!(
            harness.controller.inspect("ghost").await,
            Err(NestcoreError::NotFound(_))
        ));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_lifecycle_resolves_ipv4_address() -> anyhow::Result<()> {
        let harness = fixtures::harness()?;
        fixtures::create_machine_dir(&harness, "alpha");

        harness.invoker.respond("machinectl show alpha --property=State", 0, "State=running", "");
        harness.invoker.respond(
            "machinectl status alpha",
            0,
            "alpha(abc123):\n         Address: 10.0.0.5\n",
            "",
        );

        let address = harness.controller.ipv4_address("alpha").await?;
        assert_eq!(address, Ipv4Addr::new(10, 0, 0, 5));

        Ok(())
    }

    #[test]
    fn test_lifecycle_parse_state() {
        assert_eq!(parse_state("State=running\n"), MachineStatus::Running);
        assert_eq!(parse_state("State=degraded\n"), MachineStatus::Failed);
        assert_eq!(parse_state("State=opening\n"), MachineStatus::Unknown);
        assert_eq!(parse_state("garbage"), MachineStatus::Unknown);
    }

    #[test]
    fn test_lifecycle_parse_addresses_stops_at_next_label() {
        let (ipv4, ipv6) = parse_addresses(
            "alpha(abc):\n         Address: 192.168.1.7\n              OS: Debian\n                  10.0.0.9\n",
        );

        assert_eq!(ipv4.as_deref(), Some("192.168.1.7"));
        assert_eq!(ipv6, None);
    }

    #[test]
    fn test_lifecycle_parse_timestamp() {
        let parsed = parse_timestamp("Tue 2024-01-02 03:04:05 UTC").expect("should parse");
        assert_eq!(parsed.to_rfc3339(), "2024-01-02T03:04:05+00:00");

        assert!(parse_timestamp("Tue 2024-01-02 03:04:05 CET").is_none());
        assert!(parse_timestamp("garbage").is_none());
    }

    #[test]
    fn test_lifecycle_humanize_durations() {
        assert_eq!(humanize(chrono::Duration::minutes(5)), "5m");
        assert_eq!(humanize(chrono::Duration::minutes(65)), "1h 5m");
        assert_eq!(humanize(chrono::Duration::minutes(1505)), "1d 1h 5m");
    }
}
