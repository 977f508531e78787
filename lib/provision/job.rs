//! Creation job registry.
//!
//! Process-wide keyed store from container id to [`CreationJob`]. The registry is
//! ephemeral: it does not survive a restart of the host process, which is fine
//! because an in-flight bootstrap does not survive one either.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use getset::Getters;
use serde::{Deserialize, Serialize};

use crate::{config::DEFAULT_JOB_TTL, NestcoreError, NestcoreResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Upper bound on the per-job percent trace.
const MAX_TRACE_LEN: usize = 16;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A stage of the provisioning pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Query and normalize the host architecture.
    DetectArch,

    /// Create the machine root directory.
    PrepareDir,

    /// Run the bootstrap tool to materialize the root filesystem.
    BootstrapRootfs,

    /// Write the root password into the guest shadow file.
    SetRootPassword,

    /// Configure guest DNS and networking.
    ConfigureNetwork,

    /// Install the SSH server inside the guest.
    InstallSsh,

    /// Install and configure WireGuard inside the guest.
    ConfigureWireguard,

    /// Write the host-side unit file with resource caps.
    WriteHostUnit,

    /// Start the container through the machine manager.
    Start,

    /// Terminal success stage.
    Completed,
}

/// Terminal status of a creation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    /// The job is still in flight.
    None,

    /// The job finished successfully.
    Completed,

    /// The job failed; `error` carries the reason.
    Failed,
}

/// An observable snapshot of one container creation job.
#[derive(Debug, Clone, Serialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct CreationJob {
    /// The container id. Equals the container name from the spec.
    container_id: String,

    /// The current pipeline stage.
    stage: Stage,

    /// Progress percent, monotone non-decreasing while the job is in flight.
    percent: u8,

    /// Terminal status of the job.
    terminal_status: TerminalStatus,

    /// Human-readable failure reason, starting with the stage name.
    error: Option<String>,

    /// When the job was registered.
    started_at: DateTime<Utc>,

    /// When the job reached a terminal status.
    finished_at: Option<DateTime<Utc>>,

    /// The sequence of published percent values, oldest first.
    trace: Vec<u8>,
}

/// Process-wide registry of creation jobs.
///
/// All mutations serialize under one mutex; job churn is low and the lock is
/// held only for the duration of a map update, never across external calls.
#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, JobEntry>>,
    job_ttl: Option<Duration>,
}

struct JobEntry {
    job: CreationJob,
    cancel_requested: bool,
    reap_at: Option<Instant>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Stage {
    /// Returns the snake_case wire name of the stage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DetectArch => "detect_arch",
            Self::PrepareDir => "prepare_dir",
            Self::BootstrapRootfs => "bootstrap_rootfs",
            Self::SetRootPassword => "set_root_password",
            Self::ConfigureNetwork => "configure_network",
            Self::InstallSsh => "install_ssh",
            Self::ConfigureWireguard => "configure_wireguard",
            Self::WriteHostUnit => "write_host_unit",
            Self::Start => "start",
            Self::Completed => "completed",
        }
    }

    /// Returns the percent published when the stage is entered.
    pub fn entry_percent(&self) -> u8 {
        match self {
            Self::DetectArch => 10,
            Self::PrepareDir => 20,
            Self::BootstrapRootfs => 30,
            Self::SetRootPassword => 60,
            Self::ConfigureNetwork => 70,
            Self::InstallSsh => 80,
            Self::ConfigureWireguard => 85,
            Self::WriteHostUnit => 90,
            Self::Start => 95,
            Self::Completed => 100,
        }
    }
}

impl CreationJob {
    /// Returns true once the job has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.terminal_status != TerminalStatus::None
    }
}

impl JobRegistry {
    /// Creates a registry with the default terminal-job TTL.
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            job_ttl: Some(DEFAULT_JOB_TTL),
        }
    }

    /// Creates a registry with a custom terminal-job TTL. `None` disables reaping.
    pub fn with_ttl(job_ttl: Option<Duration>) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            job_ttl,
        }
    }

    /// Registers a new job for `name`.
    ///
    /// Fails with a name conflict while a job for the same container is still in
    /// flight; a retained terminal job is replaced.
    pub fn register(&self, name: &str) -> NestcoreResult<()> {
        let mut jobs = self.lock();
        Self::reap(&mut jobs);

        if let Some(entry) = jobs.get(name) {
            if !entry.job.is_terminal() {
                return Err(NestcoreError::NameConflict(format!(
                    "a creation job for '{}' is already in flight",
                    name
                )));
            }
        }

        jobs.insert(
            name.to_string(),
            JobEntry {
                job: CreationJob {
                    container_id: name.to_string(),
                    stage: Stage::DetectArch,
                    percent: 0,
                    terminal_status: TerminalStatus::None,
                    error: None,
                    started_at: Utc::now(),
                    finished_at: None,
                    trace: Vec::new(),
                },
                cancel_requested: false,
                reap_at: None,
            },
        );

        Ok(())
    }

    /// Publishes entry into `stage` for `name`'s job.
    ///
    /// Percent is clamped to be monotone non-decreasing; updates after the
    /// terminal transition are ignored so readers never observe reordering.
    pub fn set_stage(&self, name: &str, stage: Stage) {
        let mut jobs = self.lock();

        if let Some(entry) = jobs.get_mut(name) {
            if entry.job.is_terminal() {
                tracing::warn!(
                    "ignoring stage update for terminal job {}: {}",
                    name,
                    stage.as_str()
                );
                return;
            }

            let percent = stage.entry_percent().max(entry.job.percent);
            entry.job.stage = stage;
            entry.job.percent = percent;
            push_trace(&mut entry.job.trace, percent);
        }
    }

    /// Marks `name`'s job as completed with percent 100.
    pub fn finish_ok(&self, name: &str) {
        let mut jobs = self.lock();

        if let Some(entry) = jobs.get_mut(name) {
            if entry.job.is_terminal() {
                return;
            }

            entry.job.stage = Stage::Completed;
            entry.job.percent = 100;
            entry.job.terminal_status = TerminalStatus::Completed;
            entry.job.finished_at = Some(Utc::now());
            push_trace(&mut entry.job.trace, 100);
            entry.reap_at = self.job_ttl.map(|ttl| Instant::now() + ttl);
        }
    }

    /// Marks `name`'s job as failed with the given error.
    pub fn finish_err(&self, name: &str, error: impl Into<String>) {
        let mut jobs = self.lock();

        if let Some(entry) = jobs.get_mut(name) {
            if entry.job.is_terminal() {
                return;
            }

            entry.job.terminal_status = TerminalStatus::Failed;
            entry.job.error = Some(error.into());
            entry.job.finished_at = Some(Utc::now());
            entry.reap_at = self.job_ttl.map(|ttl| Instant::now() + ttl);
        }
    }

    /// Returns a snapshot of `name`'s job.
    pub fn get(&self, name: &str) -> Option<CreationJob> {
        self.lock().get(name).map(|entry| entry.job.clone())
    }

    /// Requests cooperative cancellation of `name`'s job.
    ///
    /// The pipeline honors the request at the next stage boundary; a terminal
    /// job is left untouched.
    pub fn request_cancel(&self, name: &str) -> NestcoreResult<()> {
        let mut jobs = self.lock();

        match jobs.get_mut(name) {
            Some(entry) => {
                if !entry.job.is_terminal() {
                    entry.cancel_requested = true;
                }
                Ok(())
            }
            None => Err(NestcoreError::NotFound(format!("creation job '{}'", name))),
        }
    }

    /// Returns true if cancellation has been requested for `name`'s job.
    pub fn cancel_requested(&self, name: &str) -> bool {
        self.lock()
            .get(name)
            .map(|entry| entry.cancel_requested)
            .unwrap_or(false)
    }

    /// Acknowledges and removes a terminal job.
    pub fn ack(&self, name: &str) -> NestcoreResult<()> {
        let mut jobs = self.lock();

        match jobs.get(name).map(|entry| entry.job.is_terminal()) {
            Some(true) => {
                jobs.remove(name);
                Ok(())
            }
            Some(false) => Err(NestcoreError::NameConflict(format!(
                "creation job '{}' is still in flight",
                name
            ))),
            None => Err(NestcoreError::NotFound(format!("creation job '{}'", name))),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, JobEntry>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reap(jobs: &mut HashMap<String, JobEntry>) {
        let now = Instant::now();
        jobs.retain(|_, entry| entry.reap_at.map(|at| at > now).unwrap_or(true));
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn push_trace(trace: &mut Vec<u8>, percent: u8) {
    if trace.last() != Some(&percent) && trace.len() < MAX_TRACE_LEN {
        trace.push(percent);
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
