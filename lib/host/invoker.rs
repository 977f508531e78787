//! Single choke point for privileged external commands.
//!
//! Every external program nestcore touches (bootstrap tool, machine manager,
//! firewall, network tooling) runs through [`Invoke::run`]. This is what makes
//! the provisioning pipeline testable: tests inject a mock invoker that records
//! calls and replays canned outputs.

use std::{process::Stdio, time::Duration, time::Instant};

use async_trait::async_trait;
use getset::Getters;
use tokio::{io::AsyncWriteExt, process::Command};
use typed_builder::TypedBuilder;

use crate::{config::FILE_OP_TIMEOUT, NestcoreError, NestcoreResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A fully described external command.
#[derive(Debug, Clone, Getters, TypedBuilder)]
#[getset(get = "pub with_prefix")]
pub struct CommandSpec {
    /// The stage or operation this call is attributed to, for logs and errors.
    #[builder(setter(into))]
    scope: String,

    /// The program and its arguments.
    argv: Vec<String>,

    /// Data piped to the child's stdin.
    #[builder(default, setter(strip_option, into))]
    stdin: Option<String>,

    /// How long the child may run before it is killed.
    #[builder(default = FILE_OP_TIMEOUT)]
    timeout: Duration,

    /// Extra environment variables for the child.
    #[builder(default)]
    envs: Vec<(String, String)>,

    /// Marks a call whose argv or stdin carries secrets. Suppresses argument
    /// logging so nothing sensitive reaches the process log.
    #[builder(default)]
    sensitive: bool,
}

/// The captured result of an external command.
///
/// A non-zero exit status is not an error at this layer; callers decide.
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct CommandOutput {
    /// The exit code, if the child exited normally.
    exit_code: Option<i32>,

    /// Captured stdout, lossily decoded.
    stdout: String,

    /// Captured stderr, lossily decoded.
    stderr: String,

    /// How long the command ran.
    duration: Duration,
}

/// The seam through which all privileged external commands run.
#[async_trait]
pub trait Invoke: Send + Sync {
    /// Runs the command to completion, capturing output.
    ///
    /// Returns `Ok` with the full result for any exit status. Errors only for
    /// spawn failures and timeouts; on timeout the child is killed and the call
    /// fails with [`NestcoreError::Timeout`].
    async fn run(&self, spec: CommandSpec) -> NestcoreResult<CommandOutput>;
}

/// The production invoker, backed by `tokio::process`.
///
/// Reentrant; holds no locks.
#[derive(Debug, Default, Clone)]
pub struct HostInvoker;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HostInvoker {
    /// Creates a new host invoker.
    pub fn new() -> Self {
        Self
    }
}

impl CommandSpec {
    /// Returns the program name, or an empty string for an empty argv.
    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }

    /// Returns a loggable rendering of the command. Sensitive calls only show
    /// the program name.
    pub fn display(&self) -> String {
        if self.sensitive {
            format!("{} <redacted args>", self.program())
        } else {
            self.argv.join(" ")
        }
    }
}

impl CommandOutput {
    /// Assembles an output from captured parts.
    pub(crate) fn from_parts(
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
        duration: Duration,
    ) -> Self {
        Self {
            exit_code,
            stdout,
            stderr,
            duration,
        }
    }

    /// Returns true if the command exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Returns the last few lines of stderr, for compact error messages.
    pub fn stderr_tail(&self) -> String {
        let lines: Vec<&str> = self.stderr.lines().collect();
        let start = lines.len().saturating_sub(8);
        lines[start..].join("\n").chars().take(512).collect()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Invoke for HostInvoker {
    async fn run(&self, spec: CommandSpec) -> NestcoreResult<CommandOutput> {
        if spec.argv.is_empty() {
            return Err(NestcoreError::custom(anyhow::anyhow!(
                "empty argv in scope {}",
                spec.scope
            )));
        }

        tracing::debug!(
            "[{}] running: {} (timeout {:?})",
            spec.scope,
            spec.display(),
            spec.timeout
        );

        let mut command = Command::new(&spec.argv[0]);
        command
            .args(&spec.argv[1..])
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the wait future on timeout must not leave the child behind.
            .kill_on_drop(true);

        for (key, value) in &spec.envs {
            command.env(key, value);
        }

        let started = Instant::now();
        let mut child = command.spawn()?;

        if let Some(input) = &spec.stdin {
            if let Some(mut sink) = child.stdin.take() {
                sink.write_all(input.as_bytes()).await?;
            }
        }

        let waited = tokio::time::timeout(spec.timeout, child.wait_with_output()).await;

        match waited {
            Result::Ok(outcome) => {
                let output = outcome?;
                let result = CommandOutput::from_parts(
                    output.status.code(),
                    String::from_utf8_lossy(&output.stdout).into_owned(),
                    String::from_utf8_lossy(&output.stderr).into_owned(),
                    started.elapsed(),
                );

                if !result.success() {
                    tracing::debug!(
                        "[{}] {} exited with {:?} after {:?}",
                        spec.scope,
                        spec.program(),
                        result.exit_code,
                        result.duration
                    );
                }

                Ok(result)
            }
            Err(_) => {
                tracing::warn!(
                    "[{}] {} timed out after {:?}, killed",
                    spec.scope,
                    spec.program(),
                    spec.timeout
                );

                Err(NestcoreError::Timeout {
                    command: spec.program().to_string(),
                    timeout: spec.timeout,
                })
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Builds an argv vector from string slices.
pub fn argv(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test(tokio::test)]
    async fn test_invoker_captures_stdout() -> anyhow::Result<()> {
        let invoker = HostInvoker::new();
        let output = invoker
            .run(
                CommandSpec::builder()
                    .scope("test")
                    .argv(argv(&["sh", "-c", "echo out; echo err >&2"]))
                    .build(),
            )
            .await?;

        assert!(output.success());
        assert_eq!(output.get_stdout().trim(), "out");
        assert_eq!(output.get_stderr().trim(), "err");

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_invoker_nonzero_exit_is_not_an_error() -> anyhow::Result<()> {
        let invoker = HostInvoker::new();
        let output = invoker
            .run(
                CommandSpec::builder()
                    .scope("test")
                    .argv(argv(&["sh", "-c", "exit 3"]))
                    .build(),
            )
            .await?;

        assert!(!output.success());
        assert_eq!(*output.get_exit_code(), Some(3));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_invoker_pipes_stdin() -> anyhow::Result<()> {
        let invoker = HostInvoker::new();
        let output = invoker
            .run(
                CommandSpec::builder()
                    .scope("test")
                    .argv(argv(&["cat"]))
                    .stdin("ping")
                    .build(),
            )
            .await?;

        assert_eq!(output.get_stdout(), "ping");

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_invoker_kills_on_timeout() {
        let invoker = HostInvoker::new();
        let result = invoker
            .run(
                CommandSpec::builder()
                    .scope("test")
                    .argv(argv(&["sleep", "5"]))
                    .timeout(Duration::from_millis(100))
                    .build(),
            )
            .await;

        assert!(matches!(result, Err(NestcoreError::Timeout { .. })));
    }

    #[test]
    fn test_invoker_sensitive_display_redacts() {
        let spec = CommandSpec::builder()
            .scope("test")
            .argv(argv(&["wg", "setconf", "wg0", "secret.conf"]))
            .sensitive(true)
            .build();

        assert!(!spec.display().contains("secret.conf"));
        assert!(spec.display().starts_with("wg"));
    }

    #[test]
    fn test_invoker_stderr_tail_truncates() {
        let output = CommandOutput {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: (0..40).map(|i| format!("line {}\n", i)).collect(),
            duration: Duration::from_millis(1),
        };

        let tail = output.stderr_tail();
        assert!(tail.contains("line 39"));
        assert!(!tail.contains("line 10"));
    }
}
