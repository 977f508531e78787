//! Persistent port-forward rules and their DNAT entries.
//!
//! Every persisted rule has a matching firewall DNAT entry; removing the rule
//! removes the entry. On process start [`ForwardStore::reconcile`] re-installs
//! any DNAT entries the firewall lost (add-if-missing).

use std::{fmt, net::Ipv4Addr, path::PathBuf, str::FromStr, sync::Arc};

use async_trait::async_trait;
use getset::Getters;
use serde::{Deserialize, Serialize};
use tokio::{fs, sync::Mutex};

use crate::{
    config::FIREWALL_OP_TIMEOUT,
    host::{CommandSpec, Invoke},
    NestcoreError, NestcoreResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The transport protocol of a forwarded port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// TCP.
    Tcp,

    /// UDP.
    Udp,
}

/// A single port-forward rule.
///
/// `(host_port, protocol)` is unique across the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct PortForwardRule {
    /// Surrogate rule id.
    id: u64,

    /// The host port packets arrive on.
    host_port: u16,

    /// The container the traffic is forwarded to.
    container_id: String,

    /// The port inside the container.
    container_port: u16,

    /// The transport protocol.
    protocol: Protocol,
}

/// Resolves a container name to its current IPv4 address.
///
/// Implemented by the lifecycle controller; tests substitute a fixed resolver.
#[async_trait]
pub trait ResolveAddress: Send + Sync {
    /// Returns the container's current IPv4 address.
    async fn ipv4_address(&self, name: &str) -> NestcoreResult<Ipv4Addr>;
}

/// Disk-backed set of port-forward rules driving host DNAT entries.
pub struct ForwardStore {
    path: PathBuf,
    invoker: Arc<dyn Invoke>,
    resolver: Arc<dyn ResolveAddress>,
    state: Mutex<ForwardState>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ForwardState {
    next_id: u64,
    rules: Vec<PortForwardRule>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Protocol {
    /// Returns the lowercase wire name of the protocol.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl ForwardStore {
    /// Opens the store at `path`, loading any persisted rules.
    pub async fn load(
        path: impl Into<PathBuf>,
        invoker: Arc<dyn Invoke>,
        resolver: Arc<dyn ResolveAddress>,
    ) -> NestcoreResult<Self> {
        let path = path.into();

        let state = match fs::read_to_string(&path).await {
            Result::Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ForwardState::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            invoker,
            resolver,
            state: Mutex::new(state),
        })
    }

    /// Adds a rule: validates uniqueness, installs the DNAT entry, persists.
    pub async fn add(
        &self,
        container_id: &str,
        host_port: u16,
        container_port: u16,
        protocol: Protocol,
    ) -> NestcoreResult<PortForwardRule> {
        if host_port == 0 || container_port == 0 {
            return Err(NestcoreError::Validation(
                "ports must be in 1..=65535".into(),
            ));
        }

        let mut state = self.state.lock().await;

        if let Some(existing) = state
            .rules
            .iter()
            .find(|rule| rule.host_port == host_port && rule.protocol == protocol)
        {
            return Err(NestcoreError::RuleConflict(format!(
                "host port {}/{} is already forwarded to '{}'",
                host_port,
                protocol,
                existing.container_id
            )));
        }

        let address = self.resolver.ipv4_address(container_id).await?;

        let rule = PortForwardRule {
            id: state.next_id + 1,
            host_port,
            container_id: container_id.to_string(),
            container_port,
            protocol,
        };

        self.dnat("-A", &rule, address).await?;

        state.next_id += 1;
        state.rules.push(rule.clone());
        self.persist(&state).await?;

        tracing::info!(
            "port forward added: {}/{} -> {}:{}",
            host_port,
            protocol,
            container_id,
            container_port
        );

        Ok(rule)
    }

    /// Removes a rule by id, dropping both the persisted record and the DNAT entry.
    pub async fn remove(&self, id: u64) -> NestcoreResult<()> {
        let mut state = self.state.lock().await;

        let index = state
            .rules
            .iter()
            .position(|rule| rule.id == id)
            .ok_or_else(|| NestcoreError::NotFound(format!("port forward rule {}", id)))?;

        let rule = state.rules[index].clone();

        match self.resolver.ipv4_address(&rule.container_id).await {
            Result::Ok(address) => {
                self.dnat("-D", &rule, address).await?;
            }
            Err(NestcoreError::NotFound(_)) => {
                // The container is gone; the DNAT entry died with its address.
                tracing::warn!(
                    "removing rule {} for vanished container '{}'",
                    id,
                    rule.container_id
                );
            }
            Err(e) => return Err(e),
        }

        state.rules.remove(index);
        self.persist(&state).await?;

        tracing::info!("port forward removed: {}/{}", rule.host_port, rule.protocol);

        Ok(())
    }

    /// Returns a snapshot of all rules.
    pub async fn list(&self) -> Vec<PortForwardRule> {
        self.state.lock().await.rules.clone()
    }

    /// Ensures every persisted rule has an installed DNAT entry.
    pub async fn reconcile(&self) -> NestcoreResult<()> {
        let rules = self.list().await;

        for rule in rules {
            let address = match self.resolver.ipv4_address(&rule.container_id).await {
                Result::Ok(address) => address,
                Err(e) => {
                    tracing::warn!(
                        "skipping reconcile of rule {} ('{}'): {}",
                        rule.id,
                        rule.container_id,
                        e
                    );
                    continue;
                }
            };

            let check = self
                .invoker
                .run(dnat_command("-C", &rule, address))
                .await?;

            if !check.success() {
                tracing::info!(
                    "reinstalling missing DNAT entry for {}/{}",
                    rule.host_port,
                    rule.protocol
                );
                self.dnat("-A", &rule, address).await?;
            }
        }

        Ok(())
    }

    async fn dnat(&self, action: &str, rule: &PortForwardRule, address: Ipv4Addr) -> NestcoreResult<()> {
        let output = self.invoker.run(dnat_command(action, rule, address)).await?;

        if !output.success() {
            return Err(NestcoreError::HostError {
                command: "iptables".to_string(),
                exit_code: *output.get_exit_code(),
                stderr: output.stderr_tail(),
            });
        }

        Ok(())
    }

    async fn persist(&self, state: &ForwardState) -> NestcoreResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let contents = serde_json::to_string_pretty(state)?;
        fs::write(&self.path, contents).await?;

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn dnat_command(action: &str, rule: &PortForwardRule, address: Ipv4Addr) -> CommandSpec {
    CommandSpec::builder()
        .scope("port_forward")
        .argv(vec![
            "iptables".to_string(),
            "-t".to_string(),
            "nat".to_string(),
            action.to_string(),
            "PREROUTING".to_string(),
            "-p".to_string(),
            rule.protocol.as_str().to_string(),
            "--dport".to_string(),
            rule.host_port.to_string(),
            "-j".to_string(),
            "DNAT".to_string(),
            "--to-destination".to_string(),
            format!("{}:{}", address, rule.container_port),
        ])
        .timeout(FIREWALL_OP_TIMEOUT)
        .build()
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for Protocol {
    type Err = NestcoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Result::Ok(Self::Tcp),
            "udp" => Result::Ok(Self::Udp),
            other => Err(NestcoreError::Validation(format!(
                "unknown protocol: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for Protocol {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Protocol {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
