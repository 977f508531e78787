//! `nestcore` is a self-hosted orchestrator for lightweight Linux containers built on
//! systemd-nspawn machine containers.
//!
//! # Overview
//!
//! nestcore provisions a container's root filesystem from a distribution bootstrap,
//! configures its networking, resource limits, and remote-access surface, and then
//! manages its lifecycle through the host machine manager. It handles:
//! - Root filesystem bootstrap via debootstrap
//! - Low-level guest filesystem mutation (shadow, DNS, networkd, SSH, WireGuard)
//! - Host-side `.nspawn` unit files with CPU/memory/disk caps
//! - Asynchronous, observable creation jobs
//! - Container lifecycle (start, stop, restart, delete)
//! - Port forwarding backed by host firewall DNAT rules
//!
//! # Architecture
//!
//! nestcore consists of several key components:
//!
//! - **Host Invoker**: single choke point for privileged external commands
//! - **Distribution Catalog**: maps `(distro, release, arch)` to a bootstrap plan
//! - **Provisioning Pipeline**: ordered stages turning a spec into a running container
//! - **Creation Job Registry**: in-process observable job store
//! - **Lifecycle Controller**: machinectl-backed post-creation operations
//! - **Port-Forward Rule Store**: persistent DNAT rule set
//! - **Host Inspector**: read-only host resource queries
//!
//! # Modules
//!
//! - [`config`] - Configuration types and validation
//! - [`distro`] - Distribution catalog and architecture normalization
//! - [`host`] - Host command invoker and inspector
//! - [`management`] - Container lifecycle and metadata store
//! - [`network`] - Port forwarding
//! - [`provision`] - Creation jobs, filesystem mutation, and the pipeline
//! - [`utils`] - Common constants and helpers
//!
//! # Platform Support
//!
//! Linux only. The orchestrator assumes a single host with privileged access to the
//! kernel's container, networking, and firewall subsystems.

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod config;
pub mod distro;
pub mod host;
pub mod management;
pub mod network;
pub mod provision;
pub mod utils;

pub use error::*;
