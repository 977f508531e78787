//! The container provisioning pipeline.
//!
//! Turns a validated [`ContainerSpec`] into a running container through a strict
//! sequence of stages, publishing progress to the [`JobRegistry`] as it goes.
//! Any failed stage terminates the job, cleans up everything the pipeline
//! created, and prevents later stages. Cancellation is cooperative and honored
//! at stage boundaries.

use std::{
    panic::AssertUnwindSafe,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use futures::FutureExt;
use tokio::fs;
use typed_builder::TypedBuilder;

use crate::{
    config::{ContainerSpec, Ipv6Mode, NestcoreConfig, BOOTSTRAP_TIMEOUT},
    distro::{self, normalize_arch},
    host::{CommandSpec, HostInspector, Invoke},
    management::{LifecycleController, MachineStore},
    utils::machine_root_path,
    NestcoreError, NestcoreResult,
};

use super::{
    configure_dns, configure_wireguard, install_ssh, remove_unit, set_root_password,
    write_network_unit, write_unit, JobRegistry, Stage,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Runs the provisioning pipeline for submitted container specs.
#[derive(TypedBuilder)]
pub struct Provisioner {
    /// Host configuration.
    config: NestcoreConfig,

    /// The invoker external commands go through.
    invoker: Arc<dyn Invoke>,

    /// The registry provisioning jobs publish to.
    registry: Arc<JobRegistry>,

    /// The controller used to start the finished container.
    lifecycle: Arc<LifecycleController>,

    /// The inspector used to detect the host architecture.
    inspector: HostInspector,

    /// Optional store for the authored container record.
    #[builder(default)]
    store: Option<Arc<MachineStore>>,

    /// Overrides host architecture detection. Intended for tests.
    #[builder(default, setter(strip_option, into))]
    arch_override: Option<String>,
}

/// What the pipeline created so far, for failure cleanup.
#[derive(Default)]
struct CleanupFlags {
    rootfs_created: AtomicBool,
    unit_written: AtomicBool,
}

/// Why a pipeline run ended early.
enum PipelineAbort {
    /// The caller cancelled the job; honored at a stage boundary.
    Cancelled,

    /// A stage failed.
    Failed {
        stage: Stage,
        error: NestcoreError,
    },
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Provisioner {
    /// Validates and submits a spec, spawning a background worker that runs the
    /// pipeline to completion. Returns the job id (the container name).
    ///
    /// The caller observes progress through the job registry; this method never
    /// blocks on the pipeline.
    pub async fn submit(self: &Arc<Self>, spec: ContainerSpec) -> NestcoreResult<String> {
        spec.validate()?;

        let name = spec.get_name().clone();
        self.registry.register(&name)?;

        let worker = Arc::clone(self);
        tokio::spawn(async move {
            let name = spec.get_name().clone();
            if let Err(e) = worker.run(spec).await {
                tracing::error!("provisioning of {} failed: {}", name, e);
            }
        });

        Ok(name)
    }

    /// Runs the pipeline for an already registered job, synchronously from the
    /// caller's point of view. Normally invoked through [`Provisioner::submit`].
    ///
    /// The terminal registry update is guaranteed even if a stage panics; the
    /// worker never leaks a job in a non-terminal state.
    pub async fn run(&self, spec: ContainerSpec) -> NestcoreResult<()> {
        let name = spec.get_name().clone();
        let flags = CleanupFlags::default();

        let outcome = AssertUnwindSafe(self.run_stages(&spec, &flags))
            .catch_unwind()
            .await;

        let abort = match outcome {
            Result::Ok(Result::Ok(())) => {
                if let Some(store) = &self.store {
                    if let Err(e) = store.save(&spec).await {
                        tracing::warn!("failed to persist record for {}: {}", name, e);
                    }
                }

                self.registry.finish_ok(&name);
                tracing::info!("container {} provisioned", name);
                return Ok(());
            }
            Result::Ok(Err(abort)) => abort,
            Err(_) => {
                let stage = self
                    .registry
                    .get(&name)
                    .map(|job| *job.get_stage())
                    .unwrap_or(Stage::DetectArch);

                PipelineAbort::Failed {
                    stage,
                    error: NestcoreError::custom(anyhow::anyhow!(
                        "provisioning worker panicked"
                    )),
                }
            }
        };

        self.cleanup(&name, &flags).await;

        match abort {
            PipelineAbort::Cancelled => {
                tracing::info!("provisioning of {} cancelled", name);
                self.registry.finish_err(&name, "cancelled");
                Err(NestcoreError::custom(anyhow::anyhow!("cancelled")))
            }
            PipelineAbort::Failed { stage, error } => {
                let message = format!("{}: {}", stage.as_str(), error);
                tracing::error!("stage {}", message);
                self.registry.finish_err(&name, message);
                Err(error)
            }
        }
    }

    async fn run_stages(
        &self,
        spec: &ContainerSpec,
        flags: &CleanupFlags,
    ) -> Result<(), PipelineAbort> {
        let name = spec.get_name().as_str();

        // Stage 1: detect the host architecture and resolve the bootstrap plan.
        self.enter(name, Stage::DetectArch)?;
        let raw_arch = match &self.arch_override {
            Some(arch) => arch.clone(),
            None => self
                .inspector
                .arch()
                .map_err(fail(Stage::DetectArch))?,
        };
        let arch = normalize_arch(&raw_arch);
        let target = distro::resolve(spec.get_distro(), &arch).map_err(fail(Stage::DetectArch))?;

        tracing::info!(
            "provisioning {}: {} {} on {} from {}",
            name,
            target.get_distro(),
            target.get_suite(),
            target.get_arch(),
            target.get_mirror()
        );

        // Stage 2: claim the machine directory.
        self.enter(name, Stage::PrepareDir)?;
        let rootfs = self.rootfs(name);
        if rootfs.exists() {
            return Err(fail(Stage::PrepareDir)(NestcoreError::NameConflict(
                format!("container '{}' already exists", name),
            )));
        }
        fs::create_dir_all(&rootfs)
            .await
            .map_err(|e| fail(Stage::PrepareDir)(e.into()))?;
        flags.rootfs_created.store(true, Ordering::SeqCst);

        // Stage 3: materialize the root filesystem. Long-running.
        self.enter(name, Stage::BootstrapRootfs)?;
        let output = self
            .invoker
            .run(
                CommandSpec::builder()
                    .scope(Stage::BootstrapRootfs.as_str())
                    .argv(vec![
                        target.get_bootstrap_tool().to_string(),
                        format!("--arch={}", target.get_arch()),
                        target.get_suite().clone(),
                        rootfs.to_string_lossy().into_owned(),
                        target.get_mirror().clone(),
                    ])
                    .timeout(BOOTSTRAP_TIMEOUT)
                    .build(),
            )
            .await
            .map_err(fail(Stage::BootstrapRootfs))?;
        if !output.success() {
            return Err(fail(Stage::BootstrapRootfs)(
                NestcoreError::BootstrapFailed(format!(
                    "{} exited with {:?}: {}",
                    target.get_bootstrap_tool(),
                    output.get_exit_code(),
                    output.stderr_tail()
                )),
            ));
        }

        // Stage 4: root password, directly into the guest shadow file.
        self.enter(name, Stage::SetRootPassword)?;
        set_root_password(&rootfs, spec.get_root_password())
            .await
            .map_err(fail(Stage::SetRootPassword))?;

        // Stage 5: DNS and bridge networking inside the guest.
        self.enter(name, Stage::ConfigureNetwork)?;
        configure_dns(&rootfs)
            .await
            .map_err(fail(Stage::ConfigureNetwork))?;
        write_network_unit(&rootfs, spec.wants_ipv6())
            .await
            .map_err(fail(Stage::ConfigureNetwork))?;

        // Stage 6: SSH server, only when requested.
        if *spec.get_enable_ssh() {
            self.enter(name, Stage::InstallSsh)?;
            install_ssh(self.invoker.as_ref(), &rootfs)
                .await
                .map_err(fail(Stage::InstallSsh))?;
        }

        // Stage 7: WireGuard, only in wireguard IPv6 mode.
        if *spec.get_ipv6() == Ipv6Mode::Wireguard {
            self.enter(name, Stage::ConfigureWireguard)?;
            let blob = spec
                .get_wireguard_config()
                .as_deref()
                .unwrap_or_default();
            configure_wireguard(self.invoker.as_ref(), &rootfs, blob)
                .await
                .map_err(fail(Stage::ConfigureWireguard))?;
        }

        // Stage 8: host-side unit file with resource caps.
        self.enter(name, Stage::WriteHostUnit)?;
        write_unit(self.config.get_units_dir(), spec, self.config.get_bridge())
            .await
            .map_err(fail(Stage::WriteHostUnit))?;
        flags.unit_written.store(true, Ordering::SeqCst);

        // Stage 9: start through the machine manager.
        self.enter(name, Stage::Start)?;
        self.lifecycle
            .start(name)
            .await
            .map_err(fail(Stage::Start))?;

        Result::Ok(())
    }

    /// Publishes stage entry, honoring a pending cancellation request first.
    fn enter(&self, name: &str, stage: Stage) -> Result<(), PipelineAbort> {
        if self.registry.cancel_requested(name) {
            return Err(PipelineAbort::Cancelled);
        }

        self.registry.set_stage(name, stage);

        Result::Ok(())
    }

    /// Removes everything a failed (or cancelled) run created. A pre-existing
    /// machine directory is never touched; only one the pipeline made.
    async fn cleanup(&self, name: &str, flags: &CleanupFlags) {
        if flags.unit_written.load(Ordering::SeqCst) {
            if let Err(e) = remove_unit(self.config.get_units_dir(), name).await {
                tracing::warn!("cleanup: failed to remove unit file for {}: {}", name, e);
            }
        }

        if flags.rootfs_created.load(Ordering::SeqCst) {
            let rootfs = self.rootfs(name);
            match fs::remove_dir_all(&rootfs).await {
                Result::Ok(()) => {
                    tracing::info!("cleanup: removed {}", rootfs.display());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!("cleanup: failed to remove {}: {}", rootfs.display(), e);
                }
            }
        }
    }

    fn rootfs(&self, name: &str) -> PathBuf {
        machine_root_path(self.config.get_machines_dir(), name)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn fail(stage: Stage) -> impl FnOnce(NestcoreError) -> PipelineAbort {
    move |error| PipelineAbort::Failed { stage, error }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
