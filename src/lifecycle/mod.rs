//! # Container Lifecycle Management
//!
//! [`ContainerLifecycleManager`] owns the per-instance state machine and is
//! the only component that talks to the container runtime on an instance's
//! behalf.
//!
//! ## State machine
//!
//! ```text
//! Absent -> Creating -> Stopped -> Running -> Stopping -> Stopped -> Absent
//!                                  Running|Stopped -> Updating -> Running|Stopped
//!                       any -> Failed
//! ```
//!
//! ## Exclusion
//!
//! Every operation takes the instance's lock from [`InstanceLocks`] before
//! reading the instance, and persists a busy marker for the duration of the
//! operation. The marker is cleared on every exit path; a marker left behind
//! by a crashed process is cleared by [`ContainerLifecycleManager::recover`].
//! Operations on different instances never wait on each other.
//!
//! ## Failure reporting
//!
//! Validation and allocation problems are returned before anything changes.
//! Provisioning and runtime failures are additionally recorded on the
//! instance (`last_error`, container record outcome) so they show up in
//! [`ContainerLifecycleManager::status`].

use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::allocator::ResourceAllocator;
use crate::config::{ContainerSettings, LifecycleConfig};
use crate::container::{ContainerError, ContainerRuntime, ContainerSpec, container_name};
use crate::env;
use crate::error::{FleetError, Result};
use crate::launch::{LaunchSpec, LaunchSpecComposer};
use crate::model::{
    ContainerRecord, DesiredState, Instance, InstanceId, ObservedState, Operation, PortTriple,
    RuntimeStatus,
};
use crate::provision::BinaryProvisioningPipeline;
use crate::store::Store;

mod locks;
mod pool;
mod retry;

pub use locks::InstanceLocks;
pub use pool::{LifecycleRequest, WorkerPool};
pub use retry::RetryPolicy;

/// Snapshot returned by [`ContainerLifecycleManager::status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub instance: Instance,
    pub ports: Option<PortTriple>,
    pub record: Option<ContainerRecord>,
}

/// What [`ContainerLifecycleManager::recover`] changed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Busy markers left by a previous process
    pub cleared_markers: u64,
    /// `(instance, before, after)` for every reconciled instance
    pub reconciled: Vec<(InstanceId, ObservedState, ObservedState)>,
}

pub struct ContainerLifecycleManager {
    store: Store,
    allocator: Arc<ResourceAllocator>,
    provisioner: Arc<BinaryProvisioningPipeline>,
    runtime: Arc<dyn ContainerRuntime>,
    settings: ContainerSettings,
    config: LifecycleConfig,
    retry: RetryPolicy,
    locks: InstanceLocks,
}

fn runtime_failure(what: &str, e: ContainerError) -> FleetError {
    FleetError::RuntimeOperationFailed(format!("{}: {}", what, e))
}

impl ContainerLifecycleManager {
    pub fn new(
        store: Store,
        allocator: Arc<ResourceAllocator>,
        provisioner: Arc<BinaryProvisioningPipeline>,
        runtime: Arc<dyn ContainerRuntime>,
        settings: ContainerSettings,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            allocator,
            provisioner,
            runtime,
            settings,
            retry: RetryPolicy::from_config(&config),
            config,
            locks: InstanceLocks::new(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn provisioner(&self) -> &Arc<BinaryProvisioningPipeline> {
        &self.provisioner
    }

    async fn load(&self, id: InstanceId) -> Result<Instance> {
        self.store
            .get_instance(id)
            .await?
            .ok_or(FleetError::InstanceNotFound(id))
    }

    /// Run `body` with exclusive access to instance `id`.
    ///
    /// The instance handed to `body` is freshly loaded under the lock and
    /// carries `operation` as its busy marker; the marker is cleared when
    /// `body` returns, whatever the outcome. A panic in `body` clears the
    /// marker before it continues to unwind.
    pub async fn run_marked<T, F, Fut>(&self, id: InstanceId, operation: Operation, body: F) -> Result<T>
    where
        F: FnOnce(Instance) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _guard = self.locks.acquire(id).await;
        let mut instance = self.load(id).await?;
        if let Some(current) = instance.busy {
            return Err(FleetError::Busy {
                id,
                operation: current,
            });
        }

        self.store.set_busy(id, Some(operation)).await?;
        instance.busy = Some(operation);
        debug!("Instance {} busy with {}", id, operation);

        let outcome = AssertUnwindSafe(body(instance)).catch_unwind().await;

        if let Err(e) = self.store.set_busy(id, None).await {
            error!("Failed to clear busy marker of instance {}: {}", id, e);
        }
        match outcome {
            Ok(result) => result,
            Err(panic) => {
                error!("{} of instance {} panicked", operation, id);
                std::panic::resume_unwind(panic)
            }
        }
    }

    fn transition(
        instance: &mut Instance,
        operation: Operation,
        next: ObservedState,
    ) -> Result<()> {
        if instance.observed == next {
            return Ok(());
        }
        if !instance.observed.can_transition_to(next) {
            return Err(FleetError::InvalidState {
                id: instance.id,
                operation,
                state: instance.observed,
            });
        }
        debug!("Instance {}: {} -> {}", instance.id, instance.observed, next);
        instance.observed = next;
        instance.updated_at = Utc::now();
        Ok(())
    }

    /// Move `instance` to `next` and persist it.
    async fn advance(
        &self,
        instance: &mut Instance,
        operation: Operation,
        next: ObservedState,
    ) -> Result<()> {
        Self::transition(instance, operation, next)?;
        self.store.update_instance(instance).await
    }

    /// Record a fault on the instance and its container record.
    async fn record_fault(
        &self,
        instance: &mut Instance,
        next: ObservedState,
        error: &FleetError,
    ) -> Result<()> {
        warn!("Instance {} faulted: {}", instance.id, error);
        instance.observed = next;
        instance.last_error = Some(error.to_string());
        instance.updated_at = Utc::now();
        self.store.update_instance(instance).await?;
        self.record_outcome(instance.id, None, &error.to_string())
            .await
    }

    async fn record_outcome(
        &self,
        id: InstanceId,
        status: Option<RuntimeStatus>,
        outcome: &str,
    ) -> Result<()> {
        let mut record = self
            .store
            .get_record(id)
            .await?
            .unwrap_or_else(|| ContainerRecord::new(id, container_name(id)));
        if let Some(status) = status {
            record.runtime_status = status;
        }
        record.last_outcome = Some(outcome.to_string());
        record.updated_at = Utc::now();
        self.store.upsert_record(&record).await
    }

    async fn ports_of(&self, instance: &Instance) -> Result<PortTriple> {
        self.allocator.assignment(instance.id).await?.ok_or_else(|| {
            FleetError::RuntimeOperationFailed(format!(
                "instance {} has no port assignment",
                instance.id
            ))
        })
    }

    async fn container_spec(
        &self,
        instance: &Instance,
        launch: &LaunchSpec,
        ports: PortTriple,
    ) -> Result<ContainerSpec> {
        let install_dir = self.provisioner.install_dir(instance);
        tokio::fs::create_dir_all(&install_dir).await?;
        Ok(ContainerSpec::for_instance(
            instance.id,
            launch,
            ports,
            &install_dir,
            &self.settings,
            instance.spec.image.as_deref(),
        )?)
    }

    /// Remove any container under the instance's name and create a fresh one.
    async fn recreate_container(
        &self,
        instance: &Instance,
        launch: &LaunchSpec,
        ports: PortTriple,
    ) -> Result<String> {
        let spec = self.container_spec(instance, launch, ports).await?;
        let runtime = &self.runtime;
        self.retry
            .run("remove container", || runtime.remove(&spec.name))
            .await
            .map_err(|e| runtime_failure("remove", e))?;
        let container_id = self
            .retry
            .run("create container", || runtime.create(&spec))
            .await
            .map_err(|e| runtime_failure("create", e))?;

        let mut record = self
            .store
            .get_record(instance.id)
            .await?
            .unwrap_or_else(|| ContainerRecord::new(instance.id, spec.name.clone()));
        record.container_id = Some(container_id.clone());
        record.runtime_status = RuntimeStatus::Stopped;
        record.launch_fingerprint = Some(launch.fingerprint()?);
        record.last_outcome = Some("created".to_string());
        record.updated_at = Utc::now();
        self.store.upsert_record(&record).await?;
        Ok(container_id)
    }

    /// Poll until the runtime reports the container running.
    async fn confirm_running(&self, name: &str) -> std::result::Result<(), ContainerError> {
        let interval = Duration::from_millis(self.config.start_confirm_interval_ms);
        let mut last = RuntimeStatus::Missing;
        for poll in 0..self.config.start_confirm_polls.max(1) {
            last = self.runtime.status(name).await?;
            match last {
                RuntimeStatus::Running => return Ok(()),
                RuntimeStatus::Missing => {
                    return Err(ContainerError::NotFound(name.to_string()));
                }
                _ => {
                    debug!("Container {} is {} (poll {})", name, last.as_str(), poll + 1);
                    tokio::time::sleep(interval).await;
                }
            }
        }
        Err(ContainerError::Other(format!(
            "container {} did not reach running (last status: {})",
            name,
            last.as_str()
        )))
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        let this = self;
        self.retry
            .run("start container", move || async move {
                this.runtime.start(name).await?;
                this.confirm_running(name).await
            })
            .await
            .map_err(|e| runtime_failure("start", e))
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        let runtime = &self.runtime;
        self.retry
            .run("stop container", || runtime.stop(name))
            .await
            .map_err(|e| runtime_failure("stop", e))
    }

    /// Materialize a new instance: allocate ports and create its container.
    ///
    /// Ends in `Stopped`; a separate [`start`](Self::start) is required.
    pub async fn create(&self, instance: Instance) -> Result<Instance> {
        if instance.observed != ObservedState::Absent {
            return Err(FleetError::InvalidState {
                id: instance.id,
                operation: Operation::Create,
                state: instance.observed,
            });
        }
        if self.store.get_instance(instance.id).await?.is_none() {
            self.store.insert_instance(&instance).await?;
        }

        let id = instance.id;
        self.run_marked(id, Operation::Create, |instance| self.create_locked(instance))
            .await
    }

    async fn prepare_create(&self, instance: &Instance) -> Result<(PortTriple, LaunchSpec)> {
        let ports = self
            .allocator
            .allocate(instance.id, instance.spec.preferred_ports)
            .await?;
        match LaunchSpecComposer::compose(instance, ports) {
            Ok(launch) => Ok((ports, launch)),
            Err(e) => {
                self.allocator.release(instance.id).await?;
                Err(e)
            }
        }
    }

    async fn create_locked(&self, mut instance: Instance) -> Result<Instance> {
        let id = instance.id;
        if instance.observed != ObservedState::Absent {
            return Err(FleetError::InvalidState {
                id,
                operation: Operation::Create,
                state: instance.observed,
            });
        }

        // Rejections before any runtime call leave no trace behind.
        let (ports, launch) = match self.prepare_create(&instance).await {
            Ok(prepared) => prepared,
            Err(e) => {
                info!("Create of instance {} rejected: {}", id, e);
                self.store.delete_instance(id).await?;
                return Err(e);
            }
        };

        self.store
            .upsert_record(&ContainerRecord::new(id, container_name(id)))
            .await?;
        self.advance(&mut instance, Operation::Create, ObservedState::Creating)
            .await?;

        match self.recreate_container(&instance, &launch, ports).await {
            Ok(container_id) => {
                instance.desired = DesiredState::Stopped;
                instance.last_error = None;
                self.advance(&mut instance, Operation::Create, ObservedState::Stopped)
                    .await?;
                info!(
                    "Created instance {} as {} ({}) on {}",
                    id,
                    container_name(id),
                    container_id,
                    ports
                );
                Ok(instance)
            }
            Err(e) => {
                self.record_fault(&mut instance, ObservedState::Failed, &e)
                    .await?;
                Err(e)
            }
        }
    }

    /// Provision, compose and start the instance's server.
    ///
    /// Starting an instance that is already `Running` returns it unchanged.
    pub async fn start(&self, id: InstanceId) -> Result<Instance> {
        self.run_marked(id, Operation::Start, |instance| self.start_locked(instance))
            .await
    }

    async fn start_locked(&self, mut instance: Instance) -> Result<Instance> {
        let id = instance.id;
        match instance.observed {
            ObservedState::Running => {
                debug!("Instance {} already running", id);
                return Ok(instance);
            }
            ObservedState::Stopped | ObservedState::Failed => {}
            state => {
                return Err(FleetError::InvalidState {
                    id,
                    operation: Operation::Start,
                    state,
                });
            }
        }

        let ports = self.ports_of(&instance).await?;
        let launch = LaunchSpecComposer::compose(&instance, ports)?;
        instance.desired = DesiredState::Running;

        let provisioned = match self.provisioner.ensure_provisioned(&instance, false).await {
            Ok(result) => result,
            Err(e) => {
                let state = instance.observed;
                self.record_fault(&mut instance, state, &e).await?;
                return Err(e);
            }
        };
        instance.warnings = provisioned.warnings();

        let name = container_name(id);
        let started = async {
            let record = self.store.get_record(id).await?;
            let fingerprint = launch.fingerprint()?;
            let current = self
                .runtime
                .status(&name)
                .await
                .map_err(|e| runtime_failure("status", e))?;
            let drifted = record
                .as_ref()
                .and_then(|r| r.launch_fingerprint.as_deref())
                != Some(fingerprint.as_str());

            if current == RuntimeStatus::Missing || drifted {
                info!(
                    "Recreating container {} ({})",
                    name,
                    if drifted { "configuration changed" } else { "missing" }
                );
                self.recreate_container(&instance, &launch, ports).await?;
            }
            self.start_container(&name).await
        }
        .await;

        match started {
            Ok(()) => {
                instance.last_error = None;
                self.advance(&mut instance, Operation::Start, ObservedState::Running)
                    .await?;
                self.record_outcome(id, Some(RuntimeStatus::Running), "started")
                    .await?;
                info!("Instance {} running on {}", id, ports);
                Ok(instance)
            }
            Err(e) => {
                self.record_fault(&mut instance, ObservedState::Failed, &e)
                    .await?;
                Err(e)
            }
        }
    }

    /// Stop the instance's server.
    ///
    /// A no-op on `Absent` and `Stopped` instances, so the expiry governor
    /// may call it unconditionally.
    pub async fn stop(&self, id: InstanceId) -> Result<Instance> {
        self.run_marked(id, Operation::Stop, |instance| self.stop_locked(instance))
            .await
    }

    async fn stop_locked(&self, mut instance: Instance) -> Result<Instance> {
        let id = instance.id;
        match instance.observed {
            ObservedState::Absent | ObservedState::Stopped => {
                debug!("Instance {} already {}", id, instance.observed);
                return Ok(instance);
            }
            ObservedState::Running | ObservedState::Updating => {
                self.advance(&mut instance, Operation::Stop, ObservedState::Stopping)
                    .await?;
            }
            ObservedState::Failed => {}
            state => {
                return Err(FleetError::InvalidState {
                    id,
                    operation: Operation::Stop,
                    state,
                });
            }
        }
        instance.desired = DesiredState::Stopped;

        match self.stop_container(&container_name(id)).await {
            Ok(()) => {
                self.advance(&mut instance, Operation::Stop, ObservedState::Stopped)
                    .await?;
                self.record_outcome(id, Some(RuntimeStatus::Stopped), "stopped")
                    .await?;
                info!("Instance {} stopped", id);
                Ok(instance)
            }
            Err(e) => {
                self.record_fault(&mut instance, ObservedState::Failed, &e)
                    .await?;
                Err(e)
            }
        }
    }

    /// Force-update binaries and image, then recreate the container.
    ///
    /// A running instance is restarted; a stopped one stays stopped. Any
    /// failure leaves the instance `Stopped` with the fault recorded.
    pub async fn update(&self, id: InstanceId) -> Result<Instance> {
        self.run_marked(id, Operation::Update, |instance| self.update_locked(instance))
            .await
    }

    async fn update_locked(&self, mut instance: Instance) -> Result<Instance> {
        let id = instance.id;
        let was_running = match instance.observed {
            ObservedState::Running => true,
            ObservedState::Stopped => false,
            state => {
                return Err(FleetError::InvalidState {
                    id,
                    operation: Operation::Update,
                    state,
                });
            }
        };

        let ports = self.ports_of(&instance).await?;
        let launch = LaunchSpecComposer::compose(&instance, ports)?;
        self.advance(&mut instance, Operation::Update, ObservedState::Updating)
            .await?;

        let name = container_name(id);
        let image = instance
            .spec
            .image
            .clone()
            .unwrap_or_else(|| self.settings.image.clone());

        let updated = async {
            let provisioned = self.provisioner.ensure_provisioned(&instance, true).await?;
            self.runtime
                .rebuild_image(&image)
                .await
                .map_err(|e| runtime_failure("image rebuild", e))?;
            self.stop_container(&name).await?;
            self.recreate_container(&instance, &launch, ports).await?;
            if was_running {
                self.start_container(&name).await?;
            }
            Ok::<_, FleetError>(provisioned.warnings())
        }
        .await;

        match updated {
            Ok(warnings) => {
                instance.warnings = warnings;
                instance.last_error = None;
                let (next, status) = if was_running {
                    (ObservedState::Running, RuntimeStatus::Running)
                } else {
                    (ObservedState::Stopped, RuntimeStatus::Stopped)
                };
                self.advance(&mut instance, Operation::Update, next).await?;
                self.record_outcome(id, Some(status), "updated").await?;
                info!("Instance {} updated", id);
                Ok(instance)
            }
            Err(e) => {
                // Never leave the old image serving after a failed update.
                if let Err(stop_err) = self.runtime.stop(&name).await {
                    warn!(
                        "Could not stop {} after failed update: {}",
                        name, stop_err
                    );
                }
                instance.desired = DesiredState::Stopped;
                self.record_fault(&mut instance, ObservedState::Stopped, &e)
                    .await?;
                self.record_outcome(id, Some(RuntimeStatus::Stopped), &e.to_string())
                    .await?;
                Err(e)
            }
        }
    }

    /// Remove the container, release the ports and forget the instance.
    pub async fn delete(&self, id: InstanceId) -> Result<Instance> {
        let result = self
            .run_marked(id, Operation::Delete, |instance| self.delete_locked(instance))
            .await;
        if result.is_ok() {
            self.locks.forget(id);
        }
        result
    }

    async fn delete_locked(&self, mut instance: Instance) -> Result<Instance> {
        let id = instance.id;
        match instance.observed {
            ObservedState::Stopped | ObservedState::Failed | ObservedState::Absent => {}
            state => {
                return Err(FleetError::InvalidState {
                    id,
                    operation: Operation::Delete,
                    state,
                });
            }
        }

        let name = container_name(id);
        let runtime = &self.runtime;
        if let Err(e) = self
            .retry
            .run("remove container", || runtime.remove(&name))
            .await
        {
            let e = runtime_failure("remove", e);
            let state = instance.observed;
            self.record_fault(&mut instance, state, &e).await?;
            return Err(e);
        }

        instance.desired = DesiredState::Absent;
        instance.busy = None;
        self.advance(&mut instance, Operation::Delete, ObservedState::Absent)
            .await?;
        self.allocator.release(id).await?;
        self.store.delete_instance(id).await?;

        let instance_dir = env::instance_dir_path(self.provisioner.data_root(), &id.to_string());
        if let Err(e) = tokio::fs::remove_dir_all(&instance_dir).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("Could not remove {}: {}", instance_dir.display(), e);
        }

        info!("Deleted instance {}", id);
        Ok(instance)
    }

    /// Current instance state with ports and a refreshed container record.
    pub async fn status(&self, id: InstanceId) -> Result<InstanceStatus> {
        let instance = self.load(id).await?;
        let ports = self.allocator.assignment(id).await?;
        let mut record = self.store.get_record(id).await?;

        if let Some(record) = record.as_mut()
            && instance.busy.is_none()
        {
            match self.runtime.status(&record.container_name).await {
                Ok(status) if status != record.runtime_status => {
                    record.runtime_status = status;
                    record.updated_at = Utc::now();
                    self.store.upsert_record(record).await?;
                }
                Ok(_) => {}
                Err(e) => debug!("Runtime status of {} unavailable: {}", id, e),
            }
        }

        Ok(InstanceStatus {
            instance,
            ports,
            record,
        })
    }

    /// Reconcile after a restart: clear stale busy markers and settle
    /// interrupted operations against what the runtime actually reports.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport {
            cleared_markers: self.store.clear_busy_markers().await?,
            ..Default::default()
        };
        if report.cleared_markers > 0 {
            warn!(
                "Cleared {} stale busy markers from a previous run",
                report.cleared_markers
            );
        }

        for instance in self.store.list_instances().await? {
            let id = instance.id;
            let Some(_guard) = self.locks.try_acquire(id) else {
                continue;
            };
            let before = instance.observed;
            if !before.is_transient() && before != ObservedState::Running {
                continue;
            }

            let status = match self.runtime.status(&container_name(id)).await {
                Ok(status) => status,
                Err(e) => {
                    warn!("Cannot reconcile instance {}: {}", id, e);
                    continue;
                }
            };

            let (after, note) = match (before, status) {
                (ObservedState::Running, RuntimeStatus::Running) => continue,
                (ObservedState::Running, _) => {
                    (ObservedState::Failed, "container is no longer running")
                }
                (ObservedState::Creating, RuntimeStatus::Missing) => {
                    (ObservedState::Failed, "interrupted during create")
                }
                (_, RuntimeStatus::Running) => (ObservedState::Running, "interrupted operation"),
                (ObservedState::Updating, _) => (ObservedState::Stopped, "interrupted during update"),
                _ => (ObservedState::Stopped, "interrupted operation"),
            };

            let mut instance = instance;
            instance.observed = after;
            instance.busy = None;
            if after == ObservedState::Failed || before == ObservedState::Updating {
                instance.last_error = Some(note.to_string());
            }
            instance.updated_at = Utc::now();
            self.store.update_instance(&instance).await?;
            self.record_outcome(id, Some(status), note).await?;

            info!("Recovered instance {}: {} -> {} ({})", id, before, after, note);
            report.reconciled.push((id, before, after));
        }

        Ok(report)
    }
}
