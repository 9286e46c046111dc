//! # Fleet
//!
//! Composition root: builds every component from one [`FleetConfig`] and
//! exposes the user-facing operations with their access checks.
//!
//! ```text
//! ┌───────────────────────────── Fleet ─────────────────────────────┐
//! │  TokenService   WorkerPool ─▶ ContainerLifecycleManager          │
//! │                                 ├─ ResourceAllocator             │
//! │  ExpiryGovernor ───────────────▶├─ BinaryProvisioningPipeline    │
//! │   └─ Scheduler                  └─ ContainerRuntime              │
//! │  BackupManager                                                   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Tenant requests go through ownership checks and, for `start`, need a
//! valid bound token. The governor talks to the lifecycle manager directly
//! and bypasses both.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use gamefleet::config::FleetConfig;
//! use gamefleet::fleet::{Caller, FleetBuilder};
//! use gamefleet::model::InstanceSpec;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let fleet = FleetBuilder::new(FleetConfig::default()).build().await?;
//!     let caller = Caller::Tenant("alice".to_string());
//!
//!     let spec = InstanceSpec::new("Friday Night", "TheIsland", 20);
//!     let instance = fleet.create_instance(&caller, spec).await?;
//!     println!("Created {}", instance.id);
//!     Ok(())
//! }
//! ```

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use crate::allocator::{PortProbe, ResourceAllocator, SocketProbe};
use crate::backup::BackupManager;
use crate::config::FleetConfig;
use crate::container::ContainerRuntime;
use crate::error::{FleetError, Result};
use crate::executor::{CommandExecutor, HostExecutor};
use crate::governor::{
    ExpiryGovernor, FanoutNotifier, LogNotifier, NotificationSink, Scheduler, WebhookNotifier,
    register_passes,
};
use crate::launch::LaunchSpecComposer;
use crate::lifecycle::{ContainerLifecycleManager, InstanceStatus, LifecycleRequest, WorkerPool};
use crate::model::{Instance, InstanceId, InstanceSpec, OwnerId};
use crate::provision::BinaryProvisioningPipeline;
use crate::store::Store;
use crate::tokens::TokenService;

/// Who is asking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    /// Fleet operator; not bound by ownership
    Operator,
    Tenant(OwnerId),
}

impl Caller {
    fn owner_for_create(&self, requested: Option<&str>) -> Result<OwnerId> {
        match (self, requested) {
            (Caller::Tenant(owner), None) => Ok(owner.clone()),
            (Caller::Tenant(owner), Some(other)) if owner == other => Ok(owner.clone()),
            (Caller::Tenant(owner), Some(other)) => Err(FleetError::AccessDenied(format!(
                "{} cannot create instances for {}",
                owner, other
            ))),
            (Caller::Operator, Some(owner)) => Ok(owner.to_string()),
            (Caller::Operator, None) => Err(FleetError::Config(
                "an owner is required when creating as operator".into(),
            )),
        }
    }

    fn check_owns(&self, instance: &Instance) -> Result<()> {
        match self {
            Caller::Operator => Ok(()),
            Caller::Tenant(owner) if *owner == instance.owner => Ok(()),
            Caller::Tenant(owner) => Err(FleetError::AccessDenied(format!(
                "{} does not own instance {}",
                owner, instance.id
            ))),
        }
    }
}

/// Builds a [`Fleet`], with every collaborator replaceable.
pub struct FleetBuilder {
    config: FleetConfig,
    store: Option<Store>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    executor: Option<Arc<dyn CommandExecutor>>,
    probe: Option<Arc<dyn PortProbe>>,
    notifier: Option<Arc<dyn NotificationSink>>,
}

impl FleetBuilder {
    pub fn new(config: FleetConfig) -> Self {
        Self {
            config,
            store: None,
            runtime: None,
            executor: None,
            probe: None,
            notifier: None,
        }
    }

    pub fn store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    pub fn runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn PortProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub async fn build(self) -> Result<Fleet> {
        let config = self.config;
        config.validate()?;

        let store = match self.store {
            Some(store) => store,
            None => {
                tokio::fs::create_dir_all(&config.data_root).await?;
                Store::open(&config.store_url(), config.store.max_connections).await?
            }
        };
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => default_runtime(&config).await?,
        };
        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(HostExecutor::new()));
        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(SocketProbe::new(config.ports.bind_address)));
        let notifier = match self.notifier {
            Some(notifier) => notifier,
            None => default_notifier(&config)?,
        };

        let allocator = Arc::new(ResourceAllocator::new(
            store.clone(),
            probe,
            config.ports.clone(),
        ));
        let provisioner = Arc::new(BinaryProvisioningPipeline::new(
            executor,
            config.provisioning.clone(),
            config.data_root.clone(),
        ));
        let lifecycle = Arc::new(ContainerLifecycleManager::new(
            store.clone(),
            allocator,
            provisioner,
            runtime.clone(),
            config.container.clone(),
            config.lifecycle.clone(),
        ));
        let pool = WorkerPool::new(lifecycle.clone(), config.lifecycle.max_concurrent_operations);
        let governor = Arc::new(ExpiryGovernor::new(
            lifecycle.clone(),
            notifier,
            config.governor.clone(),
        ));
        let tokens = TokenService::new(store.clone(), config.governor.token_expiry_days);
        let backups = BackupManager::new(
            lifecycle.clone(),
            config.data_root.clone(),
            config.backup.keep,
        );

        info!(
            "Fleet ready: runtime {}, data root {}",
            runtime.runtime_name(),
            config.data_root.display()
        );
        Ok(Fleet {
            config,
            store,
            lifecycle,
            pool,
            governor,
            tokens,
            backups,
        })
    }
}

#[cfg(feature = "containers")]
async fn default_runtime(config: &FleetConfig) -> Result<Arc<dyn ContainerRuntime>> {
    let runtime = crate::container::DockerRuntime::connect(config.container.clone()).await?;
    Ok(Arc::new(runtime))
}

#[cfg(not(feature = "containers"))]
async fn default_runtime(_config: &FleetConfig) -> Result<Arc<dyn ContainerRuntime>> {
    Err(FleetError::Config(
        "built without the `containers` feature; supply a runtime".into(),
    ))
}

fn default_notifier(config: &FleetConfig) -> Result<Arc<dyn NotificationSink>> {
    let mut fanout = FanoutNotifier::new().with(LogNotifier);
    if let Some(url) = &config.notifications.webhook_url {
        let webhook = WebhookNotifier::new(url.clone())
            .map_err(|e| FleetError::Config(format!("webhook client: {}", e)))?;
        fanout = fanout.with(webhook);
    }
    Ok(Arc::new(fanout))
}

pub struct Fleet {
    config: FleetConfig,
    store: Store,
    lifecycle: Arc<ContainerLifecycleManager>,
    pool: WorkerPool,
    governor: Arc<ExpiryGovernor>,
    tokens: TokenService,
    backups: BackupManager,
}

impl Fleet {
    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn lifecycle(&self) -> &Arc<ContainerLifecycleManager> {
        &self.lifecycle
    }

    pub fn governor(&self) -> &Arc<ExpiryGovernor> {
        &self.governor
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    async fn load(&self, id: InstanceId) -> Result<Instance> {
        self.store
            .get_instance(id)
            .await?
            .ok_or(FleetError::InstanceNotFound(id))
    }

    async fn load_owned(&self, caller: &Caller, id: InstanceId) -> Result<Instance> {
        let instance = self.load(id).await?;
        caller.check_owns(&instance)?;
        Ok(instance)
    }

    /// Create an instance for the caller (or, for operators, for `owner`).
    pub async fn create_instance_for(
        &self,
        caller: &Caller,
        owner: Option<&str>,
        spec: InstanceSpec,
    ) -> Result<Instance> {
        let owner = caller.owner_for_create(owner)?;
        let instance = Instance::new(owner, spec);
        self.pool
            .run(LifecycleRequest::Create(Box::new(instance)))
            .await
    }

    pub async fn create_instance(&self, caller: &Caller, spec: InstanceSpec) -> Result<Instance> {
        self.create_instance_for(caller, None, spec).await
    }

    /// Start an instance. Needs ownership and a valid bound token.
    pub async fn start_instance(&self, caller: &Caller, id: InstanceId) -> Result<Instance> {
        let instance = self.load_owned(caller, id).await?;
        let owner = match caller {
            Caller::Operator => instance.owner.clone(),
            Caller::Tenant(owner) => owner.clone(),
        };
        self.tokens.authorize(&owner, &instance, Utc::now()).await?;
        self.pool.run(LifecycleRequest::Start(id)).await
    }

    pub async fn stop_instance(&self, caller: &Caller, id: InstanceId) -> Result<Instance> {
        self.load_owned(caller, id).await?;
        self.pool.run(LifecycleRequest::Stop(id)).await
    }

    pub async fn update_instance(&self, caller: &Caller, id: InstanceId) -> Result<Instance> {
        self.load_owned(caller, id).await?;
        self.pool.run(LifecycleRequest::Update(id)).await
    }

    pub async fn delete_instance(&self, caller: &Caller, id: InstanceId) -> Result<Instance> {
        self.load_owned(caller, id).await?;
        self.pool.run(LifecycleRequest::Delete(id)).await
    }

    pub async fn status(&self, caller: &Caller, id: InstanceId) -> Result<InstanceStatus> {
        self.load_owned(caller, id).await?;
        self.lifecycle.status(id).await
    }

    pub async fn list_instances(&self, caller: &Caller) -> Result<Vec<Instance>> {
        match caller {
            Caller::Operator => self.store.list_instances().await,
            Caller::Tenant(owner) => self.store.list_instances_for_owner(owner).await,
        }
    }

    /// Shell-escaped server command line an instance would run with. Display only.
    pub async fn launch_line(&self, caller: &Caller, id: InstanceId) -> Result<String> {
        let instance = self.load_owned(caller, id).await?;
        let status = self.lifecycle.status(id).await?;
        let ports = status.ports.ok_or_else(|| {
            FleetError::LaunchSpecInvalid(format!("instance {} has no ports assigned", id))
        })?;
        let launch = LaunchSpecComposer::compose(&instance, ports)?;

        let provisioner = self.lifecycle.provisioner();
        let install_dir = provisioner.install_dir(&instance);
        let program = match provisioner
            .layout()
            .resolve(&install_dir, instance.spec.force_compat_layer)
        {
            Some(binary) => {
                let (program, mut prefix) = binary.invocation(&self.config.provisioning.compat_shim);
                prefix.insert(0, program);
                prefix.join(" ")
            }
            None => install_dir
                .join(&provisioner.layout().native)
                .display()
                .to_string(),
        };
        Ok(launch.display_line(&program))
    }

    /// Run as a service: recover, schedule the governor passes and wait for
    /// ctrl-c.
    pub async fn serve(&self) -> Result<()> {
        let report = self.lifecycle.recover().await?;
        if !report.reconciled.is_empty() {
            info!(
                "Reconciled {} instances after restart",
                report.reconciled.len()
            );
        }

        let mut scheduler = Scheduler::new();
        register_passes(&mut scheduler, &self.governor);
        scheduler.start();

        info!("Serving; press ctrl-c to stop");
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Could not listen for ctrl-c: {}", e);
        }

        info!("Shutting down");
        scheduler.shutdown().await;
        self.pool.shutdown();
        self.store.close().await;
        Ok(())
    }
}
