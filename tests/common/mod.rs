//! Shared fakes for integration tests.
//!
//! Nothing here touches Docker or the network: the container runtime is a
//! scripted in-memory map, SteamCMD is an executor that writes the files a
//! real download would, and the store is an in-memory sqlite database.

#![allow(dead_code)]

use async_trait::async_trait;
use gamefleet::config::FleetConfig;
use gamefleet::container::{ContainerError, ContainerRuntime, ContainerSpec};
use gamefleet::executor::{CommandExecutor, ExecutionCommand, ExecutionResult, ExecutorError};
use gamefleet::fleet::{Caller, Fleet, FleetBuilder};
use gamefleet::governor::{ChannelNotifier, FleetEvent};
use gamefleet::model::{Instance, InstanceSpec, RuntimeStatus, TokenType};
use gamefleet::provision::workshop_content_dir;
use gamefleet::allocator::PortProbe;
use gamefleet::store::Store;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

/// In-memory container runtime with failure injection.
#[derive(Default)]
pub struct ScriptedRuntime {
    containers: Mutex<HashMap<String, RuntimeStatus>>,
    specs: Mutex<HashMap<String, ContainerSpec>>,
    pub starts: AtomicU32,
    pub stops: AtomicU32,
    pub creates: AtomicU32,
    pub rebuilds: AtomicU32,
    /// Remaining start calls that fail before starts succeed again
    pub failing_starts: AtomicU32,
    pub fail_stop: AtomicBool,
    pub fail_rebuild: AtomicBool,
    /// Delay inside `start`, to widen race windows
    pub start_delay_ms: AtomicU32,
}

impl ScriptedRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn status_of(&self, name: &str) -> RuntimeStatus {
        self.containers
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(RuntimeStatus::Missing)
    }

    pub fn spec_of(&self, name: &str) -> Option<ContainerSpec> {
        self.specs.lock().unwrap().get(name).cloned()
    }

    /// Simulate a container dying outside our control.
    pub fn kill(&self, name: &str) {
        self.containers
            .lock()
            .unwrap()
            .insert(name.to_string(), RuntimeStatus::Stopped);
    }

    pub fn start_count(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, ContainerError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.containers
            .lock()
            .unwrap()
            .insert(spec.name.clone(), RuntimeStatus::Stopped);
        self.specs
            .lock()
            .unwrap()
            .insert(spec.name.clone(), spec.clone());
        Ok(format!("id-{}", spec.name))
    }

    async fn start(&self, name: &str) -> Result<(), ContainerError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let delay = self.start_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        let remaining = self.failing_starts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_starts.store(remaining - 1, Ordering::SeqCst);
            return Err(ContainerError::Other("injected start failure".into()));
        }

        let mut containers = self.containers.lock().unwrap();
        match containers.get_mut(name) {
            Some(status) => {
                *status = RuntimeStatus::Running;
                Ok(())
            }
            None => Err(ContainerError::NotFound(name.to_string())),
        }
    }

    async fn stop(&self, name: &str) -> Result<(), ContainerError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(ContainerError::Other("injected stop failure".into()));
        }
        if let Some(status) = self.containers.lock().unwrap().get_mut(name) {
            *status = RuntimeStatus::Stopped;
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), ContainerError> {
        self.containers.lock().unwrap().remove(name);
        self.specs.lock().unwrap().remove(name);
        Ok(())
    }

    async fn status(&self, name: &str) -> Result<RuntimeStatus, ContainerError> {
        Ok(self.status_of(name))
    }

    async fn rebuild_image(&self, _image: &str) -> Result<(), ContainerError> {
        self.rebuilds.fetch_add(1, Ordering::SeqCst);
        if self.fail_rebuild.load(Ordering::SeqCst) {
            return Err(ContainerError::ExecutionError("injected build failure".into()));
        }
        Ok(())
    }

    fn runtime_name(&self) -> &'static str {
        "scripted"
    }
}

/// Port probe reporting a fixed set of ports as held by other processes.
#[derive(Default)]
pub struct StaticProbe {
    taken: Mutex<HashSet<u16>>,
}

impl StaticProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn occupy(&self, port: u16) {
        self.taken.lock().unwrap().insert(port);
    }
}

#[async_trait]
impl PortProbe for StaticProbe {
    async fn is_free(&self, port: u16) -> bool {
        !self.taken.lock().unwrap().contains(&port)
    }
}

/// Pretends to be SteamCMD by creating the files a real download would.
#[derive(Default)]
pub struct FakeSteam {
    pub fail_app_update: AtomicBool,
    /// Workshop items whose download fails
    pub failing_mods: Mutex<HashSet<u64>>,
    pub calls: Mutex<Vec<Vec<String>>>,
}

impl FakeSteam {
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl CommandExecutor for FakeSteam {
    async fn execute(&self, cmd: ExecutionCommand) -> Result<ExecutionResult, ExecutorError> {
        self.calls.lock().unwrap().push(cmd.args.clone());
        let install_dir = PathBuf::from(&cmd.args[1]);

        if cmd.args.iter().any(|a| a == "+app_update") {
            if self.fail_app_update.load(Ordering::SeqCst) {
                return Ok(ExecutionResult::failed(8, "ERROR! Failed to install app"));
            }
            let defaults = gamefleet::config::ProvisioningConfig::default();
            let binary = install_dir.join(&defaults.native_binary);
            std::fs::create_dir_all(binary.parent().unwrap())?;
            std::fs::write(binary, b"elf")?;
            return Ok(ExecutionResult::ok("Success! App fully installed."));
        }

        let mod_id: u64 = cmd.args[6].parse().unwrap();
        if self.failing_mods.lock().unwrap().contains(&mod_id) {
            return Ok(ExecutionResult::failed(5, "ERROR! Download item failed (File Not Found)."));
        }
        let content = workshop_content_dir(&install_dir, &cmd.args[5], mod_id);
        std::fs::create_dir_all(&content)?;
        std::fs::write(content.join("mod.info"), mod_id.to_string())?;
        Ok(ExecutionResult::ok("Success. Downloaded item"))
    }

    fn executor_type(&self) -> &'static str {
        "fake-steam"
    }
}

/// A fleet wired to fakes, with handles on each of them.
pub struct TestFleet {
    pub fleet: Fleet,
    pub runtime: Arc<ScriptedRuntime>,
    pub steam: Arc<FakeSteam>,
    pub probe: Arc<StaticProbe>,
    pub events: UnboundedReceiver<FleetEvent>,
    pub temp_dir: TempDir,
}

pub fn test_config(temp_dir: &TempDir) -> FleetConfig {
    let mut config = FleetConfig::default();
    config.data_root = temp_dir.path().to_path_buf();
    config.provisioning.steamcmd_path = Some(PathBuf::from("/usr/games/steamcmd"));
    config.lifecycle.retry_backoff_ms = 1;
    config.lifecycle.max_backoff_ms = 5;
    config.lifecycle.start_confirm_polls = 3;
    config.lifecycle.start_confirm_interval_ms = 1;
    config
}

pub async fn test_fleet() -> TestFleet {
    test_fleet_with(|_| {}).await
}

pub async fn test_fleet_with(adjust: impl FnOnce(&mut FleetConfig)) -> TestFleet {
    let temp_dir = TempDir::new().unwrap();
    let mut config = test_config(&temp_dir);
    adjust(&mut config);

    let runtime = ScriptedRuntime::new();
    let steam = Arc::new(FakeSteam::default());
    let probe = Arc::new(StaticProbe::new());
    let (notifier, events) = ChannelNotifier::new();

    let fleet = FleetBuilder::new(config)
        .store(Store::in_memory().await.unwrap())
        .runtime(runtime.clone())
        .executor(steam.clone())
        .probe(probe.clone())
        .notifier(Arc::new(notifier))
        .build()
        .await
        .unwrap();

    TestFleet {
        fleet,
        runtime,
        steam,
        probe,
        events,
        temp_dir,
    }
}

pub fn tenant(owner: &str) -> Caller {
    Caller::Tenant(owner.to_string())
}

pub fn spec(name: &str) -> InstanceSpec {
    InstanceSpec::new(name, "TheIsland", 10)
}

impl TestFleet {
    /// Issue, activate and bind a token valid for `days`.
    pub async fn grant(&self, instance: &Instance, days: i64) -> String {
        let tokens = self.fleet.tokens();
        let token = tokens
            .issue(TokenType::Issuance, Some(days))
            .await
            .unwrap();
        tokens.activate(&token.token, &instance.owner).await.unwrap();
        tokens.bind(instance.id, &token.token).await.unwrap();
        token.token
    }

    /// Create an instance for `owner`, grant it a token and start it.
    pub async fn running_instance(&self, owner: &str, days: i64) -> Instance {
        let caller = tenant(owner);
        let instance = self
            .fleet
            .create_instance(&caller, spec(&format!("{}'s server", owner)))
            .await
            .unwrap();
        self.grant(&instance, days).await;
        self.fleet.start_instance(&caller, instance.id).await.unwrap()
    }

    pub fn drain_events(&mut self) -> Vec<FleetEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}
