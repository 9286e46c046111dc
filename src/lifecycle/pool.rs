//! Bounded worker pool for user-triggered lifecycle requests.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;

use super::ContainerLifecycleManager;
use crate::error::{FleetError, Result};
use crate::model::{Instance, InstanceId, Operation};

/// A lifecycle operation submitted for background execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LifecycleRequest {
    Create(Box<Instance>),
    Start(InstanceId),
    Stop(InstanceId),
    Update(InstanceId),
    Delete(InstanceId),
}

impl LifecycleRequest {
    pub fn instance_id(&self) -> InstanceId {
        match self {
            LifecycleRequest::Create(instance) => instance.id,
            LifecycleRequest::Start(id)
            | LifecycleRequest::Stop(id)
            | LifecycleRequest::Update(id)
            | LifecycleRequest::Delete(id) => *id,
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            LifecycleRequest::Create(_) => Operation::Create,
            LifecycleRequest::Start(_) => Operation::Start,
            LifecycleRequest::Stop(_) => Operation::Stop,
            LifecycleRequest::Update(_) => Operation::Update,
            LifecycleRequest::Delete(_) => Operation::Delete,
        }
    }

    /// Execute on `manager` in the calling task.
    pub async fn execute(self, manager: &ContainerLifecycleManager) -> Result<Instance> {
        match self {
            LifecycleRequest::Create(instance) => manager.create(*instance).await,
            LifecycleRequest::Start(id) => manager.start(id).await,
            LifecycleRequest::Stop(id) => manager.stop(id).await,
            LifecycleRequest::Update(id) => manager.update(id).await,
            LifecycleRequest::Delete(id) => manager.delete(id).await,
        }
    }
}

/// Runs at most `max_concurrent` lifecycle requests at once.
///
/// Per-instance ordering is still enforced by the manager's locks; the pool
/// only bounds how many operations (downloads, image builds) run in parallel.
#[derive(Clone)]
pub struct WorkerPool {
    manager: Arc<ContainerLifecycleManager>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
}

impl WorkerPool {
    pub fn new(manager: Arc<ContainerLifecycleManager>, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            manager,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Spawn `request`; it starts once a worker slot is free.
    pub fn submit(&self, request: LifecycleRequest) -> JoinHandle<Result<Instance>> {
        let manager = self.manager.clone();
        let permits = self.permits.clone();
        debug!(
            "Queued {} for instance {}",
            request.operation(),
            request.instance_id()
        );

        tokio::spawn(async move {
            let _permit = permits.acquire_owned().await.map_err(|_| {
                FleetError::RuntimeOperationFailed("worker pool is shut down".to_string())
            })?;
            request.execute(&manager).await
        })
    }

    /// Submit and wait for the outcome.
    pub async fn run(&self, request: LifecycleRequest) -> Result<Instance> {
        self.submit(request).await.map_err(|e| {
            FleetError::RuntimeOperationFailed(format!("lifecycle worker panicked: {}", e))
        })?
    }

    /// Requests currently holding a worker slot
    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.permits.available_permits()
    }

    /// Refuse new work; queued requests fail, running ones finish.
    pub fn shutdown(&self) {
        self.permits.close();
    }

    pub fn manager(&self) -> &Arc<ContainerLifecycleManager> {
        &self.manager
    }
}
