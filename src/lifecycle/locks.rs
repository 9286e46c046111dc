//! Per-instance mutual exclusion.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::model::InstanceId;

/// One async mutex per instance, created on first use.
///
/// Operations on the same instance queue behind each other; operations on
/// different instances never contend.
#[derive(Debug, Default)]
pub struct InstanceLocks {
    locks: DashMap<InstanceId, Arc<Mutex<()>>>,
}

impl InstanceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`.
    pub async fn acquire(&self, id: InstanceId) -> OwnedMutexGuard<()> {
        // Clone out of the map before awaiting so no shard lock is held across
        // the await.
        let lock = self.locks.entry(id).or_default().clone();
        lock.lock_owned().await
    }

    /// Exclusive access without waiting, if nobody holds the instance.
    pub fn try_acquire(&self, id: InstanceId) -> Option<OwnedMutexGuard<()>> {
        let lock = self.locks.entry(id).or_default().clone();
        lock.try_lock_owned().ok()
    }

    /// Drop the lock of a deleted instance. Current holders keep their guard.
    pub fn forget(&self, id: InstanceId) {
        self.locks.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
