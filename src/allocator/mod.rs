//! Port-triple allocation.
//!
//! [`ResourceAllocator`] hands every instance a game/query/admin-console
//! port triple that is disjoint from every other active assignment. A
//! candidate must be free both in the persisted `reserved_ports` table and
//! on the live host (the table cannot see ports held by unrelated
//! processes). The reservation itself is a single transaction whose
//! uniqueness guarantee comes from the database, so concurrent creates never
//! need a global lock; a loser of a race just moves on to the next
//! candidate.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::PortsConfig;
use crate::error::{FleetError, Result};
use crate::model::{InstanceId, ObservedState, Operation, PortTriple};
use crate::store::Store;
use crate::store::ports::Reservation;

mod probe;

pub use probe::{PortProbe, SocketProbe};
#[cfg(test)]
pub(crate) use probe::StaticProbe;

pub struct ResourceAllocator {
    store: Store,
    probe: Arc<dyn PortProbe>,
    config: PortsConfig,
}

impl ResourceAllocator {
    pub fn new(store: Store, probe: Arc<dyn PortProbe>, config: PortsConfig) -> Self {
        Self {
            store,
            probe,
            config,
        }
    }

    /// Reserve a port triple for `instance_id`.
    ///
    /// Scans `base + k * stride` for `k` in `0..max_candidates`, starting from
    /// `preferred` or the configured base.
    pub async fn allocate(
        &self,
        instance_id: InstanceId,
        preferred: Option<PortTriple>,
    ) -> Result<PortTriple> {
        let base = preferred.unwrap_or_else(|| self.config.base());
        let mut conflicts = 0u32;

        for index in 0..self.config.max_candidates {
            let Some(candidate) = base.offset(index, self.config.stride) else {
                debug!("Port candidates past {} overflow, stopping scan", base);
                break;
            };

            if !candidate.is_pairwise_distinct() {
                continue;
            }

            if !self.is_candidate_free(candidate).await? {
                continue;
            }

            match self
                .store
                .reserve_ports(instance_id, candidate, Utc::now())
                .await?
            {
                Reservation::Reserved => {
                    info!("Allocated ports {} to instance {}", candidate, instance_id);
                    return Ok(candidate);
                }
                Reservation::Conflict => {
                    conflicts += 1;
                    warn!(
                        "Port conflict on {} for instance {} ({}/{})",
                        candidate, instance_id, conflicts, self.config.max_conflict_retries
                    );
                    if conflicts >= self.config.max_conflict_retries {
                        return Err(FleetError::ResourceExhausted(format!(
                            "gave up after {} reservation conflicts",
                            conflicts
                        )));
                    }
                }
            }
        }

        Err(FleetError::ResourceExhausted(format!(
            "no free port triple in {} candidates from {} (stride {})",
            self.config.max_candidates, base, self.config.stride
        )))
    }

    async fn is_candidate_free(&self, candidate: PortTriple) -> Result<bool> {
        for port in candidate.ports() {
            if self.store.is_port_reserved(port).await? {
                return Ok(false);
            }
        }
        for port in candidate.ports() {
            if !self.probe.is_free(port).await {
                debug!("Port {} is held by a process outside the fleet", port);
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Drop the port assignment of a deleted instance.
    ///
    /// Fails with `InvalidState` while the instance still exists in any state
    /// other than `Absent`.
    pub async fn release(&self, instance_id: InstanceId) -> Result<()> {
        if let Some(instance) = self.store.get_instance(instance_id).await?
            && instance.observed != ObservedState::Absent
        {
            return Err(FleetError::InvalidState {
                id: instance_id,
                operation: Operation::Delete,
                state: instance.observed,
            });
        }

        if self.store.release_ports(instance_id).await? {
            info!("Released ports of instance {}", instance_id);
        }
        Ok(())
    }

    /// Current assignment of an instance
    pub async fn assignment(&self, instance_id: InstanceId) -> Result<Option<PortTriple>> {
        Ok(self
            .store
            .get_port_assignment(instance_id)
            .await?
            .map(|a| a.ports))
    }
}
