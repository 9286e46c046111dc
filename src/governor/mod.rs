//! # Expiry Governor
//!
//! Recurring reconciliation of token validity against instance state.
//!
//! - **Fine pass**: deactivates lapsed tokens and stops every instance that no
//!   longer has a valid bound token. Stopped instances are scheduled for
//!   deletion after the grace period.
//! - **Daily pass**: emits [`FleetEvent::TokenExpiring`] for tokens inside the
//!   warning window. Never touches lifecycle state.
//! - **Purge pass**: deletes stopped instances whose grace period lapsed.
//!
//! Every pass takes a persisted lease first, so overlapping invocations from
//! cron, the service scheduler or an operator skip instead of racing. A
//! failure on one instance is recorded in the [`PassSummary`] and the pass
//! moves on; the next pass selects the instance again.

pub mod notify;
pub mod scheduler;

pub use notify::{
    ChannelNotifier, FanoutNotifier, FleetEvent, LogNotifier, NotificationSink, WebhookNotifier,
};
pub use scheduler::{Job, Scheduler};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::GovernorConfig;
use crate::error::Result;
use crate::lifecycle::ContainerLifecycleManager;
use crate::model::{Instance, InstanceId, ObservedState};
use crate::store::Store;

/// Instances stopped concurrently within one fine pass
const STOP_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassKind {
    Fine,
    Daily,
    Purge,
}

impl PassKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassKind::Fine => "fine",
            PassKind::Daily => "daily",
            PassKind::Purge => "purge",
        }
    }

    /// Name of the lease guarding this pass
    pub fn lease_name(&self) -> String {
        format!("governor.{}", self.as_str())
    }

    pub fn interval(&self, config: &GovernorConfig) -> std::time::Duration {
        let secs = match self {
            PassKind::Fine => config.fine_interval_minutes * 60,
            PassKind::Daily => config.daily_interval_hours * 3600,
            PassKind::Purge => config.purge_interval_hours * 3600,
        };
        std::time::Duration::from_secs(secs.max(1))
    }

    /// Five-field cron schedule for driving this pass from an external
    /// scheduler instead of `serve`.
    pub fn cron_schedule(&self, config: &GovernorConfig) -> String {
        let hourly = |hours: u64, minute: u32, hour: u32| {
            if hours >= 24 {
                format!("{} {} * * *", minute, hour)
            } else {
                format!("{} */{} * * *", minute, hours.max(1))
            }
        };
        match self {
            PassKind::Fine => format!("*/{} * * * *", config.fine_interval_minutes.max(1)),
            PassKind::Daily => hourly(config.daily_interval_hours, 0, 9),
            PassKind::Purge => hourly(config.purge_interval_hours, 30, 3),
        }
    }
}

impl fmt::Display for PassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one completed pass did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassSummary {
    pub pass: PassKind,
    pub started_at: DateTime<Utc>,
    pub deactivated_tokens: usize,
    pub stopped: Vec<InstanceId>,
    pub purged: Vec<InstanceId>,
    /// Instances the pass could not act on, with the reason
    pub failed: Vec<(InstanceId, String)>,
    pub notified: usize,
}

impl PassSummary {
    fn new(pass: PassKind, started_at: DateTime<Utc>) -> Self {
        Self {
            pass,
            started_at,
            deactivated_tokens: 0,
            stopped: Vec::new(),
            purged: Vec::new(),
            failed: Vec::new(),
            notified: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PassReport {
    /// Another holder had the lease
    Skipped { pass: PassKind },
    Completed(PassSummary),
}

impl PassReport {
    pub fn summary(&self) -> Option<&PassSummary> {
        match self {
            PassReport::Completed(summary) => Some(summary),
            PassReport::Skipped { .. } => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, PassReport::Skipped { .. })
    }
}

pub struct ExpiryGovernor {
    store: Store,
    lifecycle: Arc<ContainerLifecycleManager>,
    notifier: Arc<dyn NotificationSink>,
    config: GovernorConfig,
    /// Lease holder identity of this governor
    holder: String,
}

impl ExpiryGovernor {
    pub fn new(
        lifecycle: Arc<ContainerLifecycleManager>,
        notifier: Arc<dyn NotificationSink>,
        config: GovernorConfig,
    ) -> Self {
        Self {
            store: lifecycle.store().clone(),
            lifecycle,
            notifier,
            config,
            holder: format!("governor-{}", Uuid::new_v4().simple()),
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Run `kind` at the current time.
    pub async fn run(&self, kind: PassKind) -> Result<PassReport> {
        self.run_at(kind, Utc::now()).await
    }

    /// Run `kind` as if the clock read `now`.
    pub async fn run_at(&self, kind: PassKind, now: DateTime<Utc>) -> Result<PassReport> {
        let lease = kind.lease_name();
        let ttl = Duration::seconds(self.config.lease_ttl_secs.max(1));
        if !self.store.try_acquire_lease(&lease, &self.holder, ttl).await? {
            info!("Governor {} pass already running elsewhere, skipping", kind);
            return Ok(PassReport::Skipped { pass: kind });
        }

        let result = match kind {
            PassKind::Fine => self.fine_pass(now).await,
            PassKind::Daily => self.daily_pass(now).await,
            PassKind::Purge => self.purge_pass(now).await,
        };

        if let Err(e) = self.store.release_lease(&lease, &self.holder).await {
            warn!("Could not release lease {}: {}", lease, e);
        }

        let summary = result?;
        info!(
            "Governor {} pass done: {} tokens deactivated, {} stopped, {} purged, {} failed, {} notified",
            kind,
            summary.deactivated_tokens,
            summary.stopped.len(),
            summary.purged.len(),
            summary.failed.len(),
            summary.notified
        );
        Ok(PassReport::Completed(summary))
    }

    async fn fine_pass(&self, now: DateTime<Utc>) -> Result<PassSummary> {
        let mut summary = PassSummary::new(PassKind::Fine, now);

        let expired = self.store.deactivate_expired_tokens(now).await?;
        summary.deactivated_tokens = expired.len();
        for token in &expired {
            debug!("Token {} expired at {}", token.id, token.expires_at);
            self.emit(
                &mut summary,
                FleetEvent::TokenExpired {
                    token_id: token.id,
                    owner: token.owner.clone(),
                },
            )
            .await;
        }

        let mut candidates = Vec::new();
        for instance in self.store.list_instances().await? {
            if !matches!(
                instance.observed,
                ObservedState::Running | ObservedState::Updating | ObservedState::Failed
            ) {
                continue;
            }
            match self.lacks_valid_token(&instance, now).await {
                Ok(true) => candidates.push(instance),
                Ok(false) => {}
                Err(e) => summary.failed.push((instance.id, e.to_string())),
            }
        }

        let permits = Arc::new(Semaphore::new(STOP_CONCURRENCY));
        let mut stops = JoinSet::new();
        for instance in candidates {
            let lifecycle = self.lifecycle.clone();
            let permits = permits.clone();
            stops.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let result = lifecycle.stop(instance.id).await;
                (instance, result)
            });
        }

        let mut outcomes: Vec<(Instance, Result<Instance>)> = Vec::new();
        while let Some(joined) = stops.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!("Governor stop task ended abnormally: {}", e),
            }
        }

        for (instance, result) in outcomes {
            match result {
                Ok(_) => {
                    let deletion_at = now + Duration::days(self.config.grace_period_days);
                    if let Err(e) = self
                        .store
                        .set_scheduled_deletion(instance.id, Some(deletion_at))
                        .await
                    {
                        warn!("Could not schedule deletion of {}: {}", instance.id, e);
                    }
                    info!(
                        "Stopped instance {} of {}: no valid access token",
                        instance.id, instance.owner
                    );
                    summary.stopped.push(instance.id);
                    self.emit(
                        &mut summary,
                        FleetEvent::InstanceStopped {
                            instance_id: instance.id,
                            owner: instance.owner.clone(),
                            reason: "access token expired".to_string(),
                            scheduled_deletion_at: Some(deletion_at),
                        },
                    )
                    .await;
                }
                Err(e) => {
                    error!(
                        "Could not stop instance {}, retrying next pass: {}",
                        instance.id, e
                    );
                    summary.failed.push((instance.id, e.to_string()));
                }
            }
        }

        Ok(summary)
    }

    /// Whether `instance` should be stopped at `now`.
    async fn lacks_valid_token(&self, instance: &Instance, now: DateTime<Utc>) -> Result<bool> {
        let tokens = self.store.tokens_for_instance(instance.id).await?;
        if tokens.is_empty() {
            return Ok(self.config.stop_unbound_instances);
        }
        Ok(!tokens.iter().any(|t| t.is_valid_at(now)))
    }

    async fn daily_pass(&self, now: DateTime<Utc>) -> Result<PassSummary> {
        let mut summary = PassSummary::new(PassKind::Daily, now);
        let until = now + Duration::days(self.config.warning_window_days);

        for token in self.store.list_tokens_expiring_between(now, until).await? {
            self.emit(
                &mut summary,
                FleetEvent::TokenExpiring {
                    token_id: token.id,
                    owner: token.owner.clone(),
                    expires_at: token.expires_at,
                    days_left: token.days_left(now),
                },
            )
            .await;
        }
        Ok(summary)
    }

    async fn purge_pass(&self, now: DateTime<Utc>) -> Result<PassSummary> {
        let mut summary = PassSummary::new(PassKind::Purge, now);

        for instance in self.store.list_instances_due_for_purge(now).await? {
            if !matches!(
                instance.observed,
                ObservedState::Stopped | ObservedState::Failed | ObservedState::Absent
            ) {
                debug!(
                    "Instance {} due for purge but {}, leaving it",
                    instance.id, instance.observed
                );
                continue;
            }

            match self.lifecycle.delete(instance.id).await {
                Ok(_) => {
                    info!("Purged instance {} of {}", instance.id, instance.owner);
                    summary.purged.push(instance.id);
                    self.emit(
                        &mut summary,
                        FleetEvent::InstancePurged {
                            instance_id: instance.id,
                            owner: instance.owner.clone(),
                        },
                    )
                    .await;
                }
                Err(e) => {
                    error!("Could not purge instance {}: {}", instance.id, e);
                    summary.failed.push((instance.id, e.to_string()));
                }
            }
        }
        Ok(summary)
    }

    async fn emit(&self, summary: &mut PassSummary, event: FleetEvent) {
        match self.notifier.notify(&event).await {
            Ok(()) => summary.notified += 1,
            Err(e) => warn!("Could not deliver {} event: {}", event.kind(), e),
        }
    }
}

/// Adapts one governor pass to the [`Job`] interface.
pub struct GovernorJob {
    governor: Arc<ExpiryGovernor>,
    pass: PassKind,
    name: String,
}

impl GovernorJob {
    pub fn new(governor: Arc<ExpiryGovernor>, pass: PassKind) -> Self {
        Self {
            governor,
            pass,
            name: pass.lease_name(),
        }
    }
}

#[async_trait]
impl Job for GovernorJob {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self) -> anyhow::Result<()> {
        self.governor.run(self.pass).await?;
        Ok(())
    }
}

/// Register all three passes on `scheduler` with their configured intervals.
pub fn register_passes(scheduler: &mut Scheduler, governor: &Arc<ExpiryGovernor>) {
    for pass in [PassKind::Fine, PassKind::Daily, PassKind::Purge] {
        let interval = pass.interval(governor.config());
        scheduler.register(Arc::new(GovernorJob::new(governor.clone(), pass)), interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_intervals() {
        let config = GovernorConfig::default();
        assert_eq!(PassKind::Fine.interval(&config).as_secs(), 30 * 60);
        assert_eq!(PassKind::Daily.interval(&config).as_secs(), 24 * 3600);
        assert_eq!(PassKind::Purge.lease_name(), "governor.purge");
    }

    #[test]
    fn test_cron_schedules() {
        let mut config = GovernorConfig::default();
        assert_eq!(PassKind::Fine.cron_schedule(&config), "*/30 * * * *");
        assert_eq!(PassKind::Daily.cron_schedule(&config), "0 9 * * *");
        assert_eq!(PassKind::Purge.cron_schedule(&config), "30 3 * * *");

        config.purge_interval_hours = 6;
        assert_eq!(PassKind::Purge.cron_schedule(&config), "30 */6 * * *");
    }

    #[test]
    fn test_report_summary() {
        let skipped = PassReport::Skipped {
            pass: PassKind::Fine,
        };
        assert!(skipped.is_skipped());
        assert!(skipped.summary().is_none());

        let done = PassReport::Completed(PassSummary::new(PassKind::Daily, Utc::now()));
        assert_eq!(done.summary().unwrap().pass, PassKind::Daily);
    }
}
