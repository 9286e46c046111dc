//! Governor events and the sinks that receive them.
//!
//! Delivery (email, chat) belongs to an external notification service; the
//! governor only emits events. Sink failures are logged by the caller and
//! never fail a pass.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use url::Url;

use crate::model::{InstanceId, OwnerId, TokenId};

/// Something the notification subsystem may want to tell a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FleetEvent {
    TokenExpiring {
        token_id: TokenId,
        owner: Option<OwnerId>,
        expires_at: DateTime<Utc>,
        days_left: i64,
    },
    TokenExpired {
        token_id: TokenId,
        owner: Option<OwnerId>,
    },
    InstanceStopped {
        instance_id: InstanceId,
        owner: OwnerId,
        reason: String,
        scheduled_deletion_at: Option<DateTime<Utc>>,
    },
    InstancePurged {
        instance_id: InstanceId,
        owner: OwnerId,
    },
}

impl FleetEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            FleetEvent::TokenExpiring { .. } => "token_expiring",
            FleetEvent::TokenExpired { .. } => "token_expired",
            FleetEvent::InstanceStopped { .. } => "instance_stopped",
            FleetEvent::InstancePurged { .. } => "instance_purged",
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, event: &FleetEvent) -> anyhow::Result<()>;
}

/// Writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify(&self, event: &FleetEvent) -> anyhow::Result<()> {
        match event {
            FleetEvent::TokenExpiring {
                token_id,
                owner,
                days_left,
                ..
            } => info!(
                "Token {} of {} expires in {} days",
                token_id,
                owner.as_deref().unwrap_or("<unbound>"),
                days_left
            ),
            FleetEvent::TokenExpired { token_id, owner } => info!(
                "Token {} of {} expired",
                token_id,
                owner.as_deref().unwrap_or("<unbound>")
            ),
            FleetEvent::InstanceStopped {
                instance_id,
                owner,
                reason,
                ..
            } => info!("Instance {} of {} stopped: {}", instance_id, owner, reason),
            FleetEvent::InstancePurged { instance_id, owner } => {
                info!("Instance {} of {} purged", instance_id, owner)
            }
        }
        Ok(())
    }
}

/// POSTs each event as JSON to a fixed URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: Url,
}

impl WebhookNotifier {
    pub fn new(url: Url) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn notify(&self, event: &FleetEvent) -> anyhow::Result<()> {
        self.client
            .post(self.url.clone())
            .json(event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Forwards events into a channel, for embedding and tests.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<FleetEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FleetEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationSink for ChannelNotifier {
    async fn notify(&self, event: &FleetEvent) -> anyhow::Result<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| anyhow::anyhow!("event receiver dropped"))
    }
}

/// Sends every event to each inner sink; one failing sink does not stop the rest.
#[derive(Default)]
pub struct FanoutNotifier {
    sinks: Vec<Box<dyn NotificationSink>>,
}

impl FanoutNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl NotificationSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

#[async_trait]
impl NotificationSink for FanoutNotifier {
    async fn notify(&self, event: &FleetEvent) -> anyhow::Result<()> {
        let mut failures = 0;
        for sink in &self.sinks {
            if let Err(e) = sink.notify(event).await {
                warn!("Notification sink failed for {}: {}", event.kind(), e);
                failures += 1;
            }
        }
        if failures > 0 && failures == self.sinks.len() {
            anyhow::bail!("all {} sinks failed", failures);
        }
        Ok(())
    }
}
