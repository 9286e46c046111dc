use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::instance::InstanceId;

/// Container status as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    /// No container with the recorded name exists
    Missing,
    /// Created or exited
    Stopped,
    Running,
    Restarting,
    Paused,
    Dead,
}

impl RuntimeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeStatus::Missing => "missing",
            RuntimeStatus::Stopped => "stopped",
            RuntimeStatus::Running => "running",
            RuntimeStatus::Restarting => "restarting",
            RuntimeStatus::Paused => "paused",
            RuntimeStatus::Dead => "dead",
        }
    }
}

impl FromStr for RuntimeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "missing" => Ok(RuntimeStatus::Missing),
            "stopped" => Ok(RuntimeStatus::Stopped),
            "running" => Ok(RuntimeStatus::Running),
            "restarting" => Ok(RuntimeStatus::Restarting),
            "paused" => Ok(RuntimeStatus::Paused),
            "dead" => Ok(RuntimeStatus::Dead),
            other => Err(format!("unknown runtime status: {}", other)),
        }
    }
}

/// The container bound to an instance for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub instance_id: InstanceId,
    /// Deterministic, prefixed container name
    pub container_name: String,
    /// Runtime-assigned id, set once the container exists
    pub container_id: Option<String>,
    pub runtime_status: RuntimeStatus,
    /// Human-readable outcome of the last runtime operation
    pub last_outcome: Option<String>,
    /// Serialized launch spec the current container was created with
    pub launch_fingerprint: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ContainerRecord {
    pub fn new(instance_id: InstanceId, container_name: String) -> Self {
        Self {
            instance_id,
            container_name,
            container_id: None,
            runtime_status: RuntimeStatus::Missing,
            last_outcome: None,
            launch_fingerprint: None,
            updated_at: Utc::now(),
        }
    }
}
