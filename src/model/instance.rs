use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ports::PortTriple;

/// Unique instance identifier
pub type InstanceId = uuid::Uuid;

/// Reference to an owner account managed outside this system
pub type OwnerId = String;

/// Declared configuration of a game-server instance.
///
/// Everything the launch composer and provisioning pipeline need lives here;
/// nothing in it is host- or runtime-specific.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    /// Session name shown in the server browser
    pub session_name: String,
    /// World/map selector (with or without the required suffix)
    pub map: String,
    /// Player capacity ceiling
    pub max_players: u32,
    /// Optional cluster identifier for cross-server transfers
    #[serde(default)]
    pub cluster_id: Option<String>,
    /// Whether the admin console (RCON) is enabled
    #[serde(default)]
    pub rcon_enabled: bool,
    /// Admin password, required when RCON is enabled
    #[serde(default)]
    pub admin_password: Option<String>,
    /// Password players need to join
    #[serde(default)]
    pub server_password: Option<String>,
    /// Anti-cheat toggle
    #[serde(default)]
    pub anti_cheat: bool,
    /// Prefer the foreign binary under the compatibility shim
    #[serde(default)]
    pub force_compat_layer: bool,
    /// Active mod identifiers, in load order
    #[serde(default)]
    pub mods: Vec<u64>,
    /// Passive mod identifiers
    #[serde(default)]
    pub passive_mods: Vec<u64>,
    /// Extra server arguments, appended verbatim and not validated
    #[serde(default)]
    pub custom_args: Vec<String>,
    /// Container image override
    #[serde(default)]
    pub image: Option<String>,
    /// Preferred base for port allocation
    #[serde(default)]
    pub preferred_ports: Option<PortTriple>,
}

impl InstanceSpec {
    /// Create a spec with the required fields and everything else defaulted.
    pub fn new(session_name: impl Into<String>, map: impl Into<String>, max_players: u32) -> Self {
        Self {
            session_name: session_name.into(),
            map: map.into(),
            max_players,
            cluster_id: None,
            rcon_enabled: false,
            admin_password: None,
            server_password: None,
            anti_cheat: false,
            force_compat_layer: false,
            mods: Vec::new(),
            passive_mods: Vec::new(),
            custom_args: Vec::new(),
            image: None,
            preferred_ports: None,
        }
    }

    /// Every mod the instance needs on disk, active first, without duplicates.
    pub fn all_mods(&self) -> Vec<u64> {
        let mut all = Vec::with_capacity(self.mods.len() + self.passive_mods.len());
        for id in self.mods.iter().chain(self.passive_mods.iter()) {
            if !all.contains(id) {
                all.push(*id);
            }
        }
        all
    }
}

/// What the owner wants the instance to be doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    Running,
    Stopped,
    Absent,
}

/// What the instance is actually doing, as last reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservedState {
    Absent,
    Creating,
    Running,
    Stopping,
    Stopped,
    Updating,
    Failed,
}

impl ObservedState {
    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// Any state may fall into `Failed`. `Updating -> Stopped` covers an update
    /// that failed after the old container was stopped.
    pub fn can_transition_to(self, next: ObservedState) -> bool {
        use ObservedState::*;

        if next == Failed {
            return true;
        }

        matches!(
            (self, next),
            (Absent, Creating)
                | (Creating, Stopped)
                | (Stopped, Running)
                | (Failed, Running)
                | (Running, Stopping)
                | (Updating, Stopping)
                | (Stopping, Stopped)
                | (Failed, Stopped)
                | (Running, Updating)
                | (Stopped, Updating)
                | (Updating, Running)
                | (Updating, Stopped)
                | (Stopped, Absent)
                | (Failed, Absent)
        )
    }

    /// States left behind only by an interrupted operation
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ObservedState::Creating | ObservedState::Stopping | ObservedState::Updating
        )
    }

    /// States in which a container may be consuming resources
    pub fn is_operable(self) -> bool {
        matches!(
            self,
            ObservedState::Running | ObservedState::Updating | ObservedState::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ObservedState::Absent => "absent",
            ObservedState::Creating => "creating",
            ObservedState::Running => "running",
            ObservedState::Stopping => "stopping",
            ObservedState::Stopped => "stopped",
            ObservedState::Updating => "updating",
            ObservedState::Failed => "failed",
        }
    }
}

impl fmt::Display for ObservedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObservedState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "absent" => Ok(ObservedState::Absent),
            "creating" => Ok(ObservedState::Creating),
            "running" => Ok(ObservedState::Running),
            "stopping" => Ok(ObservedState::Stopping),
            "stopped" => Ok(ObservedState::Stopped),
            "updating" => Ok(ObservedState::Updating),
            "failed" => Ok(ObservedState::Failed),
            other => Err(format!("unknown observed state: {}", other)),
        }
    }
}

impl DesiredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DesiredState::Running => "running",
            DesiredState::Stopped => "stopped",
            DesiredState::Absent => "absent",
        }
    }
}

impl FromStr for DesiredState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(DesiredState::Running),
            "stopped" => Ok(DesiredState::Stopped),
            "absent" => Ok(DesiredState::Absent),
            other => Err(format!("unknown desired state: {}", other)),
        }
    }
}

/// Lifecycle operations, used for busy markers and error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Start,
    Stop,
    Update,
    Delete,
    Restore,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Restore => "restore",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Operation::Create),
            "start" => Ok(Operation::Start),
            "stop" => Ok(Operation::Stop),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            "restore" => Ok(Operation::Restore),
            other => Err(format!("unknown operation: {}", other)),
        }
    }
}

/// A tenant-owned game-server deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub owner: OwnerId,
    pub spec: InstanceSpec,
    pub desired: DesiredState,
    pub observed: ObservedState,
    /// Operation currently holding the instance, if any
    pub busy: Option<Operation>,
    /// Last fault recorded against the instance
    pub last_error: Option<String>,
    /// Non-fatal problems from the last start/update (e.g. skipped mods)
    pub warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the governor will purge an expired, stopped instance
    pub scheduled_deletion_at: Option<DateTime<Utc>>,
}

impl Instance {
    /// Create a new, not yet materialized instance.
    pub fn new(owner: impl Into<OwnerId>, spec: InstanceSpec) -> Self {
        let now = Utc::now();
        Self {
            id: InstanceId::new_v4(),
            owner: owner.into(),
            spec,
            desired: DesiredState::Stopped,
            observed: ObservedState::Absent,
            busy: None,
            last_error: None,
            warnings: Vec::new(),
            created_at: now,
            updated_at: now,
            scheduled_deletion_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        use ObservedState::*;
        let path = [Absent, Creating, Stopped, Running, Stopping, Stopped, Absent];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be allowed",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_update_transitions() {
        use ObservedState::*;
        assert!(Running.can_transition_to(Updating));
        assert!(Updating.can_transition_to(Running));
        assert!(Updating.can_transition_to(Stopped));
        assert!(Updating.can_transition_to(Failed));
    }

    #[test]
    fn test_rejected_transitions() {
        use ObservedState::*;
        assert!(!Absent.can_transition_to(Running));
        assert!(!Running.can_transition_to(Absent));
        assert!(!Creating.can_transition_to(Running));
        assert!(!Stopping.can_transition_to(Running));
    }

    #[test]
    fn test_any_state_can_fail() {
        use ObservedState::*;
        for state in [Absent, Creating, Running, Stopping, Stopped, Updating, Failed] {
            assert!(state.can_transition_to(Failed));
        }
    }

    #[test]
    fn test_state_string_round_trip() {
        use ObservedState::*;
        for state in [Absent, Creating, Running, Stopping, Stopped, Updating, Failed] {
            assert_eq!(state.as_str().parse::<ObservedState>().unwrap(), state);
        }
        assert!("paused".parse::<ObservedState>().is_err());
    }

    #[test]
    fn test_all_mods_deduplicates() {
        let mut spec = InstanceSpec::new("Test", "TheIsland", 10);
        spec.mods = vec![100, 200];
        spec.passive_mods = vec![200, 300];
        assert_eq!(spec.all_mods(), vec![100, 200, 300]);
    }
}
