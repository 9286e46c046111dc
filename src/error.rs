//! Error taxonomy for fleet operations.
//!
//! Every failure a caller can observe is a [`FleetError`]. The
//! [`Disposition`] of an error tells the caller whether its request was
//! rejected outright or whether the instance itself entered a fault state
//! that will show up on the next status query.

use crate::container::ContainerError;
use crate::executor::ExecutorError;
use crate::model::{InstanceId, ObservedState, Operation};

/// How an error should be presented to the user who triggered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The request was refused before anything changed
    Rejected,
    /// The instance was acted on and recorded a fault
    Faulted,
}

/// Errors surfaced by fleet components.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    /// No free port triple within the allocation budget
    #[error("No free port triple: {0}")]
    ResourceExhausted(String),

    /// No runnable server binary after provisioning
    #[error("Server binary missing: {0}")]
    BinaryMissing(String),

    /// A single mod could not be acquired; never fatal on its own
    #[error("Mod {mod_id} could not be acquired: {reason}")]
    ModAcquisitionFailed { mod_id: u64, reason: String },

    /// Launch configuration rejected before any runtime call
    #[error("Invalid launch configuration: {0}")]
    LaunchSpecInvalid(String),

    /// Runtime call failed after bounded retries
    #[error("Container runtime operation failed: {0}")]
    RuntimeOperationFailed(String),

    /// Operation not permitted from the current state
    #[error("Cannot {operation} instance {id} while {state}")]
    InvalidState {
        id: InstanceId,
        operation: Operation,
        state: ObservedState,
    },

    /// Another operation holds the instance
    #[error("Instance {id} is busy with {operation}")]
    Busy { id: InstanceId, operation: Operation },

    /// Caller does not own the instance or lacks a valid token
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Token rejected for activation or binding
    #[error("Token rejected: {0}")]
    TokenRejected(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(InstanceId),

    #[error("Token not found: {0}")]
    TokenNotFound(String),

    #[error("Backup error: {0}")]
    Backup(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    #[error("Command execution error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FleetError {
    /// Whether the caller's request was refused or the instance faulted.
    pub fn disposition(&self) -> Disposition {
        match self {
            FleetError::ResourceExhausted(_)
            | FleetError::LaunchSpecInvalid(_)
            | FleetError::InvalidState { .. }
            | FleetError::Busy { .. }
            | FleetError::AccessDenied(_)
            | FleetError::TokenRejected(_)
            | FleetError::InstanceNotFound(_)
            | FleetError::TokenNotFound(_)
            | FleetError::Config(_) => Disposition::Rejected,
            _ => Disposition::Faulted,
        }
    }

    /// Whether retrying the same call later could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FleetError::RuntimeOperationFailed(_)
                | FleetError::Container(_)
                | FleetError::Busy { .. }
        )
    }
}

/// Result type for fleet operations.
pub type Result<T> = std::result::Result<T, FleetError>;
