//! Core data model shared by every component.
//!
//! - [`instance`]: instances, their declared spec and lifecycle states
//! - [`ports`]: port triples and persisted port assignments
//! - [`token`]: time-limited access tokens
//! - [`record`]: per-instance container records

pub mod instance;
pub mod ports;
pub mod record;
pub mod token;

pub use instance::{
    DesiredState, Instance, InstanceId, InstanceSpec, ObservedState, Operation, OwnerId,
};
pub use ports::{PortAssignment, PortTriple};
pub use record::{ContainerRecord, RuntimeStatus};
pub use token::{AccessToken, TokenId, TokenType};

use chrono::{DateTime, Utc};

/// Convert a timestamp to the unix-millisecond form used by the store.
pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Convert stored unix milliseconds back into a UTC timestamp.
///
/// Out-of-range values clamp to the unix epoch rather than failing a read.
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_millis_round_trip() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap();
        assert_eq!(from_millis(to_millis(ts)), ts);
    }
}
