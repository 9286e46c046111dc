use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::instance::InstanceId;

/// The game, query and admin-console ports reserved together for one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortTriple {
    pub game: u16,
    pub query: u16,
    pub rcon: u16,
}

impl PortTriple {
    pub const fn new(game: u16, query: u16, rcon: u16) -> Self {
        Self { game, query, rcon }
    }

    /// The three ports as an array, in game/query/rcon order
    pub fn ports(&self) -> [u16; 3] {
        [self.game, self.query, self.rcon]
    }

    /// Whether no two of the three ports coincide
    pub fn is_pairwise_distinct(&self) -> bool {
        self.game != self.query && self.game != self.rcon && self.query != self.rcon
    }

    /// Whether this triple shares any port with `other`
    pub fn overlaps(&self, other: &PortTriple) -> bool {
        self.ports().iter().any(|p| other.ports().contains(p))
    }

    /// The candidate `index` strides away from this base, or `None` on overflow.
    pub fn offset(&self, index: u32, stride: u16) -> Option<PortTriple> {
        let delta = u16::try_from(index).ok()?.checked_mul(stride)?;
        Some(PortTriple {
            game: self.game.checked_add(delta)?,
            query: self.query.checked_add(delta)?,
            rcon: self.rcon.checked_add(delta)?,
        })
    }
}

impl fmt::Display for PortTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "game={} query={} rcon={}",
            self.game, self.query, self.rcon
        )
    }
}

/// A persisted reservation of a port triple by one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAssignment {
    pub instance_id: InstanceId,
    pub ports: PortTriple,
    pub allocated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset() {
        let base = PortTriple::new(7777, 27015, 27020);
        assert_eq!(base.offset(0, 1), Some(base));
        assert_eq!(base.offset(2, 1), Some(PortTriple::new(7779, 27017, 27022)));
        assert_eq!(base.offset(1, 10), Some(PortTriple::new(7787, 27025, 27030)));
    }

    #[test]
    fn test_offset_overflow() {
        let base = PortTriple::new(65530, 27015, 27020);
        assert_eq!(base.offset(10, 1), None);
    }

    #[test]
    fn test_overlap_and_distinct() {
        let a = PortTriple::new(7777, 27015, 27020);
        let b = PortTriple::new(7782, 27020, 27025);
        assert!(a.overlaps(&b));
        assert!(a.is_pairwise_distinct());
        assert!(!PortTriple::new(1, 1, 2).is_pairwise_distinct());
    }
}
