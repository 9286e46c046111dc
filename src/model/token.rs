use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::instance::OwnerId;

/// Unique access token identifier
pub type TokenId = uuid::Uuid;

/// How a token came into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    /// Issued by an operator and handed to a tenant
    Issuance,
    /// Created through a self-service activation flow
    Activation,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Issuance => "issuance",
            TokenType::Activation => "activation",
        }
    }
}

impl FromStr for TokenType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "issuance" => Ok(TokenType::Issuance),
            "activation" => Ok(TokenType::Activation),
            other => Err(format!("unknown token type: {}", other)),
        }
    }
}

/// A time-limited grant gating instance availability.
///
/// `active` implies `activated_at <= now < expires_at`. Only the governor
/// clears `active` once the token lapses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub id: TokenId,
    /// Secret presented on activation
    pub token: String,
    pub token_type: TokenType,
    /// Bound owner, unset until activation
    pub owner: Option<OwnerId>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub active: bool,
}

impl AccessToken {
    /// Whether the token grants access at `now`
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.active && self.activated_at.is_some_and(|at| at <= now) && now < self.expires_at
    }

    /// Whether the token is past its expiry at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Whole days left until expiry, never negative
    pub fn days_left(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_days().max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token(now: DateTime<Utc>, expires_in: Duration, active: bool) -> AccessToken {
        AccessToken {
            id: TokenId::new_v4(),
            token: "secret".to_string(),
            token_type: TokenType::Issuance,
            owner: Some("alice".to_string()),
            created_at: now - Duration::days(1),
            expires_at: now + expires_in,
            activated_at: Some(now - Duration::hours(1)),
            active,
        }
    }

    #[test]
    fn test_validity() {
        let now = Utc::now();
        assert!(token(now, Duration::days(3), true).is_valid_at(now));
        assert!(!token(now, Duration::days(3), false).is_valid_at(now));
        assert!(!token(now, Duration::zero(), true).is_valid_at(now));
        assert!(token(now, Duration::zero(), true).is_expired_at(now));
    }

    #[test]
    fn test_days_left() {
        let now = Utc::now();
        assert_eq!(token(now, Duration::hours(50), true).days_left(now), 2);
        assert_eq!(token(now, Duration::hours(-5), true).days_left(now), 0);
    }
}
