//! Access-token issuance, activation and instance binding.
//!
//! Tokens gate instance availability: a user-triggered start needs at least
//! one valid token bound to the instance. Only the expiry governor clears
//! `active` once a token lapses.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rand::distr::Alphanumeric;
use tracing::info;

use crate::error::{FleetError, Result};
use crate::model::{AccessToken, Instance, InstanceId, OwnerId, TokenId, TokenType};
use crate::store::Store;

/// Characters in a generated token secret
pub const TOKEN_LENGTH: usize = 43;

fn generate_secret() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

#[derive(Debug, Clone)]
pub struct TokenService {
    store: Store,
    default_expiry_days: i64,
}

impl TokenService {
    pub fn new(store: Store, default_expiry_days: i64) -> Self {
        Self {
            store,
            default_expiry_days,
        }
    }

    /// Create an inactive token expiring `expires_in_days` from now
    /// (the configured default when `None`).
    pub async fn issue(
        &self,
        token_type: TokenType,
        expires_in_days: Option<i64>,
    ) -> Result<AccessToken> {
        let days = expires_in_days.unwrap_or(self.default_expiry_days);
        if days <= 0 {
            return Err(FleetError::TokenRejected(format!(
                "expiry must be at least one day, got {}",
                days
            )));
        }

        let now = Utc::now();
        let token = AccessToken {
            id: TokenId::new_v4(),
            token: generate_secret(),
            token_type,
            owner: None,
            created_at: now,
            expires_at: now + Duration::days(days),
            activated_at: None,
            active: false,
        };
        self.store.insert_token(&token).await?;
        info!(
            "Issued {} token {} expiring {}",
            token_type.as_str(),
            token.id,
            token.expires_at
        );
        Ok(token)
    }

    /// Activate the token with secret `secret` for `owner`.
    pub async fn activate(&self, secret: &str, owner: &str) -> Result<AccessToken> {
        self.activate_at(secret, owner, Utc::now()).await
    }

    pub async fn activate_at(
        &self,
        secret: &str,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessToken> {
        let mut token = self.find(secret).await?;
        if token.active {
            return Err(FleetError::TokenRejected("token already activated".into()));
        }
        if token.is_expired_at(now) {
            return Err(FleetError::TokenRejected("token expired".into()));
        }

        token.owner = Some(owner.to_string());
        token.activated_at = Some(now);
        token.active = true;
        self.store.update_token(&token).await?;
        info!("Token {} activated by {}", token.id, owner);
        Ok(token)
    }

    /// Bind an active token of the instance owner to the instance and cancel
    /// any scheduled deletion.
    pub async fn bind(&self, instance_id: InstanceId, secret: &str) -> Result<AccessToken> {
        self.bind_at(instance_id, secret, Utc::now()).await
    }

    pub async fn bind_at(
        &self,
        instance_id: InstanceId,
        secret: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessToken> {
        let instance = self
            .store
            .get_instance(instance_id)
            .await?
            .ok_or(FleetError::InstanceNotFound(instance_id))?;
        let token = self.find(secret).await?;

        if token.owner.as_deref() != Some(instance.owner.as_str()) {
            return Err(FleetError::TokenRejected(format!(
                "token {} does not belong to {}",
                token.id, instance.owner
            )));
        }
        if !token.is_valid_at(now) {
            return Err(FleetError::TokenRejected(format!(
                "token {} is not active",
                token.id
            )));
        }

        self.store.bind_token(instance_id, token.id).await?;
        if instance.scheduled_deletion_at.is_some() {
            self.store.set_scheduled_deletion(instance_id, None).await?;
            info!("Cancelled scheduled deletion of instance {}", instance_id);
        }
        info!("Bound token {} to instance {}", token.id, instance_id);
        Ok(token)
    }

    /// Refuse unless `caller` owns `instance` and a bound token is valid at `now`.
    pub async fn authorize(
        &self,
        caller: &str,
        instance: &Instance,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if instance.owner != caller {
            return Err(FleetError::AccessDenied(format!(
                "{} does not own instance {}",
                caller, instance.id
            )));
        }
        let tokens = self.store.tokens_for_instance(instance.id).await?;
        if !tokens.iter().any(|t| t.is_valid_at(now)) {
            return Err(FleetError::AccessDenied(format!(
                "instance {} has no valid access token",
                instance.id
            )));
        }
        Ok(())
    }

    pub async fn list_for_owner(&self, owner: &OwnerId) -> Result<Vec<AccessToken>> {
        Ok(self
            .store
            .list_tokens()
            .await?
            .into_iter()
            .filter(|t| t.owner.as_ref() == Some(owner))
            .collect())
    }

    async fn find(&self, secret: &str) -> Result<AccessToken> {
        self.store
            .get_token_by_secret(secret)
            .await?
            .ok_or_else(|| FleetError::TokenNotFound(mask(secret)))
    }
}

/// Enough of a secret to recognise it in a message without leaking it.
fn mask(secret: &str) -> String {
    let prefix: String = secret.chars().take(4).collect();
    format!("{}…", prefix)
}
