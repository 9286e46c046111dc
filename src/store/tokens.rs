use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::{Store, decode_error};
use crate::error::Result;
use crate::model::{AccessToken, InstanceId, TokenId, TokenType, from_millis, to_millis};

const TOKEN_COLUMNS: &str =
    "id, token, token_type, owner, created_at, expires_at, activated_at, active";

fn token_from_row(row: &SqliteRow) -> std::result::Result<AccessToken, sqlx::Error> {
    let id: String = row.try_get("id")?;
    let token_type: String = row.try_get("token_type")?;
    let activated_at: Option<i64> = row.try_get("activated_at")?;
    Ok(AccessToken {
        id: TokenId::parse_str(&id).map_err(|e| decode_error("id", e))?,
        token: row.try_get("token")?,
        token_type: token_type
            .parse::<TokenType>()
            .map_err(|e| decode_error("token_type", e))?,
        owner: row.try_get("owner")?,
        created_at: from_millis(row.try_get("created_at")?),
        expires_at: from_millis(row.try_get("expires_at")?),
        activated_at: activated_at.map(from_millis),
        active: row.try_get("active")?,
    })
}

fn tokens_from_rows(rows: &[SqliteRow]) -> std::result::Result<Vec<AccessToken>, sqlx::Error> {
    rows.iter().map(token_from_row).collect()
}

impl Store {
    pub async fn insert_token(&self, token: &AccessToken) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO access_tokens ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            TOKEN_COLUMNS
        ))
        .bind(token.id.to_string())
        .bind(&token.token)
        .bind(token.token_type.as_str())
        .bind(&token.owner)
        .bind(to_millis(token.created_at))
        .bind(to_millis(token.expires_at))
        .bind(token.activated_at.map(to_millis))
        .bind(token.active)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn update_token(&self, token: &AccessToken) -> Result<()> {
        sqlx::query(
            "UPDATE access_tokens SET owner = ?, expires_at = ?, activated_at = ?, active = ? \
             WHERE id = ?",
        )
        .bind(&token.owner)
        .bind(to_millis(token.expires_at))
        .bind(token.activated_at.map(to_millis))
        .bind(token.active)
        .bind(token.id.to_string())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_token(&self, id: TokenId) -> Result<Option<AccessToken>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM access_tokens WHERE id = ?",
            TOKEN_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await?;
        Ok(row.as_ref().map(token_from_row).transpose()?)
    }

    pub async fn get_token_by_secret(&self, secret: &str) -> Result<Option<AccessToken>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM access_tokens WHERE token = ?",
            TOKEN_COLUMNS
        ))
        .bind(secret)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.as_ref().map(token_from_row).transpose()?)
    }

    pub async fn list_tokens(&self) -> Result<Vec<AccessToken>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM access_tokens ORDER BY created_at",
            TOKEN_COLUMNS
        ))
        .fetch_all(self.pool())
        .await?;
        Ok(tokens_from_rows(&rows)?)
    }

    /// Clear `active` on every token expired at `now` and return those tokens.
    ///
    /// Running it twice for the same `now` returns nothing the second time.
    pub async fn deactivate_expired_tokens(&self, now: DateTime<Utc>) -> Result<Vec<AccessToken>> {
        let mut tx = self.pool().begin().await?;
        let rows = sqlx::query(&format!(
            "SELECT {} FROM access_tokens WHERE active = 1 AND expires_at <= ?",
            TOKEN_COLUMNS
        ))
        .bind(to_millis(now))
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query("UPDATE access_tokens SET active = 0 WHERE active = 1 AND expires_at <= ?")
            .bind(to_millis(now))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let mut expired = tokens_from_rows(&rows)?;
        for token in &mut expired {
            token.active = false;
        }
        Ok(expired)
    }

    /// Active tokens with `now < expires_at <= until`.
    pub async fn list_tokens_expiring_between(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<AccessToken>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM access_tokens WHERE active = 1 AND expires_at > ? AND expires_at <= ? \
             ORDER BY expires_at",
            TOKEN_COLUMNS
        ))
        .bind(to_millis(now))
        .bind(to_millis(until))
        .fetch_all(self.pool())
        .await?;
        Ok(tokens_from_rows(&rows)?)
    }

    pub async fn bind_token(&self, instance_id: InstanceId, token_id: TokenId) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO instance_tokens (instance_id, token_id) VALUES (?, ?)")
            .bind(instance_id.to_string())
            .bind(token_id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn tokens_for_instance(&self, instance_id: InstanceId) -> Result<Vec<AccessToken>> {
        let rows = sqlx::query(
            "SELECT t.id, t.token, t.token_type, t.owner, t.created_at, t.expires_at, \
             t.activated_at, t.active FROM access_tokens t \
             JOIN instance_tokens b ON b.token_id = t.id \
             WHERE b.instance_id = ? ORDER BY t.expires_at",
        )
        .bind(instance_id.to_string())
        .fetch_all(self.pool())
        .await?;
        Ok(tokens_from_rows(&rows)?)
    }

    /// Instances bound to `token_id`.
    pub async fn instances_for_token(&self, token_id: TokenId) -> Result<Vec<InstanceId>> {
        let rows = sqlx::query("SELECT instance_id FROM instance_tokens WHERE token_id = ?")
            .bind(token_id.to_string())
            .fetch_all(self.pool())
            .await?;

        let mut ids = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.try_get("instance_id")?;
            ids.push(InstanceId::parse_str(&id).map_err(|e| decode_error("instance_id", e))?);
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token(secret: &str, now: DateTime<Utc>, expires_in: Duration) -> AccessToken {
        AccessToken {
            id: TokenId::new_v4(),
            token: secret.to_string(),
            token_type: TokenType::Issuance,
            owner: Some("alice".to_string()),
            created_at: now - Duration::days(10),
            expires_at: now + expires_in,
            activated_at: Some(now - Duration::days(9)),
            active: true,
        }
    }

    #[tokio::test]
    async fn test_deactivate_expired_is_idempotent() {
        let store = Store::in_memory().await.unwrap();
        let now = Utc::now();
        let expired = token("expired", now, Duration::hours(-1));
        let valid = token("valid", now, Duration::days(3));
        store.insert_token(&expired).await.unwrap();
        store.insert_token(&valid).await.unwrap();

        let first = store.deactivate_expired_tokens(now).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, expired.id);
        assert!(!first[0].active);

        assert!(store.deactivate_expired_tokens(now).await.unwrap().is_empty());
        assert!(store.get_token(valid.id).await.unwrap().unwrap().active);
    }

    #[tokio::test]
    async fn test_bindings() {
        let store = Store::in_memory().await.unwrap();
        let now = Utc::now();
        let t = token("bound", now, Duration::days(3));
        store.insert_token(&t).await.unwrap();

        let instance = InstanceId::new_v4();
        store.bind_token(instance, t.id).await.unwrap();
        store.bind_token(instance, t.id).await.unwrap();

        let bound = store.tokens_for_instance(instance).await.unwrap();
        assert_eq!(bound.len(), 1);
        assert_eq!(store.instances_for_token(t.id).await.unwrap(), vec![instance]);
    }

    #[tokio::test]
    async fn test_expiring_window() {
        let store = Store::in_memory().await.unwrap();
        let now = Utc::now();
        store
            .insert_token(&token("soon", now, Duration::days(2)))
            .await
            .unwrap();
        store
            .insert_token(&token("later", now, Duration::days(20)))
            .await
            .unwrap();

        let expiring = store
            .list_tokens_expiring_between(now, now + Duration::days(5))
            .await
            .unwrap();
        assert_eq!(expiring.len(), 1);
        assert_eq!(expiring[0].token, "soon");
    }
}
