use chrono::{Duration, Utc};

use super::Store;
use crate::error::Result;
use crate::model::to_millis;

impl Store {
    /// Take the named lease for `ttl` unless another holder has an unexpired one.
    ///
    /// Leases use wall-clock time so that separate processes agree on expiry.
    pub async fn try_acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO job_leases (name, holder, expires_at) VALUES (?, ?, ?) \
             ON CONFLICT(name) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at \
             WHERE job_leases.expires_at <= ?",
        )
        .bind(name)
        .bind(holder)
        .bind(to_millis(now + ttl))
        .bind(to_millis(now))
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Give up a lease; only the current holder can release it.
    pub async fn release_lease(&self, name: &str, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM job_leases WHERE name = ? AND holder = ?")
            .bind(name)
            .bind(holder)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lease_excludes_second_holder() {
        let store = Store::in_memory().await.unwrap();
        let ttl = Duration::minutes(5);

        assert!(store.try_acquire_lease("fine", "a", ttl).await.unwrap());
        assert!(!store.try_acquire_lease("fine", "b", ttl).await.unwrap());

        // Releasing as a non-holder changes nothing
        store.release_lease("fine", "b").await.unwrap();
        assert!(!store.try_acquire_lease("fine", "b", ttl).await.unwrap());

        store.release_lease("fine", "a").await.unwrap();
        assert!(store.try_acquire_lease("fine", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let store = Store::in_memory().await.unwrap();
        assert!(
            store
                .try_acquire_lease("daily", "crashed", Duration::milliseconds(-1))
                .await
                .unwrap()
        );
        assert!(
            store
                .try_acquire_lease("daily", "fresh", Duration::minutes(5))
                .await
                .unwrap()
        );
    }
}
