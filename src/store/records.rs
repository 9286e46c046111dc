use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::{Store, decode_error};
use crate::error::Result;
use crate::model::{ContainerRecord, InstanceId, RuntimeStatus, from_millis, to_millis};

fn record_from_row(row: &SqliteRow) -> std::result::Result<ContainerRecord, sqlx::Error> {
    let id: String = row.try_get("instance_id")?;
    let status: String = row.try_get("runtime_status")?;
    Ok(ContainerRecord {
        instance_id: InstanceId::parse_str(&id).map_err(|e| decode_error("instance_id", e))?,
        container_name: row.try_get("container_name")?,
        container_id: row.try_get("container_id")?,
        runtime_status: status
            .parse::<RuntimeStatus>()
            .map_err(|e| decode_error("runtime_status", e))?,
        last_outcome: row.try_get("last_outcome")?,
        launch_fingerprint: row.try_get("launch_fingerprint")?,
        updated_at: from_millis(row.try_get("updated_at")?),
    })
}

impl Store {
    /// Insert or replace the container record of an instance.
    pub async fn upsert_record(&self, record: &ContainerRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO container_records \
             (instance_id, container_name, container_id, runtime_status, last_outcome, launch_fingerprint, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(instance_id) DO UPDATE SET \
             container_name = excluded.container_name, \
             container_id = excluded.container_id, \
             runtime_status = excluded.runtime_status, \
             last_outcome = excluded.last_outcome, \
             launch_fingerprint = excluded.launch_fingerprint, \
             updated_at = excluded.updated_at",
        )
        .bind(record.instance_id.to_string())
        .bind(&record.container_name)
        .bind(&record.container_id)
        .bind(record.runtime_status.as_str())
        .bind(&record.last_outcome)
        .bind(&record.launch_fingerprint)
        .bind(to_millis(Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_record(&self, instance_id: InstanceId) -> Result<Option<ContainerRecord>> {
        let row = sqlx::query(
            "SELECT instance_id, container_name, container_id, runtime_status, last_outcome, \
             launch_fingerprint, updated_at FROM container_records WHERE instance_id = ?",
        )
        .bind(instance_id.to_string())
        .fetch_optional(self.pool())
        .await?;

        Ok(row.as_ref().map(record_from_row).transpose()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::is_unique_violation;
    use crate::error::FleetError;

    #[tokio::test]
    async fn test_record_upsert() {
        let store = Store::in_memory().await.unwrap();
        let id = InstanceId::new_v4();
        let mut record = ContainerRecord::new(id, format!("gamefleet-{}", id.simple()));
        store.upsert_record(&record).await.unwrap();

        record.container_id = Some("abc123".to_string());
        record.runtime_status = RuntimeStatus::Running;
        record.last_outcome = Some("started".to_string());
        store.upsert_record(&record).await.unwrap();

        let loaded = store.get_record(id).await.unwrap().unwrap();
        assert_eq!(loaded.container_id.as_deref(), Some("abc123"));
        assert_eq!(loaded.runtime_status, RuntimeStatus::Running);
    }

    #[tokio::test]
    async fn test_container_names_are_unique() {
        let store = Store::in_memory().await.unwrap();
        let first = ContainerRecord::new(InstanceId::new_v4(), "gamefleet-dup".to_string());
        let second = ContainerRecord::new(InstanceId::new_v4(), "gamefleet-dup".to_string());
        store.upsert_record(&first).await.unwrap();

        match store.upsert_record(&second).await {
            Err(FleetError::Store(e)) => assert!(is_unique_violation(&e)),
            other => panic!("expected unique violation, got {:?}", other),
        }
    }
}
