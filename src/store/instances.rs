use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::{Store, decode_error};
use crate::error::Result;
use crate::model::{
    DesiredState, Instance, InstanceId, ObservedState, Operation, from_millis, to_millis,
};

const INSTANCE_COLUMNS: &str = "id, owner, spec, desired, observed, busy, last_error, warnings, \
     created_at, updated_at, scheduled_deletion_at";

fn instance_from_row(row: &SqliteRow) -> std::result::Result<Instance, sqlx::Error> {
    let id: String = row.try_get("id")?;
    let spec: String = row.try_get("spec")?;
    let desired: String = row.try_get("desired")?;
    let observed: String = row.try_get("observed")?;
    let busy: Option<String> = row.try_get("busy")?;
    let warnings: String = row.try_get("warnings")?;
    let scheduled: Option<i64> = row.try_get("scheduled_deletion_at")?;

    Ok(Instance {
        id: InstanceId::parse_str(&id).map_err(|e| decode_error("id", e))?,
        owner: row.try_get("owner")?,
        spec: serde_json::from_str(&spec).map_err(|e| decode_error("spec", e))?,
        desired: desired
            .parse::<DesiredState>()
            .map_err(|e| decode_error("desired", e))?,
        observed: observed
            .parse::<ObservedState>()
            .map_err(|e| decode_error("observed", e))?,
        busy: busy
            .map(|b| b.parse::<Operation>())
            .transpose()
            .map_err(|e| decode_error("busy", e))?,
        last_error: row.try_get("last_error")?,
        warnings: serde_json::from_str(&warnings).map_err(|e| decode_error("warnings", e))?,
        created_at: from_millis(row.try_get("created_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
        scheduled_deletion_at: scheduled.map(from_millis),
    })
}

impl Store {
    pub async fn insert_instance(&self, instance: &Instance) -> Result<()> {
        sqlx::query(
            "INSERT INTO instances (id, owner, spec, desired, observed, busy, last_error, warnings, \
             created_at, updated_at, scheduled_deletion_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(instance.id.to_string())
        .bind(&instance.owner)
        .bind(serde_json::to_string(&instance.spec)?)
        .bind(instance.desired.as_str())
        .bind(instance.observed.as_str())
        .bind(instance.busy.map(|b| b.as_str()))
        .bind(&instance.last_error)
        .bind(serde_json::to_string(&instance.warnings)?)
        .bind(to_millis(instance.created_at))
        .bind(to_millis(instance.updated_at))
        .bind(instance.scheduled_deletion_at.map(to_millis))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Write every mutable column of an existing instance.
    pub async fn update_instance(&self, instance: &Instance) -> Result<()> {
        sqlx::query(
            "UPDATE instances SET spec = ?, desired = ?, observed = ?, busy = ?, last_error = ?, \
             warnings = ?, updated_at = ?, scheduled_deletion_at = ? WHERE id = ?",
        )
        .bind(serde_json::to_string(&instance.spec)?)
        .bind(instance.desired.as_str())
        .bind(instance.observed.as_str())
        .bind(instance.busy.map(|b| b.as_str()))
        .bind(&instance.last_error)
        .bind(serde_json::to_string(&instance.warnings)?)
        .bind(to_millis(instance.updated_at))
        .bind(instance.scheduled_deletion_at.map(to_millis))
        .bind(instance.id.to_string())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_instance(&self, id: InstanceId) -> Result<Option<Instance>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM instances WHERE id = ?",
            INSTANCE_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await?;

        Ok(row.as_ref().map(instance_from_row).transpose()?)
    }

    pub async fn list_instances(&self) -> Result<Vec<Instance>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM instances ORDER BY created_at",
            INSTANCE_COLUMNS
        ))
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .iter()
            .map(instance_from_row)
            .collect::<std::result::Result<_, _>>()?)
    }

    pub async fn list_instances_for_owner(&self, owner: &str) -> Result<Vec<Instance>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM instances WHERE owner = ? ORDER BY created_at",
            INSTANCE_COLUMNS
        ))
        .bind(owner)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .iter()
            .map(instance_from_row)
            .collect::<std::result::Result<_, _>>()?)
    }

    /// Instances whose grace period has lapsed by `now`.
    pub async fn list_instances_due_for_purge(&self, now: DateTime<Utc>) -> Result<Vec<Instance>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM instances \
             WHERE scheduled_deletion_at IS NOT NULL AND scheduled_deletion_at <= ? \
             ORDER BY scheduled_deletion_at",
            INSTANCE_COLUMNS
        ))
        .bind(to_millis(now))
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .iter()
            .map(instance_from_row)
            .collect::<std::result::Result<_, _>>()?)
    }

    pub async fn set_busy(&self, id: InstanceId, busy: Option<Operation>) -> Result<()> {
        sqlx::query("UPDATE instances SET busy = ?, updated_at = ? WHERE id = ?")
            .bind(busy.map(|b| b.as_str()))
            .bind(to_millis(Utc::now()))
            .bind(id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn set_scheduled_deletion(
        &self,
        id: InstanceId,
        at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query("UPDATE instances SET scheduled_deletion_at = ? WHERE id = ?")
            .bind(at.map(to_millis))
            .bind(id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Clear busy markers left behind by a previous process. Returns how many.
    pub async fn clear_busy_markers(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE instances SET busy = NULL WHERE busy IS NOT NULL")
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    /// Remove an instance together with its container record and token bindings.
    pub async fn delete_instance(&self, id: InstanceId) -> Result<()> {
        let id = id.to_string();
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM instance_tokens WHERE instance_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM container_records WHERE instance_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM instances WHERE id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
