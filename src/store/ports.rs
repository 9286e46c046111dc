use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::{Store, decode_error, is_unique_violation};
use crate::error::Result;
use crate::model::{InstanceId, PortAssignment, PortTriple, from_millis, to_millis};

/// Outcome of an atomic reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Reserved,
    /// Another writer holds at least one of the ports
    Conflict,
}

fn port_column(row: &SqliteRow, column: &str) -> std::result::Result<u16, sqlx::Error> {
    let value: i64 = row.try_get(column)?;
    u16::try_from(value).map_err(|e| decode_error(column, e))
}

fn assignment_from_row(row: &SqliteRow) -> std::result::Result<PortAssignment, sqlx::Error> {
    let id: String = row.try_get("instance_id")?;
    Ok(PortAssignment {
        instance_id: InstanceId::parse_str(&id).map_err(|e| decode_error("instance_id", e))?,
        ports: PortTriple::new(
            port_column(row, "game_port")?,
            port_column(row, "query_port")?,
            port_column(row, "rcon_port")?,
        ),
        allocated_at: from_millis(row.try_get("allocated_at")?),
    })
}

impl Store {
    /// Reserve `ports` for `instance_id` in one transaction.
    ///
    /// `reserved_ports.port` is the primary key, so two writers can never
    /// both commit a triple sharing a port.
    pub async fn reserve_ports(
        &self,
        instance_id: InstanceId,
        ports: PortTriple,
        at: DateTime<Utc>,
    ) -> Result<Reservation> {
        let id = instance_id.to_string();
        let mut tx = self.pool().begin().await?;

        for port in ports.ports() {
            let inserted = sqlx::query("INSERT INTO reserved_ports (port, instance_id) VALUES (?, ?)")
                .bind(i64::from(port))
                .bind(&id)
                .execute(&mut *tx)
                .await;

            match inserted {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => {
                    tx.rollback().await?;
                    return Ok(Reservation::Conflict);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let inserted = sqlx::query(
            "INSERT INTO port_assignments (instance_id, game_port, query_port, rcon_port, allocated_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(i64::from(ports.game))
        .bind(i64::from(ports.query))
        .bind(i64::from(ports.rcon))
        .bind(to_millis(at))
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                tx.rollback().await?;
                return Ok(Reservation::Conflict);
            }
            Err(e) => return Err(e.into()),
        }

        tx.commit().await?;
        Ok(Reservation::Reserved)
    }

    pub async fn is_port_reserved(&self, port: u16) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM reserved_ports WHERE port = ?")
            .bind(i64::from(port))
            .fetch_optional(self.pool())
            .await?;
        Ok(row.is_some())
    }

    pub async fn get_port_assignment(&self, instance_id: InstanceId) -> Result<Option<PortAssignment>> {
        let row = sqlx::query(
            "SELECT instance_id, game_port, query_port, rcon_port, allocated_at \
             FROM port_assignments WHERE instance_id = ?",
        )
        .bind(instance_id.to_string())
        .fetch_optional(self.pool())
        .await?;

        Ok(row.as_ref().map(assignment_from_row).transpose()?)
    }

    pub async fn list_port_assignments(&self) -> Result<Vec<PortAssignment>> {
        let rows = sqlx::query(
            "SELECT instance_id, game_port, query_port, rcon_port, allocated_at \
             FROM port_assignments ORDER BY game_port",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .iter()
            .map(assignment_from_row)
            .collect::<std::result::Result<_, _>>()?)
    }

    /// Drop the assignment and its reserved ports. Returns whether one existed.
    pub async fn release_ports(&self, instance_id: InstanceId) -> Result<bool> {
        let id = instance_id.to_string();
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM reserved_ports WHERE instance_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM port_assignments WHERE instance_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(removed.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reserve_and_release() {
        let store = Store::in_memory().await.unwrap();
        let id = InstanceId::new_v4();
        let ports = PortTriple::new(7777, 27015, 27020);

        assert_eq!(
            store.reserve_ports(id, ports, Utc::now()).await.unwrap(),
            Reservation::Reserved
        );
        assert!(store.is_port_reserved(27015).await.unwrap());

        let assignment = store.get_port_assignment(id).await.unwrap().unwrap();
        assert_eq!(assignment.ports, ports);

        assert!(store.release_ports(id).await.unwrap());
        assert!(!store.is_port_reserved(7777).await.unwrap());
        assert!(!store.release_ports(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_overlapping_reservation_conflicts() {
        let store = Store::in_memory().await.unwrap();
        let first = InstanceId::new_v4();
        let second = InstanceId::new_v4();

        store
            .reserve_ports(first, PortTriple::new(7777, 27015, 27020), Utc::now())
            .await
            .unwrap();

        // Shares only the rcon port with the first triple
        let outcome = store
            .reserve_ports(second, PortTriple::new(7778, 27016, 27020), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, Reservation::Conflict);

        // The rolled back attempt left nothing behind
        assert!(!store.is_port_reserved(7778).await.unwrap());
        assert!(store.get_port_assignment(second).await.unwrap().is_none());
    }
}
