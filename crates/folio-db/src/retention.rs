//! Retention repository implementation.
//!
//! Each purge runs in one transaction: delete expired rows, then write
//! exactly one purge-proof row. Zero expired rows commits nothing — no
//! deletion and no proof, so repeated sweeps in the same window are
//! idempotent no-ops.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use folio_core::{new_v7, Error, PurgeProof, RetentionPolicy, RetentionRepository, Result};

/// PostgreSQL implementation of [`RetentionRepository`].
#[derive(Clone)]
pub struct PgRetentionRepository {
    pool: Pool<Postgres>,
}

impl PgRetentionRepository {
    /// Create a new retention repository.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Delete statement for one whitelisted telemetry table. Only rows
    /// in a terminal state are eligible; live rows always survive a
    /// purge regardless of age.
    fn delete_statement(table_name: &str) -> Option<&'static str> {
        match table_name {
            "ingest_batch_metric" => Some(
                "DELETE FROM ingest_batch_metric
                 WHERE started_at < $1 AND status IN ('completed', 'failed')",
            ),
            "ingest_audit" => Some("DELETE FROM ingest_audit WHERE created_at < $1"),
            "dead_letter" => Some(
                "DELETE FROM dead_letter
                 WHERE updated_at < $1 AND status IN ('resolved', 'abandoned')",
            ),
            _ => None,
        }
    }
}

#[async_trait]
impl RetentionRepository for PgRetentionRepository {
    async fn policies(&self) -> Result<Vec<RetentionPolicy>> {
        let rows = sqlx::query(
            "SELECT table_name, days_to_keep FROM retention_policy ORDER BY table_name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| RetentionPolicy {
                table_name: row.get("table_name"),
                days_to_keep: row.get("days_to_keep"),
            })
            .collect())
    }

    async fn set_policy(&self, table_name: &str, days_to_keep: i32) -> Result<()> {
        if Self::delete_statement(table_name).is_none() {
            return Err(Error::InvalidInput(format!(
                "{table_name} is not a managed telemetry table"
            )));
        }
        if days_to_keep < 1 {
            return Err(Error::InvalidInput(
                "days_to_keep must be at least 1".to_string(),
            ));
        }

        sqlx::query(
            "INSERT INTO retention_policy (table_name, days_to_keep, updated_at)
             VALUES ($1, $2, NOW())
             ON CONFLICT (table_name) DO UPDATE SET days_to_keep = $2, updated_at = NOW()",
        )
        .bind(table_name)
        .bind(days_to_keep)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn purge(&self, table_name: &str, operator: &str) -> Result<Option<PurgeProof>> {
        let delete_sql = Self::delete_statement(table_name).ok_or_else(|| {
            Error::InvalidInput(format!("{table_name} is not a managed telemetry table"))
        })?;

        let days_to_keep: Option<i32> =
            sqlx::query_scalar("SELECT days_to_keep FROM retention_policy WHERE table_name = $1")
                .bind(table_name)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::Database)?;

        let days_to_keep = days_to_keep
            .ok_or_else(|| Error::NotFound(format!("retention policy for {table_name}")))?;
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days_to_keep));

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let deleted = sqlx::query(delete_sql)
            .bind(cutoff)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?
            .rows_affected() as i64;

        if deleted == 0 {
            tx.commit().await.map_err(Error::Database)?;
            return Ok(None);
        }

        let id = new_v7();
        let created_at = Utc::now();
        sqlx::query(
            "INSERT INTO purge_proof (id, table_name, records_purged, cutoff, operator, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(id)
        .bind(table_name)
        .bind(deleted)
        .bind(cutoff)
        .bind(operator)
        .bind(created_at)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;

        Ok(Some(PurgeProof {
            id,
            table_name: table_name.to_string(),
            records_purged: deleted,
            cutoff,
            operator: operator.to_string(),
            created_at,
        }))
    }

    async fn proofs(&self, table_name: Option<&str>, limit: i64) -> Result<Vec<PurgeProof>> {
        let rows = match table_name {
            Some(table) => {
                sqlx::query(
                    "SELECT id, table_name, records_purged, cutoff, operator, created_at
                     FROM purge_proof
                     WHERE table_name = $1
                     ORDER BY created_at DESC
                     LIMIT $2",
                )
                .bind(table)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT id, table_name, records_purged, cutoff, operator, created_at
                     FROM purge_proof
                     ORDER BY created_at DESC
                     LIMIT $1",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| PurgeProof {
                id: row.get::<Uuid, _>("id"),
                table_name: row.get("table_name"),
                records_purged: row.get("records_purged"),
                cutoff: row.get("cutoff"),
                operator: row.get("operator"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitelist_covers_managed_tables_only() {
        assert!(PgRetentionRepository::delete_statement("ingest_batch_metric").is_some());
        assert!(PgRetentionRepository::delete_statement("ingest_audit").is_some());
        assert!(PgRetentionRepository::delete_statement("dead_letter").is_some());

        // Never purgeable: durable state and the proof log itself.
        assert!(PgRetentionRepository::delete_statement("ingest_checkpoint").is_none());
        assert!(PgRetentionRepository::delete_statement("field_provenance").is_none());
        assert!(PgRetentionRepository::delete_statement("purge_proof").is_none());
        assert!(PgRetentionRepository::delete_statement("quarantine_entry").is_none());
    }
}
