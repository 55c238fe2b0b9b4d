//! Batch metrics repository implementation.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use folio_core::{
    defaults, new_v7, BatchMetric, BatchMetricsRepository, BatchStatus, Error, JobKind, Result,
};

/// PostgreSQL implementation of [`BatchMetricsRepository`].
#[derive(Clone)]
pub struct PgBatchMetricsRepository {
    pool: Pool<Postgres>,
}

const BATCH_COLUMNS: &str = "id, pipeline_kind, started_at, last_heartbeat_at, completed_at, \
     records_in_batch, records_processed, status, heal_attempts";

impl PgBatchMetricsRepository {
    /// Create a new batch metrics repository.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_row(row: sqlx::postgres::PgRow) -> Result<BatchMetric> {
        let kind_str: String = row.get("pipeline_kind");
        let status_str: String = row.get("status");

        Ok(BatchMetric {
            id: row.get("id"),
            pipeline_kind: JobKind::parse(&kind_str)
                .ok_or_else(|| Error::Internal(format!("unknown pipeline kind: {kind_str}")))?,
            started_at: row.get("started_at"),
            last_heartbeat_at: row.get("last_heartbeat_at"),
            completed_at: row.get("completed_at"),
            records_in_batch: row.get("records_in_batch"),
            records_processed: row.get("records_processed"),
            status: BatchStatus::parse(&status_str)
                .ok_or_else(|| Error::Internal(format!("unknown batch status: {status_str}")))?,
            heal_attempts: row.get("heal_attempts"),
        })
    }
}

#[async_trait]
impl BatchMetricsRepository for PgBatchMetricsRepository {
    async fn open(&self, kind: JobKind, records_in_batch: i32) -> Result<Uuid> {
        // A resumed invocation reopens the newest self-healed batch of its
        // kind so heal attempts keep accumulating against one batch id.
        let reopened: Option<Uuid> = sqlx::query_scalar(
            "UPDATE ingest_batch_metric
             SET status = 'running', last_heartbeat_at = NOW()
             WHERE id = (
                 SELECT id FROM ingest_batch_metric
                 WHERE pipeline_kind = $1 AND status = 'self_healed'
                   AND heal_attempts < $2
                 ORDER BY started_at DESC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING id",
        )
        .bind(kind.as_str())
        .bind(defaults::MAX_SELF_HEAL_ATTEMPTS)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        if let Some(id) = reopened {
            return Ok(id);
        }

        let id = new_v7();
        sqlx::query(
            "INSERT INTO ingest_batch_metric
                 (id, pipeline_kind, started_at, last_heartbeat_at, records_in_batch, status)
             VALUES ($1, $2, NOW(), NOW(), $3, 'running')",
        )
        .bind(id)
        .bind(kind.as_str())
        .bind(records_in_batch)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(id)
    }

    async fn heartbeat(&self, batch_id: Uuid, records_processed: i32) -> Result<()> {
        // A heartbeat may revive a self-healed batch whose process turned
        // out to be alive, but never a terminal one.
        sqlx::query(
            "UPDATE ingest_batch_metric
             SET last_heartbeat_at = NOW(), records_processed = $1, status = 'running'
             WHERE id = $2 AND status IN ('running', 'self_healed', 'stalled')",
        )
        .bind(records_processed)
        .bind(batch_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn mark_stalled(&self, batch_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE ingest_batch_metric
             SET status = 'stalled'
             WHERE id = $1 AND status = 'running'",
        )
        .bind(batch_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn complete(&self, batch_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE ingest_batch_metric
             SET status = 'completed', completed_at = NOW(), last_heartbeat_at = NOW()
             WHERE id = $1 AND status NOT IN ('completed', 'failed')",
        )
        .bind(batch_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn mark_failed(&self, batch_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE ingest_batch_metric
             SET status = 'failed', completed_at = NOW()
             WHERE id = $1 AND status <> 'completed'",
        )
        .bind(batch_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn mark_self_healed(&self, batch_id: Uuid) -> Result<i32> {
        let attempts: i32 = sqlx::query_scalar(
            "UPDATE ingest_batch_metric
             SET status = 'self_healed', heal_attempts = heal_attempts + 1
             WHERE id = $1
             RETURNING heal_attempts",
        )
        .bind(batch_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(attempts)
    }

    async fn running(&self) -> Result<Vec<BatchMetric>> {
        let rows = sqlx::query(&format!(
            "SELECT {BATCH_COLUMNS} FROM ingest_batch_metric
             WHERE status = 'running'
             ORDER BY started_at"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_row).collect()
    }

    async fn duration_p95_secs(&self, kind: JobKind, min_samples: i64) -> Result<Option<f64>> {
        let p95: Option<f64> = sqlx::query_scalar(
            "SELECT percentile_cont(0.95) WITHIN GROUP (
                 ORDER BY EXTRACT(EPOCH FROM (completed_at - started_at)))
             FROM ingest_batch_metric
             WHERE pipeline_kind = $1 AND status = 'completed' AND completed_at IS NOT NULL
             HAVING COUNT(*) >= $2",
        )
        .bind(kind.as_str())
        .bind(min_samples)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?
        .flatten();

        Ok(p95)
    }

    async fn get(&self, batch_id: Uuid) -> Result<Option<BatchMetric>> {
        let row = sqlx::query(&format!(
            "SELECT {BATCH_COLUMNS} FROM ingest_batch_metric WHERE id = $1"
        ))
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_row).transpose()
    }
}
