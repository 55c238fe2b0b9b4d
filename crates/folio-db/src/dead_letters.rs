//! Dead letter repository implementation.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use folio_core::{
    defaults, new_v7, payload_fingerprint, DeadLetter, DeadLetterRepository, DeadLetterStats,
    DeadLetterStatus, Error, JobKind, NewDeadLetter, Result,
};

/// PostgreSQL implementation of [`DeadLetterRepository`].
#[derive(Clone)]
pub struct PgDeadLetterRepository {
    pool: Pool<Postgres>,
}

const DEAD_LETTER_COLUMNS: &str = "id, job_kind, batch_id, entity_ref, error_type, \
     error_message, error_trace, request_snapshot, response_snapshot, fingerprint, status, \
     retry_count, max_retries, next_retry_at, resolved_by, resolution_note, created_at, \
     updated_at";

impl PgDeadLetterRepository {
    /// Create a new dead letter repository.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_row(row: sqlx::postgres::PgRow) -> Result<DeadLetter> {
        let kind_str: String = row.get("job_kind");
        let status_str: String = row.get("status");

        Ok(DeadLetter {
            id: row.get("id"),
            job_kind: JobKind::parse(&kind_str)
                .ok_or_else(|| Error::Internal(format!("unknown job kind: {kind_str}")))?,
            batch_id: row.get("batch_id"),
            entity_ref: row.get("entity_ref"),
            error_type: row.get("error_type"),
            error_message: row.get("error_message"),
            error_trace: row.get("error_trace"),
            request_snapshot: row.get("request_snapshot"),
            response_snapshot: row.get("response_snapshot"),
            fingerprint: row.get("fingerprint"),
            status: DeadLetterStatus::parse(&status_str)
                .ok_or_else(|| Error::Internal(format!("unknown DLQ status: {status_str}")))?,
            retry_count: row.get("retry_count"),
            max_retries: row.get("max_retries"),
            next_retry_at: row.get("next_retry_at"),
            resolved_by: row.get("resolved_by"),
            resolution_note: row.get("resolution_note"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl DeadLetterRepository for PgDeadLetterRepository {
    async fn push(&self, entry: NewDeadLetter) -> Result<Uuid> {
        let id = new_v7();
        let fingerprint = payload_fingerprint(
            entry
                .request_snapshot
                .as_ref()
                .unwrap_or(&serde_json::json!({ "entity_ref": entry.entity_ref })),
        );
        let first_retry = Utc::now()
            + chrono::Duration::from_std(defaults::retry_delay(
                0,
                std::time::Duration::from_secs(defaults::DLQ_RETRY_BASE_SECS),
            ))
            .unwrap_or_else(|_| chrono::Duration::seconds(defaults::DLQ_RETRY_BASE_SECS as i64));

        sqlx::query(
            "INSERT INTO dead_letter
                 (id, job_kind, batch_id, entity_ref, error_type, error_message, error_trace,
                  request_snapshot, response_snapshot, fingerprint, status, max_retries,
                  next_retry_at, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'pending', $11, $12, NOW(), NOW())",
        )
        .bind(id)
        .bind(entry.job_kind.as_str())
        .bind(entry.batch_id)
        .bind(&entry.entity_ref)
        .bind(&entry.error_type)
        .bind(&entry.error_message)
        .bind(&entry.error_trace)
        .bind(&entry.request_snapshot)
        .bind(&entry.response_snapshot)
        .bind(fingerprint)
        .bind(entry.max_retries)
        .bind(first_retry)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(id)
    }

    async fn claim_due(&self, limit: i64) -> Result<Vec<DeadLetter>> {
        // FOR UPDATE SKIP LOCKED so concurrent schedulers never replay
        // the same entry twice.
        let rows = sqlx::query(&format!(
            "UPDATE dead_letter
             SET status = 'retrying', updated_at = NOW()
             WHERE id IN (
                 SELECT id FROM dead_letter
                 WHERE status = 'pending' AND next_retry_at <= NOW()
                 ORDER BY next_retry_at
                 LIMIT $1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {DEAD_LETTER_COLUMNS}"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_row).collect()
    }

    async fn record_retry_failure(&self, id: Uuid, error: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let (retry_count, max_retries): (i32, i32) =
            sqlx::query_as("SELECT retry_count, max_retries FROM dead_letter WHERE id = $1")
                .bind(id)
                .fetch_one(&mut *tx)
                .await
                .map_err(Error::Database)?;

        let next_count = retry_count + 1;
        if next_count < max_retries {
            let delay = defaults::retry_delay(
                next_count,
                std::time::Duration::from_secs(defaults::DLQ_RETRY_BASE_SECS),
            );
            let next_retry_at = Utc::now()
                + chrono::Duration::from_std(delay)
                    .unwrap_or_else(|_| chrono::Duration::seconds(3600));

            sqlx::query(
                "UPDATE dead_letter
                 SET status = 'pending', retry_count = $1, error_message = $2,
                     next_retry_at = $3, updated_at = NOW()
                 WHERE id = $4",
            )
            .bind(next_count)
            .bind(error)
            .bind(next_retry_at)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        } else {
            sqlx::query(
                "UPDATE dead_letter
                 SET status = 'abandoned', retry_count = $1, error_message = $2,
                     next_retry_at = NULL, resolved_by = 'retry-scheduler',
                     resolution_note = 'retry budget exhausted', updated_at = NOW()
                 WHERE id = $3",
            )
            .bind(next_count)
            .bind(error)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn defer(&self, id: Uuid, delay: std::time::Duration) -> Result<()> {
        let next_retry_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(3600));

        sqlx::query(
            "UPDATE dead_letter
             SET status = 'pending', next_retry_at = $1, updated_at = NOW()
             WHERE id = $2 AND status = 'retrying'",
        )
        .bind(next_retry_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn resolve(&self, id: Uuid, actor: &str, note: Option<&str>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE dead_letter
             SET status = 'resolved', resolved_by = $1, resolution_note = $2,
                 next_retry_at = NULL, updated_at = NOW()
             WHERE id = $3 AND status IN ('pending', 'retrying')",
        )
        .bind(actor)
        .bind(note)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("open dead letter {id}")));
        }
        Ok(())
    }

    async fn abandon(&self, id: Uuid, actor: &str, note: Option<&str>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE dead_letter
             SET status = 'abandoned', resolved_by = $1, resolution_note = $2,
                 next_retry_at = NULL, updated_at = NOW()
             WHERE id = $3 AND status IN ('pending', 'retrying')",
        )
        .bind(actor)
        .bind(note)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("open dead letter {id}")));
        }
        Ok(())
    }

    async fn replay_now(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query(
            "UPDATE dead_letter
             SET status = 'pending', next_retry_at = NOW(), updated_at = NOW()
             WHERE id = $1 AND status IN ('pending', 'retrying', 'abandoned')",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("replayable dead letter {id}")));
        }
        Ok(())
    }

    async fn list(
        &self,
        status: Option<&str>,
        job_kind: Option<JobKind>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DeadLetter>> {
        let mut conditions = Vec::new();
        let mut param_idx = 1;

        if status.is_some() {
            conditions.push(format!("status = ${param_idx}"));
            param_idx += 1;
        }
        if job_kind.is_some() {
            conditions.push(format!("job_kind = ${param_idx}"));
            param_idx += 1;
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let query = format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letter
             {where_clause}
             ORDER BY created_at DESC
             LIMIT ${} OFFSET ${}",
            param_idx,
            param_idx + 1
        );

        let mut q = sqlx::query(&query);
        if let Some(s) = status {
            q = q.bind(s.to_string());
        }
        if let Some(kind) = job_kind {
            q = q.bind(kind.as_str());
        }
        q = q.bind(limit).bind(offset);

        let rows = q.fetch_all(&self.pool).await.map_err(Error::Database)?;
        rows.into_iter().map(Self::parse_row).collect()
    }

    async fn stats(&self) -> Result<DeadLetterStats> {
        let row = sqlx::query(
            "SELECT
                COUNT(*) FILTER (WHERE status = 'pending') as pending,
                COUNT(*) FILTER (WHERE status = 'retrying') as retrying,
                COUNT(*) FILTER (WHERE status = 'resolved') as resolved,
                COUNT(*) FILTER (WHERE status = 'abandoned') as abandoned
             FROM dead_letter",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(DeadLetterStats {
            pending: row.get::<i64, _>("pending"),
            retrying: row.get::<i64, _>("retrying"),
            resolved: row.get::<i64, _>("resolved"),
            abandoned: row.get::<i64, _>("abandoned"),
        })
    }
}
