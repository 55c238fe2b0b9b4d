//! Checkpoint repository implementation.
//!
//! The run lease is a compare-and-set on the checkpoint row itself:
//! `acquire` is a single `INSERT .. ON CONFLICT DO UPDATE .. WHERE`
//! statement so first-run creation and lease takeover cannot race, and
//! `heal` is a single `UPDATE .. WHERE is_running = true` so a job that
//! resumed between a stall check and the heal keeps its lease.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::{Pool, Postgres, Row};

use folio_core::{
    BreakerState, Checkpoint, CheckpointRepository, ControlSignal, Error, JobKind,
    ProgressCounters, Result,
};

/// PostgreSQL implementation of [`CheckpointRepository`].
#[derive(Clone)]
pub struct PgCheckpointRepository {
    pool: Pool<Postgres>,
}

const CHECKPOINT_COLUMNS: &str = "job_name, job_kind, cursor, records_processed, \
     records_updated, error_count, is_running, lease_acquired_at, control_signal, \
     paused_at, breaker_state, created_at, updated_at";

impl PgCheckpointRepository {
    /// Create a new checkpoint repository.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_row(row: sqlx::postgres::PgRow) -> Result<Checkpoint> {
        let kind_str: String = row.get("job_kind");
        let signal_str: String = row.get("control_signal");
        let breaker_blob: Option<JsonValue> = row.get("breaker_state");

        let job_kind = JobKind::parse(&kind_str)
            .ok_or_else(|| Error::Internal(format!("unknown job kind in checkpoint: {kind_str}")))?;
        let control_signal = ControlSignal::parse(&signal_str).unwrap_or(ControlSignal::Run);
        let breaker: Option<BreakerState> =
            breaker_blob.and_then(|blob| serde_json::from_value(blob).ok());

        Ok(Checkpoint {
            job_name: row.get("job_name"),
            job_kind,
            cursor: row.get("cursor"),
            counters: ProgressCounters {
                processed: row.get("records_processed"),
                updated: row.get("records_updated"),
                errors: row.get("error_count"),
            },
            is_running: row.get("is_running"),
            lease_acquired_at: row.get("lease_acquired_at"),
            control_signal,
            paused_at: row.get("paused_at"),
            breaker,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl CheckpointRepository for PgCheckpointRepository {
    async fn acquire(
        &self,
        job_name: &str,
        kind: JobKind,
        stale_after: Duration,
    ) -> Result<Checkpoint> {
        let now = Utc::now();
        let stale_cutoff = now
            - chrono::Duration::from_std(stale_after)
                .map_err(|e| Error::InvalidInput(format!("stale_after out of range: {e}")))?;

        // One atomic statement: creates the row on first run, otherwise
        // takes the lease only when it is free or stale. No row returned
        // means another holder is live.
        let row = sqlx::query(&format!(
            "INSERT INTO ingest_checkpoint (job_name, job_kind, is_running, lease_acquired_at, created_at, updated_at)
             VALUES ($1, $2, TRUE, $3, $3, $3)
             ON CONFLICT (job_name) DO UPDATE
             SET is_running = TRUE, lease_acquired_at = $3, updated_at = $3
             WHERE ingest_checkpoint.is_running = FALSE
                OR ingest_checkpoint.lease_acquired_at IS NULL
                OR ingest_checkpoint.lease_acquired_at < $4
             RETURNING {CHECKPOINT_COLUMNS}"
        ))
        .bind(job_name)
        .bind(kind.as_str())
        .bind(now)
        .bind(stale_cutoff)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        match row {
            Some(row) => Self::parse_row(row),
            None => Err(Error::AlreadyRunning(job_name.to_string())),
        }
    }

    async fn heartbeat(
        &self,
        job_name: &str,
        cursor: &JsonValue,
        counters: ProgressCounters,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE ingest_checkpoint
             SET cursor = $1, records_processed = $2, records_updated = $3,
                 error_count = $4, updated_at = NOW()
             WHERE job_name = $5",
        )
        .bind(cursor)
        .bind(counters.processed)
        .bind(counters.updated)
        .bind(counters.errors)
        .bind(job_name)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn release(&self, job_name: &str) -> Result<()> {
        sqlx::query(
            "UPDATE ingest_checkpoint
             SET is_running = FALSE, updated_at = NOW()
             WHERE job_name = $1",
        )
        .bind(job_name)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn set_control(&self, job_name: &str, signal: ControlSignal) -> Result<()> {
        let result = match signal {
            ControlSignal::Pause => {
                sqlx::query(
                    "UPDATE ingest_checkpoint
                     SET control_signal = 'pause', paused_at = NOW(), updated_at = NOW()
                     WHERE job_name = $1",
                )
                .bind(job_name)
                .execute(&self.pool)
                .await
            }
            ControlSignal::Stop => {
                // Stop clears the lease immediately so a scheduler may
                // restart the job on its next invocation.
                sqlx::query(
                    "UPDATE ingest_checkpoint
                     SET control_signal = 'stop', is_running = FALSE, paused_at = NULL,
                         updated_at = NOW()
                     WHERE job_name = $1",
                )
                .bind(job_name)
                .execute(&self.pool)
                .await
            }
            ControlSignal::Run => {
                sqlx::query(
                    "UPDATE ingest_checkpoint
                     SET control_signal = 'run', paused_at = NULL, updated_at = NOW()
                     WHERE job_name = $1",
                )
                .bind(job_name)
                .execute(&self.pool)
                .await
            }
        }
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("checkpoint {job_name}")));
        }
        Ok(())
    }

    async fn control_signal(&self, job_name: &str) -> Result<ControlSignal> {
        let signal: Option<String> =
            sqlx::query_scalar("SELECT control_signal FROM ingest_checkpoint WHERE job_name = $1")
                .bind(job_name)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::Database)?;

        Ok(signal
            .as_deref()
            .and_then(ControlSignal::parse)
            .unwrap_or(ControlSignal::Run))
    }

    async fn save_breaker(&self, job_name: &str, state: &BreakerState) -> Result<()> {
        let blob = serde_json::to_value(state)?;
        sqlx::query(
            "UPDATE ingest_checkpoint
             SET breaker_state = $1, updated_at = NOW()
             WHERE job_name = $2",
        )
        .bind(blob)
        .bind(job_name)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn heal(&self, job_name: &str) -> Result<bool> {
        // Clear the lease only if still held; a job that resumed between
        // the stall check and this statement keeps its lease.
        let row = sqlx::query(
            "UPDATE ingest_checkpoint
             SET is_running = FALSE, control_signal = 'run', paused_at = NULL,
                 updated_at = NOW()
             WHERE job_name = $1 AND is_running = TRUE
             RETURNING job_name",
        )
        .bind(job_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.is_some())
    }

    async fn get(&self, job_name: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(&format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM ingest_checkpoint WHERE job_name = $1"
        ))
        .bind(job_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_row).transpose()
    }

    async fn list(&self) -> Result<Vec<Checkpoint>> {
        let rows = sqlx::query(&format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM ingest_checkpoint ORDER BY job_name"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_row).collect()
    }
}
