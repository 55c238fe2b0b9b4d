//! Repository traits for the ingestion engine's persisted state.
//!
//! Traits live here; PostgreSQL implementations live in `folio-db` and
//! in-memory implementations for orchestration tests live in
//! `folio-pipeline::testing`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::breaker::BreakerState;
use crate::error::Result;
use crate::models::{
    AuditEvent, AuditEventKind, BatchMetric, Checkpoint, ControlSignal, DeadLetter,
    DeadLetterStats, FieldProvenance, FieldWrite, JobKind, NewDeadLetter, NewQuarantineEntry,
    ProgressCounters, PurgeProof, QuarantineEntry, ResolutionAction, RetentionPolicy,
};

// =============================================================================
// CHECKPOINT REPOSITORY
// =============================================================================

/// Repository for per-job resumable state and the run lease.
#[async_trait]
pub trait CheckpointRepository: Send + Sync {
    /// Acquire the run lease for a job: an atomic compare-and-set that
    /// succeeds only if `is_running` is false or the existing lease is
    /// older than `stale_after`. Creates the row with defaults on the
    /// first run. Fails with [`crate::Error::AlreadyRunning`] otherwise.
    async fn acquire(
        &self,
        job_name: &str,
        kind: JobKind,
        stale_after: Duration,
    ) -> Result<Checkpoint>;

    /// Best-effort progress update: cursor + absolute counters.
    async fn heartbeat(
        &self,
        job_name: &str,
        cursor: &JsonValue,
        counters: ProgressCounters,
    ) -> Result<()>;

    /// Clear the run lease.
    async fn release(&self, job_name: &str) -> Result<()>;

    /// Admin control. `pause` stamps `paused_at`; `stop` clears the
    /// lease immediately; `run` clears any pause marker.
    async fn set_control(&self, job_name: &str, signal: ControlSignal) -> Result<()>;

    /// Read the current control signal (called at page boundaries).
    async fn control_signal(&self, job_name: &str) -> Result<ControlSignal>;

    /// Persist the breaker snapshot into the checkpoint row.
    async fn save_breaker(&self, job_name: &str, state: &BreakerState) -> Result<()>;

    /// Self-heal: atomically clear the lease *only if still held*, reset
    /// the control signal to `run` and clear the pause marker. Returns
    /// false when the job resumed between the stall check and the heal,
    /// in which case nothing is changed.
    async fn heal(&self, job_name: &str) -> Result<bool>;

    /// Fetch one checkpoint.
    async fn get(&self, job_name: &str) -> Result<Option<Checkpoint>>;

    /// List all checkpoints (admin surface).
    async fn list(&self) -> Result<Vec<Checkpoint>>;
}

// =============================================================================
// BATCH METRICS REPOSITORY
// =============================================================================

/// Repository for per-batch execution telemetry.
#[async_trait]
pub trait BatchMetricsRepository: Send + Sync {
    /// Open a batch for a pipeline kind. A resumed invocation reopens the
    /// newest `self_healed` batch of its kind (so heal attempts accumulate
    /// against one batch id); otherwise a new row is created.
    async fn open(&self, kind: JobKind, records_in_batch: i32) -> Result<Uuid>;

    /// Record batch liveness. Also flips a `self_healed` batch back to
    /// `running` when its original process turns out to be alive; never
    /// revives a terminal batch.
    async fn heartbeat(&self, batch_id: Uuid, records_processed: i32) -> Result<()>;

    /// Flag a batch as stalled. A subsequent heartbeat from a job that
    /// turns out to be alive flips it back to `running`.
    async fn mark_stalled(&self, batch_id: Uuid) -> Result<()>;

    /// Close a batch successfully.
    async fn complete(&self, batch_id: Uuid) -> Result<()>;

    /// Leave a batch hard-failed for operator attention.
    async fn mark_failed(&self, batch_id: Uuid) -> Result<()>;

    /// Mark a batch self-healed and increment its heal-attempt counter,
    /// returning the new attempt count.
    async fn mark_self_healed(&self, batch_id: Uuid) -> Result<i32>;

    /// All batches currently in `running` status.
    async fn running(&self) -> Result<Vec<BatchMetric>>;

    /// p95 of completed-batch durations for a kind, in seconds. `None`
    /// until at least `min_samples` completed batches exist.
    async fn duration_p95_secs(&self, kind: JobKind, min_samples: i64) -> Result<Option<f64>>;

    /// Fetch one batch.
    async fn get(&self, batch_id: Uuid) -> Result<Option<BatchMetric>>;
}

// =============================================================================
// DEAD LETTER REPOSITORY
// =============================================================================

/// Repository for individually failed units of work.
#[async_trait]
pub trait DeadLetterRepository: Send + Sync {
    /// Capture a failed unit of work. Schedules the first retry.
    async fn push(&self, entry: NewDeadLetter) -> Result<Uuid>;

    /// Atomically claim entries due for retry (pending with
    /// `next_retry_at <= now`), moving them to `retrying`.
    async fn claim_due(&self, limit: i64) -> Result<Vec<DeadLetter>>;

    /// Record a failed replay: back to `pending` with the next backoff
    /// delay while retries remain, `abandoned` otherwise.
    async fn record_retry_failure(&self, id: Uuid, error: &str) -> Result<()>;

    /// Put a claimed entry back to `pending` after `delay` without
    /// consuming a retry (used when the job's breaker or limiter blocks
    /// the replay before any I/O happens).
    async fn defer(&self, id: Uuid, delay: Duration) -> Result<()>;

    /// Explicitly resolve an entry.
    async fn resolve(&self, id: Uuid, actor: &str, note: Option<&str>) -> Result<()>;

    /// Explicitly abandon an entry.
    async fn abandon(&self, id: Uuid, actor: &str, note: Option<&str>) -> Result<()>;

    /// Reschedule an entry for immediate replay (admin surface).
    async fn replay_now(&self, id: Uuid) -> Result<()>;

    /// List entries filtered by status and/or kind.
    async fn list(
        &self,
        status: Option<&str>,
        job_kind: Option<JobKind>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DeadLetter>>;

    /// Counters for the admin surface.
    async fn stats(&self) -> Result<DeadLetterStats>;
}

// =============================================================================
// QUARANTINE REPOSITORY
// =============================================================================

/// Repository for records held for human or automated curation.
#[async_trait]
pub trait QuarantineRepository: Send + Sync {
    /// Quarantine a record, skipping the insert when an unresolved entry
    /// with the same payload fingerprint already exists. Returns the id
    /// of the inserted entry, or `None` when deduplicated away.
    async fn push_deduplicated(&self, entry: NewQuarantineEntry) -> Result<Option<Uuid>>;

    /// Resolve an entry with an explicit action. Returns false when the
    /// entry was already resolved.
    async fn resolve(
        &self,
        id: Uuid,
        action: ResolutionAction,
        actor: &str,
        notes: Option<&str>,
    ) -> Result<bool>;

    /// List unresolved entries, oldest first.
    async fn list_pending(&self, limit: i64, offset: i64) -> Result<Vec<QuarantineEntry>>;

    /// Fetch one entry.
    async fn get(&self, id: Uuid) -> Result<Option<QuarantineEntry>>;

    /// Count of unresolved entries.
    async fn pending_count(&self) -> Result<i64>;
}

// =============================================================================
// PROVENANCE REPOSITORY
// =============================================================================

/// Repository for per-field source attribution.
#[async_trait]
pub trait ProvenanceRepository: Send + Sync {
    /// Upsert a field's provenance. A locked row is left untouched and
    /// `false` is returned; otherwise source, confidence and fetched-at
    /// are updated and `true` is returned.
    async fn upsert(&self, write: &FieldWrite) -> Result<bool>;

    /// Fetch one field's provenance.
    async fn get(
        &self,
        entity_type: &str,
        entity_id: &str,
        field_name: &str,
    ) -> Result<Option<FieldProvenance>>;

    /// All provenance rows for one entity.
    async fn for_entity(&self, entity_type: &str, entity_id: &str)
        -> Result<Vec<FieldProvenance>>;

    /// Provenance rows last written by a source (selective re-sync or
    /// takedown support).
    async fn by_source(&self, source_name: &str, limit: i64) -> Result<Vec<FieldProvenance>>;

    /// Lock a field against further automated writes.
    async fn lock(
        &self,
        entity_type: &str,
        entity_id: &str,
        field_name: &str,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<()>;

    /// Release a lock.
    async fn unlock(&self, entity_type: &str, entity_id: &str, field_name: &str) -> Result<()>;
}

// =============================================================================
// RETENTION REPOSITORY
// =============================================================================

/// Repository for bounded telemetry lifetime.
#[async_trait]
pub trait RetentionRepository: Send + Sync {
    /// Configured policies.
    async fn policies(&self) -> Result<Vec<RetentionPolicy>>;

    /// Set or update a policy for a telemetry table.
    async fn set_policy(&self, table_name: &str, days_to_keep: i32) -> Result<()>;

    /// Purge rows older than the table's retention window, writing
    /// exactly one purge-proof row in the same transaction. Returns
    /// `None` (and writes nothing) when no rows are expired.
    async fn purge(&self, table_name: &str, operator: &str) -> Result<Option<PurgeProof>>;

    /// Purge history, newest first.
    async fn proofs(&self, table_name: Option<&str>, limit: i64) -> Result<Vec<PurgeProof>>;
}

// =============================================================================
// OPERATIONAL AUDIT REPOSITORY
// =============================================================================

/// Append-only operational audit trail. Writers treat failures as
/// best-effort: log and continue, never block the primary operation.
#[async_trait]
pub trait AuditRepository: Send + Sync {
    /// Append one audit row.
    async fn append(&self, kind: AuditEventKind, job_name: &str, detail: JsonValue) -> Result<()>;

    /// List audit rows, newest first.
    async fn list(
        &self,
        kind: Option<AuditEventKind>,
        job_name: Option<&str>,
        limit: i64,
    ) -> Result<Vec<AuditEvent>>;
}

/// Best-effort audit append: failures are logged, never propagated.
pub async fn audit_best_effort(
    audit: &dyn AuditRepository,
    kind: AuditEventKind,
    job_name: &str,
    detail: JsonValue,
) {
    if let Err(e) = audit.append(kind, job_name, detail).await {
        tracing::warn!(
            job_name,
            kind = kind.as_str(),
            error = %e,
            "audit append failed, continuing"
        );
    }
}

/// Convenience: heartbeat age of a batch at `now`.
pub fn heartbeat_age(last_heartbeat_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - last_heartbeat_at).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_age() {
        let now: DateTime<Utc> = "2026-08-01T00:10:00Z".parse().unwrap();
        let beat: DateTime<Utc> = "2026-08-01T00:00:00Z".parse().unwrap();
        assert_eq!(heartbeat_age(beat, now), Duration::from_secs(600));
    }

    #[test]
    fn test_heartbeat_age_clock_skew_is_zero() {
        // A heartbeat stamped ahead of the sweep clock must not underflow.
        let now: DateTime<Utc> = "2026-08-01T00:00:00Z".parse().unwrap();
        let beat: DateTime<Utc> = "2026-08-01T00:00:05Z".parse().unwrap();
        assert_eq!(heartbeat_age(beat, now), Duration::ZERO);
    }
}
