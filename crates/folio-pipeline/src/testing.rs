//! In-memory implementations of the repository and collaborator seams.
//!
//! Always compiled so orchestration tests here and in downstream crates
//! can exercise the runner, stall detector and schedulers without a
//! database. The implementations honor the same semantics as the
//! PostgreSQL repositories: CAS lease acquisition, clear-only-if-held
//! healing, bounded retry classification, fingerprint dedup, and locked
//! provenance rows as no-ops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use folio_core::{
    defaults, new_v7, payload_fingerprint, AuditEvent, AuditEventKind, AuditRepository,
    BatchMetric, BatchMetricsRepository, BatchStatus, BreakerState, Checkpoint,
    CheckpointRepository, ControlSignal, CursorState, DeadLetter, DeadLetterRepository,
    DeadLetterStats, DeadLetterStatus, EntityStore, Error, FieldProvenance, FieldValue,
    FieldWrite, JobKind, NewDeadLetter, NewQuarantineEntry, NormalizedRecord, ProgressCounters,
    ProvenanceRepository, PurgeProof, QuarantineEntry, QuarantineRepository, ResolutionAction,
    Result, RetentionPolicy, RetentionRepository, SourceAdapter, SourceMeta, SourcePage,
};

use crate::stores::StoreHandles;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// =============================================================================
// CHECKPOINTS
// =============================================================================

/// In-memory [`CheckpointRepository`].
#[derive(Default)]
pub struct MemoryCheckpointRepository {
    rows: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: backdate a checkpoint's last update so it reads as
    /// a crashed holder rather than a live one.
    pub fn set_updated_at(&self, job_name: &str, at: DateTime<Utc>) {
        if let Some(row) = lock(&self.rows).get_mut(job_name) {
            row.updated_at = at;
        }
    }
}

#[async_trait]
impl CheckpointRepository for MemoryCheckpointRepository {
    async fn acquire(
        &self,
        job_name: &str,
        kind: JobKind,
        stale_after: Duration,
    ) -> Result<Checkpoint> {
        let now = Utc::now();
        let mut rows = lock(&self.rows);

        match rows.get_mut(job_name) {
            None => {
                let checkpoint = Checkpoint {
                    job_name: job_name.to_string(),
                    job_kind: kind,
                    cursor: CursorState::Start.to_json(),
                    counters: ProgressCounters::default(),
                    is_running: true,
                    lease_acquired_at: Some(now),
                    control_signal: ControlSignal::Run,
                    paused_at: None,
                    breaker: None,
                    created_at: now,
                    updated_at: now,
                };
                rows.insert(job_name.to_string(), checkpoint.clone());
                Ok(checkpoint)
            }
            Some(row) => {
                let stale = row
                    .lease_acquired_at
                    .map(|t| (now - t).to_std().unwrap_or_default() > stale_after)
                    .unwrap_or(true);
                if row.is_running && !stale {
                    return Err(Error::AlreadyRunning(job_name.to_string()));
                }
                row.is_running = true;
                row.lease_acquired_at = Some(now);
                row.updated_at = now;
                Ok(row.clone())
            }
        }
    }

    async fn heartbeat(
        &self,
        job_name: &str,
        cursor: &JsonValue,
        counters: ProgressCounters,
    ) -> Result<()> {
        if let Some(row) = lock(&self.rows).get_mut(job_name) {
            row.cursor = cursor.clone();
            row.counters = counters;
            row.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn release(&self, job_name: &str) -> Result<()> {
        if let Some(row) = lock(&self.rows).get_mut(job_name) {
            row.is_running = false;
            row.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_control(&self, job_name: &str, signal: ControlSignal) -> Result<()> {
        let mut rows = lock(&self.rows);
        let row = rows
            .get_mut(job_name)
            .ok_or_else(|| Error::NotFound(format!("checkpoint {job_name}")))?;

        row.control_signal = signal;
        match signal {
            ControlSignal::Pause => row.paused_at = Some(Utc::now()),
            ControlSignal::Stop => {
                row.is_running = false;
                row.paused_at = None;
            }
            ControlSignal::Run => row.paused_at = None,
        }
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn control_signal(&self, job_name: &str) -> Result<ControlSignal> {
        Ok(lock(&self.rows)
            .get(job_name)
            .map(|row| row.control_signal)
            .unwrap_or(ControlSignal::Run))
    }

    async fn save_breaker(&self, job_name: &str, state: &BreakerState) -> Result<()> {
        if let Some(row) = lock(&self.rows).get_mut(job_name) {
            row.breaker = Some(state.clone());
            row.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn heal(&self, job_name: &str) -> Result<bool> {
        let mut rows = lock(&self.rows);
        match rows.get_mut(job_name) {
            Some(row) if row.is_running => {
                row.is_running = false;
                row.control_signal = ControlSignal::Run;
                row.paused_at = None;
                row.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, job_name: &str) -> Result<Option<Checkpoint>> {
        Ok(lock(&self.rows).get(job_name).cloned())
    }

    async fn list(&self) -> Result<Vec<Checkpoint>> {
        let mut all: Vec<Checkpoint> = lock(&self.rows).values().cloned().collect();
        all.sort_by(|a, b| a.job_name.cmp(&b.job_name));
        Ok(all)
    }
}

// =============================================================================
// BATCH METRICS
// =============================================================================

/// In-memory [`BatchMetricsRepository`].
#[derive(Default)]
pub struct MemoryBatchMetricsRepository {
    rows: Mutex<HashMap<Uuid, BatchMetric>>,
}

impl MemoryBatchMetricsRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: backdate a batch's heartbeat.
    pub fn set_last_heartbeat(&self, batch_id: Uuid, at: DateTime<Utc>) {
        if let Some(row) = lock(&self.rows).get_mut(&batch_id) {
            row.last_heartbeat_at = at;
        }
    }

    /// Test helper: seed one completed batch with a known duration.
    pub fn seed_completed(&self, kind: JobKind, duration: Duration) {
        let started = Utc::now() - chrono::Duration::hours(1);
        let completed = started
            + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        let id = new_v7();
        lock(&self.rows).insert(
            id,
            BatchMetric {
                id,
                pipeline_kind: kind,
                started_at: started,
                last_heartbeat_at: completed,
                completed_at: Some(completed),
                records_in_batch: 0,
                records_processed: 0,
                status: BatchStatus::Completed,
                heal_attempts: 0,
            },
        );
    }
}

#[async_trait]
impl BatchMetricsRepository for MemoryBatchMetricsRepository {
    async fn open(&self, kind: JobKind, records_in_batch: i32) -> Result<Uuid> {
        let mut rows = lock(&self.rows);

        let reopen = rows
            .values()
            .filter(|row| {
                row.pipeline_kind == kind
                    && row.status == BatchStatus::SelfHealed
                    && row.heal_attempts < defaults::MAX_SELF_HEAL_ATTEMPTS
            })
            .max_by_key(|row| row.started_at)
            .map(|row| row.id);

        if let Some(id) = reopen {
            let row = rows.get_mut(&id).expect("row exists");
            row.status = BatchStatus::Running;
            row.last_heartbeat_at = Utc::now();
            return Ok(id);
        }

        let id = new_v7();
        rows.insert(
            id,
            BatchMetric {
                id,
                pipeline_kind: kind,
                started_at: Utc::now(),
                last_heartbeat_at: Utc::now(),
                completed_at: None,
                records_in_batch,
                records_processed: 0,
                status: BatchStatus::Running,
                heal_attempts: 0,
            },
        );
        Ok(id)
    }

    async fn heartbeat(&self, batch_id: Uuid, records_processed: i32) -> Result<()> {
        if let Some(row) = lock(&self.rows).get_mut(&batch_id) {
            if matches!(
                row.status,
                BatchStatus::Running | BatchStatus::SelfHealed | BatchStatus::Stalled
            ) {
                row.status = BatchStatus::Running;
                row.last_heartbeat_at = Utc::now();
                row.records_processed = records_processed;
            }
        }
        Ok(())
    }

    async fn mark_stalled(&self, batch_id: Uuid) -> Result<()> {
        if let Some(row) = lock(&self.rows).get_mut(&batch_id) {
            if row.status == BatchStatus::Running {
                row.status = BatchStatus::Stalled;
            }
        }
        Ok(())
    }

    async fn complete(&self, batch_id: Uuid) -> Result<()> {
        if let Some(row) = lock(&self.rows).get_mut(&batch_id) {
            if !row.status.is_terminal() {
                row.status = BatchStatus::Completed;
                row.completed_at = Some(Utc::now());
                row.last_heartbeat_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn mark_failed(&self, batch_id: Uuid) -> Result<()> {
        if let Some(row) = lock(&self.rows).get_mut(&batch_id) {
            if row.status != BatchStatus::Completed {
                row.status = BatchStatus::Failed;
                row.completed_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn mark_self_healed(&self, batch_id: Uuid) -> Result<i32> {
        let mut rows = lock(&self.rows);
        let row = rows
            .get_mut(&batch_id)
            .ok_or_else(|| Error::NotFound(format!("batch {batch_id}")))?;
        row.status = BatchStatus::SelfHealed;
        row.heal_attempts += 1;
        Ok(row.heal_attempts)
    }

    async fn running(&self) -> Result<Vec<BatchMetric>> {
        let mut all: Vec<BatchMetric> = lock(&self.rows)
            .values()
            .filter(|row| row.status == BatchStatus::Running)
            .cloned()
            .collect();
        all.sort_by_key(|row| row.started_at);
        Ok(all)
    }

    async fn duration_p95_secs(&self, kind: JobKind, min_samples: i64) -> Result<Option<f64>> {
        let mut durations: Vec<f64> = lock(&self.rows)
            .values()
            .filter(|row| row.pipeline_kind == kind && row.status == BatchStatus::Completed)
            .filter_map(|row| {
                row.completed_at
                    .map(|done| (done - row.started_at).num_milliseconds() as f64 / 1000.0)
            })
            .collect();

        if (durations.len() as i64) < min_samples {
            return Ok(None);
        }
        durations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((durations.len() - 1) as f64 * 0.95).round() as usize;
        Ok(Some(durations[idx]))
    }

    async fn get(&self, batch_id: Uuid) -> Result<Option<BatchMetric>> {
        Ok(lock(&self.rows).get(&batch_id).cloned())
    }
}

// =============================================================================
// DEAD LETTERS
// =============================================================================

/// In-memory [`DeadLetterRepository`].
#[derive(Default)]
pub struct MemoryDeadLetterRepository {
    rows: Mutex<HashMap<Uuid, DeadLetter>>,
}

impl MemoryDeadLetterRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: make an entry due immediately.
    pub fn make_due(&self, id: Uuid) {
        if let Some(row) = lock(&self.rows).get_mut(&id) {
            row.next_retry_at = Some(Utc::now() - chrono::Duration::seconds(1));
        }
    }

    /// Test helper: all entries, unfiltered.
    pub fn all(&self) -> Vec<DeadLetter> {
        lock(&self.rows).values().cloned().collect()
    }
}

#[async_trait]
impl DeadLetterRepository for MemoryDeadLetterRepository {
    async fn push(&self, entry: NewDeadLetter) -> Result<Uuid> {
        let id = new_v7();
        let now = Utc::now();
        let fingerprint = payload_fingerprint(
            entry
                .request_snapshot
                .as_ref()
                .unwrap_or(&json!({ "entity_ref": entry.entity_ref })),
        );
        let first_retry = now
            + chrono::Duration::from_std(defaults::retry_delay(
                0,
                Duration::from_secs(defaults::DLQ_RETRY_BASE_SECS),
            ))
            .unwrap_or_else(|_| chrono::Duration::seconds(defaults::DLQ_RETRY_BASE_SECS as i64));

        lock(&self.rows).insert(
            id,
            DeadLetter {
                id,
                job_kind: entry.job_kind,
                batch_id: entry.batch_id,
                entity_ref: entry.entity_ref,
                error_type: entry.error_type,
                error_message: entry.error_message,
                error_trace: entry.error_trace,
                request_snapshot: entry.request_snapshot,
                response_snapshot: entry.response_snapshot,
                fingerprint,
                status: DeadLetterStatus::Pending,
                retry_count: 0,
                max_retries: entry.max_retries,
                next_retry_at: Some(first_retry),
                resolved_by: None,
                resolution_note: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn claim_due(&self, limit: i64) -> Result<Vec<DeadLetter>> {
        let now = Utc::now();
        let mut rows = lock(&self.rows);

        let mut due: Vec<Uuid> = rows
            .values()
            .filter(|row| {
                row.status == DeadLetterStatus::Pending
                    && row.next_retry_at.map(|at| at <= now).unwrap_or(false)
            })
            .map(|row| row.id)
            .collect();
        due.sort_by_key(|id| rows[id].next_retry_at);
        due.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            let row = rows.get_mut(&id).expect("row exists");
            row.status = DeadLetterStatus::Retrying;
            row.updated_at = now;
            claimed.push(row.clone());
        }
        Ok(claimed)
    }

    async fn record_retry_failure(&self, id: Uuid, error: &str) -> Result<()> {
        let mut rows = lock(&self.rows);
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("dead letter {id}")))?;

        row.retry_count += 1;
        row.error_message = error.to_string();
        row.updated_at = Utc::now();

        if row.retry_count < row.max_retries {
            let delay = defaults::retry_delay(
                row.retry_count,
                Duration::from_secs(defaults::DLQ_RETRY_BASE_SECS),
            );
            row.status = DeadLetterStatus::Pending;
            row.next_retry_at = Some(
                Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(3600)),
            );
        } else {
            row.status = DeadLetterStatus::Abandoned;
            row.next_retry_at = None;
            row.resolved_by = Some("retry-scheduler".to_string());
            row.resolution_note = Some("retry budget exhausted".to_string());
        }
        Ok(())
    }

    async fn defer(&self, id: Uuid, delay: Duration) -> Result<()> {
        let mut rows = lock(&self.rows);
        if let Some(row) = rows.get_mut(&id) {
            if row.status == DeadLetterStatus::Retrying {
                row.status = DeadLetterStatus::Pending;
                row.next_retry_at = Some(
                    Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(3600)),
                );
                row.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn resolve(&self, id: Uuid, actor: &str, note: Option<&str>) -> Result<()> {
        self.close(id, DeadLetterStatus::Resolved, actor, note)
    }

    async fn abandon(&self, id: Uuid, actor: &str, note: Option<&str>) -> Result<()> {
        self.close(id, DeadLetterStatus::Abandoned, actor, note)
    }

    async fn replay_now(&self, id: Uuid) -> Result<()> {
        let mut rows = lock(&self.rows);
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("dead letter {id}")))?;
        if row.status == DeadLetterStatus::Resolved {
            return Err(Error::NotFound(format!("replayable dead letter {id}")));
        }
        row.status = DeadLetterStatus::Pending;
        row.next_retry_at = Some(Utc::now());
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn list(
        &self,
        status: Option<&str>,
        job_kind: Option<JobKind>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DeadLetter>> {
        let mut all: Vec<DeadLetter> = lock(&self.rows)
            .values()
            .filter(|row| {
                status.map(|s| row.status.as_str() == s).unwrap_or(true)
                    && job_kind.map(|k| row.job_kind == k).unwrap_or(true)
            })
            .cloned()
            .collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn stats(&self) -> Result<DeadLetterStats> {
        let rows = lock(&self.rows);
        let mut stats = DeadLetterStats::default();
        for row in rows.values() {
            match row.status {
                DeadLetterStatus::Pending => stats.pending += 1,
                DeadLetterStatus::Retrying => stats.retrying += 1,
                DeadLetterStatus::Resolved => stats.resolved += 1,
                DeadLetterStatus::Abandoned => stats.abandoned += 1,
            }
        }
        Ok(stats)
    }
}

impl MemoryDeadLetterRepository {
    fn close(
        &self,
        id: Uuid,
        status: DeadLetterStatus,
        actor: &str,
        note: Option<&str>,
    ) -> Result<()> {
        let mut rows = lock(&self.rows);
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("dead letter {id}")))?;
        if row.status.is_terminal() {
            return Err(Error::NotFound(format!("open dead letter {id}")));
        }
        row.status = status;
        row.resolved_by = Some(actor.to_string());
        row.resolution_note = note.map(String::from);
        row.next_retry_at = None;
        row.updated_at = Utc::now();
        Ok(())
    }
}

// =============================================================================
// QUARANTINE
// =============================================================================

/// In-memory [`QuarantineRepository`].
#[derive(Default)]
pub struct MemoryQuarantineRepository {
    rows: Mutex<HashMap<Uuid, QuarantineEntry>>,
}

impl MemoryQuarantineRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: all entries, unfiltered.
    pub fn all(&self) -> Vec<QuarantineEntry> {
        lock(&self.rows).values().cloned().collect()
    }
}

#[async_trait]
impl QuarantineRepository for MemoryQuarantineRepository {
    async fn push_deduplicated(&self, entry: NewQuarantineEntry) -> Result<Option<Uuid>> {
        let fingerprint = payload_fingerprint(&entry.payload);
        let mut rows = lock(&self.rows);

        if rows
            .values()
            .any(|row| !row.resolved && row.fingerprint == fingerprint)
        {
            return Ok(None);
        }

        let id = new_v7();
        rows.insert(
            id,
            QuarantineEntry {
                id,
                entity_type: entry.entity_type,
                entity_ref: entry.entity_ref,
                reason: entry.reason,
                payload: entry.payload,
                competing_values: entry.competing_values,
                duplicate_candidates: entry.duplicate_candidates,
                fingerprint,
                resolved: false,
                action: None,
                notes: None,
                resolved_by: None,
                created_at: Utc::now(),
                resolved_at: None,
            },
        );
        Ok(Some(id))
    }

    async fn resolve(
        &self,
        id: Uuid,
        action: ResolutionAction,
        actor: &str,
        notes: Option<&str>,
    ) -> Result<bool> {
        let mut rows = lock(&self.rows);
        match rows.get_mut(&id) {
            Some(row) if !row.resolved => {
                row.resolved = true;
                row.action = Some(action);
                row.resolved_by = Some(actor.to_string());
                row.notes = notes.map(String::from);
                row.resolved_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_pending(&self, limit: i64, offset: i64) -> Result<Vec<QuarantineEntry>> {
        let mut pending: Vec<QuarantineEntry> = lock(&self.rows)
            .values()
            .filter(|row| !row.resolved)
            .cloned()
            .collect();
        pending.sort_by_key(|row| row.created_at);
        Ok(pending
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn get(&self, id: Uuid) -> Result<Option<QuarantineEntry>> {
        Ok(lock(&self.rows).get(&id).cloned())
    }

    async fn pending_count(&self) -> Result<i64> {
        Ok(lock(&self.rows).values().filter(|row| !row.resolved).count() as i64)
    }
}

// =============================================================================
// PROVENANCE
// =============================================================================

type ProvenanceKey = (String, String, String);

/// In-memory [`ProvenanceRepository`].
#[derive(Default)]
pub struct MemoryProvenanceRepository {
    rows: Mutex<HashMap<ProvenanceKey, FieldProvenance>>,
}

impl MemoryProvenanceRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProvenanceRepository for MemoryProvenanceRepository {
    async fn upsert(&self, write: &FieldWrite) -> Result<bool> {
        let key = (
            write.entity_type.clone(),
            write.entity_id.clone(),
            write.field_name.clone(),
        );
        let now = Utc::now();
        let mut rows = lock(&self.rows);

        match rows.get_mut(&key) {
            Some(row) if row.locked => Ok(false),
            Some(row) => {
                row.source_name = write.source_name.clone();
                row.source_record_id = write.source_record_id.clone();
                row.source_url = write.source_url.clone();
                row.confidence = write.confidence;
                row.trust_weight = write.trust_weight;
                row.license = write.license.clone();
                row.fetched_at = now;
                row.updated_at = now;
                Ok(true)
            }
            None => {
                rows.insert(
                    key,
                    FieldProvenance {
                        id: new_v7(),
                        entity_type: write.entity_type.clone(),
                        entity_id: write.entity_id.clone(),
                        field_name: write.field_name.clone(),
                        source_name: write.source_name.clone(),
                        source_record_id: write.source_record_id.clone(),
                        source_url: write.source_url.clone(),
                        confidence: write.confidence,
                        trust_weight: write.trust_weight,
                        license: write.license.clone(),
                        locked: false,
                        locked_by: None,
                        lock_reason: None,
                        fetched_at: now,
                        updated_at: now,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn get(
        &self,
        entity_type: &str,
        entity_id: &str,
        field_name: &str,
    ) -> Result<Option<FieldProvenance>> {
        let key = (
            entity_type.to_string(),
            entity_id.to_string(),
            field_name.to_string(),
        );
        Ok(lock(&self.rows).get(&key).cloned())
    }

    async fn for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<FieldProvenance>> {
        let mut all: Vec<FieldProvenance> = lock(&self.rows)
            .values()
            .filter(|row| row.entity_type == entity_type && row.entity_id == entity_id)
            .cloned()
            .collect();
        all.sort_by(|a, b| a.field_name.cmp(&b.field_name));
        Ok(all)
    }

    async fn by_source(&self, source_name: &str, limit: i64) -> Result<Vec<FieldProvenance>> {
        let mut all: Vec<FieldProvenance> = lock(&self.rows)
            .values()
            .filter(|row| row.source_name == source_name)
            .cloned()
            .collect();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        all.truncate(limit.max(0) as usize);
        Ok(all)
    }

    async fn lock(
        &self,
        entity_type: &str,
        entity_id: &str,
        field_name: &str,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<()> {
        let key = (
            entity_type.to_string(),
            entity_id.to_string(),
            field_name.to_string(),
        );
        let mut rows = lock(&self.rows);
        let row = rows.get_mut(&key).ok_or_else(|| {
            Error::NotFound(format!("provenance {entity_type}/{entity_id}/{field_name}"))
        })?;
        row.locked = true;
        row.locked_by = Some(actor.to_string());
        row.lock_reason = reason.map(String::from);
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn unlock(&self, entity_type: &str, entity_id: &str, field_name: &str) -> Result<()> {
        let key = (
            entity_type.to_string(),
            entity_id.to_string(),
            field_name.to_string(),
        );
        let mut rows = lock(&self.rows);
        let row = rows.get_mut(&key).ok_or_else(|| {
            Error::NotFound(format!("provenance {entity_type}/{entity_id}/{field_name}"))
        })?;
        row.locked = false;
        row.locked_by = None;
        row.lock_reason = None;
        row.updated_at = Utc::now();
        Ok(())
    }
}

// =============================================================================
// AUDIT
// =============================================================================

/// In-memory [`AuditRepository`] with failure injection, for verifying
/// that audit writes stay best-effort.
#[derive(Default)]
pub struct MemoryAuditRepository {
    events: Mutex<Vec<AuditEvent>>,
    fail_appends: AtomicBool,
}

impl MemoryAuditRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent append fail.
    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Test helper: all recorded events.
    pub fn all(&self) -> Vec<AuditEvent> {
        lock(&self.events).clone()
    }
}

#[async_trait]
impl AuditRepository for MemoryAuditRepository {
    async fn append(&self, kind: AuditEventKind, job_name: &str, detail: JsonValue) -> Result<()> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(Error::Internal("audit store unavailable".to_string()));
        }
        lock(&self.events).push(AuditEvent {
            id: new_v7(),
            kind,
            job_name: job_name.to_string(),
            detail,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn list(
        &self,
        kind: Option<AuditEventKind>,
        job_name: Option<&str>,
        limit: i64,
    ) -> Result<Vec<AuditEvent>> {
        let mut all: Vec<AuditEvent> = lock(&self.events)
            .iter()
            .filter(|event| {
                kind.map(|k| event.kind == k).unwrap_or(true)
                    && job_name.map(|name| event.job_name == name).unwrap_or(true)
            })
            .cloned()
            .collect();
        all.reverse();
        all.truncate(limit.max(0) as usize);
        Ok(all)
    }
}

// =============================================================================
// RETENTION
// =============================================================================

/// In-memory [`RetentionRepository`] tracking policies and proofs only;
/// the "tables" are counters of expired rows set by tests.
#[derive(Default)]
pub struct MemoryRetentionRepository {
    policies: Mutex<HashMap<String, i32>>,
    expired: Mutex<HashMap<String, i64>>,
    proofs: Mutex<Vec<PurgeProof>>,
}

impl MemoryRetentionRepository {
    pub fn new() -> Self {
        let repo = Self::default();
        {
            let mut policies = lock(&repo.policies);
            policies.insert(
                "ingest_batch_metric".to_string(),
                defaults::RETENTION_BATCH_METRIC_DAYS,
            );
            policies.insert("ingest_audit".to_string(), defaults::RETENTION_AUDIT_DAYS);
            policies.insert(
                "dead_letter".to_string(),
                defaults::RETENTION_DEAD_LETTER_DAYS,
            );
        }
        repo
    }

    /// Test helper: pretend `count` rows of a table are past retention.
    pub fn set_expired(&self, table_name: &str, count: i64) {
        lock(&self.expired).insert(table_name.to_string(), count);
    }
}

#[async_trait]
impl RetentionRepository for MemoryRetentionRepository {
    async fn policies(&self) -> Result<Vec<RetentionPolicy>> {
        let mut all: Vec<RetentionPolicy> = lock(&self.policies)
            .iter()
            .map(|(table_name, days)| RetentionPolicy {
                table_name: table_name.clone(),
                days_to_keep: *days,
            })
            .collect();
        all.sort_by(|a, b| a.table_name.cmp(&b.table_name));
        Ok(all)
    }

    async fn set_policy(&self, table_name: &str, days_to_keep: i32) -> Result<()> {
        if days_to_keep < 1 {
            return Err(Error::InvalidInput(
                "days_to_keep must be at least 1".to_string(),
            ));
        }
        lock(&self.policies).insert(table_name.to_string(), days_to_keep);
        Ok(())
    }

    async fn purge(&self, table_name: &str, operator: &str) -> Result<Option<PurgeProof>> {
        let days = *lock(&self.policies)
            .get(table_name)
            .ok_or_else(|| Error::NotFound(format!("retention policy for {table_name}")))?;

        let purged = lock(&self.expired).remove(table_name).unwrap_or(0);
        if purged == 0 {
            return Ok(None);
        }

        let proof = PurgeProof {
            id: new_v7(),
            table_name: table_name.to_string(),
            records_purged: purged,
            cutoff: Utc::now() - chrono::Duration::days(i64::from(days)),
            operator: operator.to_string(),
            created_at: Utc::now(),
        };
        lock(&self.proofs).push(proof.clone());
        Ok(Some(proof))
    }

    async fn proofs(&self, table_name: Option<&str>, limit: i64) -> Result<Vec<PurgeProof>> {
        let mut all: Vec<PurgeProof> = lock(&self.proofs)
            .iter()
            .filter(|proof| table_name.map(|t| proof.table_name == t).unwrap_or(true))
            .cloned()
            .collect();
        all.reverse();
        all.truncate(limit.max(0) as usize);
        Ok(all)
    }
}

// =============================================================================
// ENTITY STORE & SOURCE ADAPTER
// =============================================================================

type EntityKey = (String, String);

/// In-memory [`EntityStore`] with failure injection.
#[derive(Default)]
pub struct MemoryEntityStore {
    entities: Mutex<HashMap<EntityKey, HashMap<String, JsonValue>>>,
    fail_upserts: AtomicU32,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` upserts.
    pub fn fail_next_upserts(&self, n: u32) {
        self.fail_upserts.store(n, Ordering::SeqCst);
    }

    /// Test helper: current fields of an entity.
    pub fn entity(&self, entity_type: &str, entity_ref: &str) -> Option<HashMap<String, JsonValue>> {
        lock(&self.entities)
            .get(&(entity_type.to_string(), entity_ref.to_string()))
            .cloned()
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn upsert(
        &self,
        entity_type: &str,
        entity_ref: &str,
        fields: &HashMap<String, JsonValue>,
    ) -> Result<()> {
        let remaining = self.fail_upserts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_upserts.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Source("injected entity store failure".to_string()));
        }

        let mut entities = lock(&self.entities);
        entities
            .entry((entity_type.to_string(), entity_ref.to_string()))
            .or_default()
            .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }
}

/// Scripted [`SourceAdapter`]: serves fixed pages, supports failure
/// injection and call counting so breaker behavior can be asserted.
pub struct StaticSourceAdapter {
    meta: SourceMeta,
    pages: Vec<Vec<JsonValue>>,
    fail_fetches: AtomicU32,
    fetch_calls: AtomicU32,
}

impl StaticSourceAdapter {
    pub fn new(name: &str, trust_weight: f32, pages: Vec<Vec<JsonValue>>) -> Self {
        Self {
            meta: SourceMeta::new(name, trust_weight),
            pages,
            fail_fetches: AtomicU32::new(0),
            fetch_calls: AtomicU32::new(0),
        }
    }

    /// Fail the next `n` `fetch_page` calls.
    pub fn fail_next_fetches(&self, n: u32) {
        self.fail_fetches.store(n, Ordering::SeqCst);
    }

    /// Number of `fetch_page` calls made so far.
    pub fn fetch_calls(&self) -> u32 {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceAdapter for StaticSourceAdapter {
    fn meta(&self) -> &SourceMeta {
        &self.meta
    }

    async fn fetch_page(&self, cursor: &CursorState) -> Result<SourcePage> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);

        let remaining = self.fail_fetches.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_fetches.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Source("injected fetch failure".to_string()));
        }

        let index = match cursor {
            CursorState::Start => 0,
            CursorState::Page { page, .. } => *page as usize,
            other => {
                return Err(Error::InvalidInput(format!(
                    "unsupported cursor for static source: {other:?}"
                )))
            }
        };

        let records = self.pages.get(index).cloned().unwrap_or_default();
        Ok(SourcePage {
            next_cursor: CursorState::Page {
                page: (index + 1) as u32,
                page_size: records.len() as u32,
            },
            has_more: index + 1 < self.pages.len(),
            records,
        })
    }

    async fn fetch_by_id(&self, entity_ref: &str) -> Result<Option<JsonValue>> {
        Ok(self
            .pages
            .iter()
            .flatten()
            .find(|record| {
                record.get("entity_ref").and_then(JsonValue::as_str) == Some(entity_ref)
            })
            .cloned())
    }

    fn normalize(&self, record: &JsonValue) -> Result<NormalizedRecord> {
        let entity_ref = record
            .get("entity_ref")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| Error::Validation("record missing entity_ref".to_string()))?;
        let entity_type = record
            .get("entity_type")
            .and_then(JsonValue::as_str)
            .unwrap_or("edition");
        let raw_fields = record
            .get("fields")
            .and_then(JsonValue::as_object)
            .ok_or_else(|| Error::Validation("record missing fields".to_string()))?;

        let mut fields = HashMap::new();
        for (name, body) in raw_fields {
            let value = body
                .get("value")
                .cloned()
                .ok_or_else(|| Error::Validation(format!("field {name} missing value")))?;
            let confidence = body
                .get("confidence")
                .and_then(JsonValue::as_f64)
                .unwrap_or(1.0) as f32;
            fields.insert(name.clone(), FieldValue::new(value, confidence));
        }

        let duplicate_candidates = record
            .get("duplicates")
            .and_then(|d| serde_json::from_value(d.clone()).ok())
            .unwrap_or_default();

        Ok(NormalizedRecord {
            entity_type: entity_type.to_string(),
            entity_ref: entity_ref.to_string(),
            fields,
            duplicate_candidates,
        })
    }
}

/// Build a raw record in the shape [`StaticSourceAdapter::normalize`]
/// expects.
pub fn source_record(entity_ref: &str, fields: &[(&str, JsonValue, f64)]) -> JsonValue {
    let mut body = serde_json::Map::new();
    for (name, value, confidence) in fields {
        body.insert(
            (*name).to_string(),
            json!({"value": value, "confidence": confidence}),
        );
    }
    json!({"entity_type": "edition", "entity_ref": entity_ref, "fields": body})
}

// =============================================================================
// BUNDLE
// =============================================================================

/// All in-memory repositories, kept concrete for inspection, plus a
/// [`StoreHandles`] view for the orchestration components.
#[derive(Clone)]
pub struct MemoryStores {
    pub checkpoints: Arc<MemoryCheckpointRepository>,
    pub batches: Arc<MemoryBatchMetricsRepository>,
    pub dead_letters: Arc<MemoryDeadLetterRepository>,
    pub quarantine: Arc<MemoryQuarantineRepository>,
    pub provenance: Arc<MemoryProvenanceRepository>,
    pub audit: Arc<MemoryAuditRepository>,
    pub retention: Arc<MemoryRetentionRepository>,
}

impl Default for MemoryStores {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStores {
    pub fn new() -> Self {
        Self {
            checkpoints: Arc::new(MemoryCheckpointRepository::new()),
            batches: Arc::new(MemoryBatchMetricsRepository::new()),
            dead_letters: Arc::new(MemoryDeadLetterRepository::new()),
            quarantine: Arc::new(MemoryQuarantineRepository::new()),
            provenance: Arc::new(MemoryProvenanceRepository::new()),
            audit: Arc::new(MemoryAuditRepository::new()),
            retention: Arc::new(MemoryRetentionRepository::new()),
        }
    }

    /// Trait-object view for the runner, detector and schedulers.
    pub fn handles(&self) -> StoreHandles {
        StoreHandles {
            checkpoints: self.checkpoints.clone(),
            batches: self.batches.clone(),
            dead_letters: self.dead_letters.clone(),
            quarantine: self.quarantine.clone(),
            provenance: self.provenance.clone(),
            audit: self.audit.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_acquire_is_mutually_exclusive() {
        let repo = MemoryCheckpointRepository::new();
        let stale = Duration::from_secs(3600);

        repo.acquire("pricing_sync_main", JobKind::PricingSync, stale)
            .await
            .unwrap();
        let second = repo
            .acquire("pricing_sync_main", JobKind::PricingSync, stale)
            .await;
        assert!(matches!(second, Err(Error::AlreadyRunning(_))));

        repo.release("pricing_sync_main").await.unwrap();
        assert!(repo
            .acquire("pricing_sync_main", JobKind::PricingSync, stale)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_memory_heal_only_clears_held_lease() {
        let repo = MemoryCheckpointRepository::new();
        repo.acquire("lore_sync_main", JobKind::LoreSync, Duration::from_secs(3600))
            .await
            .unwrap();

        assert!(repo.heal("lore_sync_main").await.unwrap());
        assert!(!repo.heal("lore_sync_main").await.unwrap());
        assert!(!repo.heal("never_ran").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_batch_reopen_accumulates_heal_attempts() {
        let repo = MemoryBatchMetricsRepository::new();
        let id = repo.open(JobKind::PricingSync, 10).await.unwrap();

        assert_eq!(repo.mark_self_healed(id).await.unwrap(), 1);
        let reopened = repo.open(JobKind::PricingSync, 10).await.unwrap();
        assert_eq!(reopened, id, "resumed run reopens the healed batch");

        assert_eq!(repo.mark_self_healed(id).await.unwrap(), 2);
        assert_eq!(repo.mark_self_healed(id).await.unwrap(), 3);

        // At the cap the batch is no longer reopened.
        let fresh = repo.open(JobKind::PricingSync, 10).await.unwrap();
        assert_ne!(fresh, id);
    }

    #[tokio::test]
    async fn test_memory_p95_needs_min_samples() {
        let repo = MemoryBatchMetricsRepository::new();
        for i in 1..=9 {
            repo.seed_completed(JobKind::LoreSync, Duration::from_secs(i * 10));
        }
        assert!(repo
            .duration_p95_secs(JobKind::LoreSync, 10)
            .await
            .unwrap()
            .is_none());

        repo.seed_completed(JobKind::LoreSync, Duration::from_secs(100));
        let p95 = repo
            .duration_p95_secs(JobKind::LoreSync, 10)
            .await
            .unwrap()
            .unwrap();
        assert!(p95 >= 90.0, "p95 of 10..=100s should be near the top: {p95}");
    }

    #[tokio::test]
    async fn test_static_adapter_pagination() {
        let adapter = StaticSourceAdapter::new(
            "bibliodata",
            0.9,
            vec![
                vec![source_record("isbn:1", &[("title", json!("A"), 0.9)])],
                vec![source_record("isbn:2", &[("title", json!("B"), 0.9)])],
            ],
        );

        let first = adapter.fetch_page(&CursorState::Start).await.unwrap();
        assert_eq!(first.records.len(), 1);
        assert!(first.has_more);

        let second = adapter.fetch_page(&first.next_cursor).await.unwrap();
        assert_eq!(second.records.len(), 1);
        assert!(!second.has_more);
        assert_eq!(adapter.fetch_calls(), 2);
    }

    #[tokio::test]
    async fn test_static_adapter_normalize_rejects_malformed() {
        let adapter = StaticSourceAdapter::new("bibliodata", 0.9, vec![]);
        let bad = json!({"fields": {"title": {"value": "x"}}});
        assert!(matches!(
            adapter.normalize(&bad),
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_retention_purge_semantics() {
        let repo = MemoryRetentionRepository::new();
        repo.set_expired("ingest_audit", 5);

        let proof = repo.purge("ingest_audit", "op").await.unwrap().unwrap();
        assert_eq!(proof.records_purged, 5);

        assert!(repo.purge("ingest_audit", "op").await.unwrap().is_none());
        assert_eq!(repo.proofs(None, 10).await.unwrap().len(), 1);
    }
}
