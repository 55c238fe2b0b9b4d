//! Persisted and admin-facing data models for the ingestion engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::breaker::BreakerState;
use crate::cursor::CursorState;

// =============================================================================
// JOB KINDS & CONTROL
// =============================================================================

/// Pipeline kind of an ingestion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Market pricing sweep across listed inventory.
    PricingSync,
    /// Bibliographic metadata import (editions, authors, identifiers).
    BiblioImport,
    /// Character/lore enrichment from wiki sources.
    LoreSync,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::PricingSync => "pricing_sync",
            JobKind::BiblioImport => "biblio_import",
            JobKind::LoreSync => "lore_sync",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pricing_sync" => Some(JobKind::PricingSync),
            "biblio_import" => Some(JobKind::BiblioImport),
            "lore_sync" => Some(JobKind::LoreSync),
            _ => None,
        }
    }

    pub fn all() -> [JobKind; 3] {
        [JobKind::PricingSync, JobKind::BiblioImport, JobKind::LoreSync]
    }
}

/// Admin control signal on a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ControlSignal {
    /// Normal operation.
    Run,
    /// Stop cleanly at the next checkpoint boundary, preserving the cursor.
    Pause,
    /// Clear the lease immediately; the next scheduled invocation
    /// resumes from the persisted cursor.
    Stop,
}

impl ControlSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlSignal::Run => "run",
            ControlSignal::Pause => "pause",
            ControlSignal::Stop => "stop",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "run" => Some(ControlSignal::Run),
            "pause" => Some(ControlSignal::Pause),
            "stop" => Some(ControlSignal::Stop),
            _ => None,
        }
    }
}

// =============================================================================
// CHECKPOINT
// =============================================================================

/// Progress counters carried on a checkpoint. Absolute values, not
/// deltas, so a replayed heartbeat after resumption is idempotent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ProgressCounters {
    pub processed: i64,
    pub updated: i64,
    pub errors: i64,
}

/// Resumable state for one named job. One row per job name; never
/// deleted, only reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_name: String,
    pub job_kind: JobKind,
    /// Opaque cursor blob at the storage boundary; decode with
    /// [`Checkpoint::cursor_state`].
    pub cursor: JsonValue,
    pub counters: ProgressCounters,
    pub is_running: bool,
    pub lease_acquired_at: Option<DateTime<Utc>>,
    pub control_signal: ControlSignal,
    pub paused_at: Option<DateTime<Utc>>,
    /// Embedded circuit-breaker snapshot; `None` before the first call.
    pub breaker: Option<BreakerState>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Decode the opaque cursor blob into its typed form, falling back
    /// to `Start` (with a warning) on a corrupt blob — safe because
    /// downstream writes are idempotent upserts.
    pub fn cursor_state(&self) -> CursorState {
        CursorState::from_json(&self.cursor).unwrap_or_else(|| {
            tracing::warn!(
                job_name = %self.job_name,
                "corrupt cursor blob, restarting from the beginning"
            );
            CursorState::Start
        })
    }
}

// =============================================================================
// BATCH METRICS
// =============================================================================

/// Status of a batch execution instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Running,
    Completed,
    Stalled,
    SelfHealed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Stalled => "stalled",
            BatchStatus::SelfHealed => "self_healed",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(BatchStatus::Running),
            "completed" => Some(BatchStatus::Completed),
            "stalled" => Some(BatchStatus::Stalled),
            "self_healed" => Some(BatchStatus::SelfHealed),
            "failed" => Some(BatchStatus::Failed),
            _ => None,
        }
    }

    /// Terminal statuses are eligible for retention purges.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }
}

/// One row per execution instance (batch) of a pipeline kind.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct BatchMetric {
    pub id: Uuid,
    pub pipeline_kind: JobKind,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub records_in_batch: i32,
    pub records_processed: i32,
    pub status: BatchStatus,
    /// Times this batch has been self-healed; bounded by
    /// [`crate::defaults::MAX_SELF_HEAL_ATTEMPTS`].
    pub heal_attempts: i32,
}

// =============================================================================
// DEAD LETTER QUEUE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterStatus {
    Pending,
    Retrying,
    Resolved,
    Abandoned,
}

impl DeadLetterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterStatus::Pending => "pending",
            DeadLetterStatus::Retrying => "retrying",
            DeadLetterStatus::Resolved => "resolved",
            DeadLetterStatus::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeadLetterStatus::Pending),
            "retrying" => Some(DeadLetterStatus::Retrying),
            "resolved" => Some(DeadLetterStatus::Resolved),
            "abandoned" => Some(DeadLetterStatus::Abandoned),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeadLetterStatus::Resolved | DeadLetterStatus::Abandoned)
    }
}

/// One failed unit of work, captured without aborting its batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub job_kind: JobKind,
    pub batch_id: Option<Uuid>,
    pub entity_ref: String,
    pub error_type: String,
    pub error_message: String,
    pub error_trace: Option<String>,
    /// Sanitized request context for diagnosis.
    pub request_snapshot: Option<JsonValue>,
    /// Sanitized response context for diagnosis.
    pub response_snapshot: Option<JsonValue>,
    /// Content fingerprint of the failed payload.
    pub fingerprint: String,
    pub status: DeadLetterStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolution_note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload for a new dead letter.
#[derive(Debug, Clone)]
pub struct NewDeadLetter {
    pub job_kind: JobKind,
    pub batch_id: Option<Uuid>,
    pub entity_ref: String,
    pub error_type: String,
    pub error_message: String,
    pub error_trace: Option<String>,
    pub request_snapshot: Option<JsonValue>,
    pub response_snapshot: Option<JsonValue>,
    pub max_retries: i32,
}

/// DLQ counters for the admin surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize, utoipa::ToSchema)]
pub struct DeadLetterStats {
    pub pending: i64,
    pub retrying: i64,
    pub resolved: i64,
    pub abandoned: i64,
}

// =============================================================================
// QUARANTINE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineReason {
    LowConfidence,
    FuzzyMatch,
    Conflict,
    ValidationFail,
    ManualFlag,
    Outlier,
}

impl QuarantineReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuarantineReason::LowConfidence => "low_confidence",
            QuarantineReason::FuzzyMatch => "fuzzy_match",
            QuarantineReason::Conflict => "conflict",
            QuarantineReason::ValidationFail => "validation_fail",
            QuarantineReason::ManualFlag => "manual_flag",
            QuarantineReason::Outlier => "outlier",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low_confidence" => Some(QuarantineReason::LowConfidence),
            "fuzzy_match" => Some(QuarantineReason::FuzzyMatch),
            "conflict" => Some(QuarantineReason::Conflict),
            "validation_fail" => Some(QuarantineReason::ValidationFail),
            "manual_flag" => Some(QuarantineReason::ManualFlag),
            "outlier" => Some(QuarantineReason::Outlier),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    Accept,
    Reject,
    Merge,
    ManualEdit,
}

impl ResolutionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionAction::Accept => "accept",
            ResolutionAction::Reject => "reject",
            ResolutionAction::Merge => "merge",
            ResolutionAction::ManualEdit => "manual_edit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "accept" => Some(ResolutionAction::Accept),
            "reject" => Some(ResolutionAction::Reject),
            "merge" => Some(ResolutionAction::Merge),
            "manual_edit" => Some(ResolutionAction::ManualEdit),
            _ => None,
        }
    }
}

/// A record that could not be merged automatically, held for review.
/// Never silently discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineEntry {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_ref: String,
    pub reason: QuarantineReason,
    /// Full candidate payload as normalized from the source.
    pub payload: JsonValue,
    /// Competing per-source values, populated for conflicts.
    pub competing_values: Option<JsonValue>,
    /// Candidate duplicate ids with match scores, populated for fuzzy matches.
    pub duplicate_candidates: Option<JsonValue>,
    pub fingerprint: String,
    pub resolved: bool,
    pub action: Option<ResolutionAction>,
    pub notes: Option<String>,
    pub resolved_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Insert payload for a new quarantine entry.
#[derive(Debug, Clone)]
pub struct NewQuarantineEntry {
    pub entity_type: String,
    pub entity_ref: String,
    pub reason: QuarantineReason,
    pub payload: JsonValue,
    pub competing_values: Option<JsonValue>,
    pub duplicate_candidates: Option<JsonValue>,
}

// =============================================================================
// FIELD PROVENANCE
// =============================================================================

/// Which source last wrote a field, with what confidence, and whether it
/// is locked against further automated writes. Unique per
/// (entity type, entity id, field name).
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct FieldProvenance {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: String,
    pub field_name: String,
    pub source_name: String,
    pub source_record_id: Option<String>,
    pub source_url: Option<String>,
    pub confidence: f32,
    pub trust_weight: f32,
    pub license: Option<String>,
    pub locked: bool,
    pub locked_by: Option<String>,
    pub lock_reason: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FieldProvenance {
    /// Effective score used by merge policy: confidence scaled by the
    /// trust we place in the source.
    pub fn effective_score(&self) -> f32 {
        self.confidence * self.trust_weight
    }
}

/// Write payload for a provenance upsert.
#[derive(Debug, Clone)]
pub struct FieldWrite {
    pub entity_type: String,
    pub entity_id: String,
    pub field_name: String,
    pub source_name: String,
    pub source_record_id: Option<String>,
    pub source_url: Option<String>,
    pub confidence: f32,
    pub trust_weight: f32,
    pub license: Option<String>,
}

// =============================================================================
// RETENTION
// =============================================================================

/// Fixed days-to-keep for one telemetry table.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct RetentionPolicy {
    pub table_name: String,
    pub days_to_keep: i32,
}

/// Immutable proof that a retention deletion occurred.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct PurgeProof {
    pub id: Uuid,
    pub table_name: String,
    pub records_purged: i64,
    pub cutoff: DateTime<Utc>,
    pub operator: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// OPERATIONAL AUDIT
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    BreakerTransition,
    SelfHeal,
    ControlChange,
}

impl AuditEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventKind::BreakerTransition => "breaker_transition",
            AuditEventKind::SelfHeal => "self_heal",
            AuditEventKind::ControlChange => "control_change",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "breaker_transition" => Some(AuditEventKind::BreakerTransition),
            "self_heal" => Some(AuditEventKind::SelfHeal),
            "control_change" => Some(AuditEventKind::ControlChange),
            _ => None,
        }
    }
}

/// Append-only operational audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub kind: AuditEventKind,
    pub job_name: String,
    pub detail: JsonValue,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// STALL SWEEP REPORTING
// =============================================================================

/// Result of one stall-detector sweep, for logging and tests.
#[derive(Debug, Clone, Default, Serialize, Deserialize, utoipa::ToSchema)]
pub struct StallSweepReport {
    /// Running batches examined.
    pub checked: usize,
    /// Batches whose heartbeat age exceeded their threshold.
    pub stalled: usize,
    /// Batches actually healed (lease cleared).
    pub healed: usize,
    /// Batches past the heal-attempt cap, left hard-failed.
    pub exhausted: usize,
    /// Stalled batches skipped because their job resumed between the
    /// stall check and the heal.
    pub resumed: usize,
}

/// Compute a content fingerprint for payload dedup (quarantine, DLQ).
pub fn payload_fingerprint(payload: &JsonValue) -> String {
    use sha2::{Digest, Sha256};
    let canonical = serde_json::to_string(payload).unwrap_or_default();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_kind_round_trip() {
        for kind in JobKind::all() {
            assert_eq!(JobKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(JobKind::parse("grade_estimation"), None);
    }

    #[test]
    fn test_job_kind_strings_are_unique() {
        let mut strings: Vec<&str> = JobKind::all().iter().map(|k| k.as_str()).collect();
        strings.sort();
        strings.dedup();
        assert_eq!(strings.len(), JobKind::all().len());
    }

    #[test]
    fn test_control_signal_round_trip() {
        for signal in [ControlSignal::Run, ControlSignal::Pause, ControlSignal::Stop] {
            assert_eq!(ControlSignal::parse(signal.as_str()), Some(signal));
        }
        assert_eq!(ControlSignal::parse("halt"), None);
    }

    #[test]
    fn test_batch_status_round_trip() {
        for status in [
            BatchStatus::Running,
            BatchStatus::Completed,
            BatchStatus::Stalled,
            BatchStatus::SelfHealed,
            BatchStatus::Failed,
        ] {
            assert_eq!(BatchStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(BatchStatus::parse(""), None);
    }

    #[test]
    fn test_batch_status_terminal() {
        assert!(BatchStatus::Completed.is_terminal());
        assert!(BatchStatus::Failed.is_terminal());
        assert!(!BatchStatus::Running.is_terminal());
        assert!(!BatchStatus::SelfHealed.is_terminal());
    }

    #[test]
    fn test_dead_letter_status_round_trip() {
        for status in [
            DeadLetterStatus::Pending,
            DeadLetterStatus::Retrying,
            DeadLetterStatus::Resolved,
            DeadLetterStatus::Abandoned,
        ] {
            assert_eq!(DeadLetterStatus::parse(status.as_str()), Some(status));
        }
        assert!(DeadLetterStatus::Resolved.is_terminal());
        assert!(DeadLetterStatus::Abandoned.is_terminal());
        assert!(!DeadLetterStatus::Pending.is_terminal());
        assert!(!DeadLetterStatus::Retrying.is_terminal());
    }

    #[test]
    fn test_quarantine_reason_round_trip() {
        for reason in [
            QuarantineReason::LowConfidence,
            QuarantineReason::FuzzyMatch,
            QuarantineReason::Conflict,
            QuarantineReason::ValidationFail,
            QuarantineReason::ManualFlag,
            QuarantineReason::Outlier,
        ] {
            assert_eq!(QuarantineReason::parse(reason.as_str()), Some(reason));
        }
    }

    #[test]
    fn test_resolution_action_round_trip() {
        for action in [
            ResolutionAction::Accept,
            ResolutionAction::Reject,
            ResolutionAction::Merge,
            ResolutionAction::ManualEdit,
        ] {
            assert_eq!(ResolutionAction::parse(action.as_str()), Some(action));
        }
    }

    #[test]
    fn test_audit_kind_round_trip() {
        for kind in [
            AuditEventKind::BreakerTransition,
            AuditEventKind::SelfHeal,
            AuditEventKind::ControlChange,
        ] {
            assert_eq!(AuditEventKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_checkpoint_cursor_state_fallback() {
        let checkpoint = Checkpoint {
            job_name: "pricing_sync_main".to_string(),
            job_kind: JobKind::PricingSync,
            cursor: json!({"kind": "not_a_cursor"}),
            counters: ProgressCounters::default(),
            is_running: false,
            lease_acquired_at: None,
            control_signal: ControlSignal::Run,
            paused_at: None,
            breaker: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(checkpoint.cursor_state().is_start());
    }

    #[test]
    fn test_effective_score() {
        let row = FieldProvenance {
            id: Uuid::new_v4(),
            entity_type: "edition".to_string(),
            entity_id: "ed-1".to_string(),
            field_name: "market_price".to_string(),
            source_name: "pricewatch".to_string(),
            source_record_id: None,
            source_url: None,
            confidence: 0.8,
            trust_weight: 0.5,
            license: None,
            locked: false,
            locked_by: None,
            lock_reason: None,
            fetched_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!((row.effective_score() - 0.4).abs() < f32::EPSILON);
    }

    #[test]
    fn test_payload_fingerprint_stability() {
        let a = json!({"isbn": "9780345350497", "price": 12.50});
        let b = json!({"isbn": "9780345350497", "price": 12.50});
        let c = json!({"isbn": "9780345350497", "price": 13.00});

        assert_eq!(payload_fingerprint(&a), payload_fingerprint(&b));
        assert_ne!(payload_fingerprint(&a), payload_fingerprint(&c));
        assert_eq!(payload_fingerprint(&a).len(), 64);
    }

    #[test]
    fn test_serialization_uses_snake_case() {
        assert_eq!(
            serde_json::to_value(JobKind::BiblioImport).unwrap(),
            json!("biblio_import")
        );
        assert_eq!(
            serde_json::to_value(BatchStatus::SelfHealed).unwrap(),
            json!("self_healed")
        );
        assert_eq!(
            serde_json::to_value(QuarantineReason::LowConfidence).unwrap(),
            json!("low_confidence")
        );
    }
}
