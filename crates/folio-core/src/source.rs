//! Source adapter and entity store seams.
//!
//! The orchestration core depends only on these interfaces; concrete
//! adapters (pricing APIs, bibliographic catalogs, wiki scrapers) and
//! the shared entity store live outside the core and are wired in
//! through the pipeline registry at startup.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::cursor::CursorState;
use crate::error::Result;

/// Static metadata describing an external source.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct SourceMeta {
    /// Stable source name recorded in provenance rows.
    pub name: String,
    /// How much weight this source's values carry in merge decisions,
    /// in `[0, 1]`.
    pub trust_weight: f32,
    /// License metadata carried into provenance rows.
    pub license: Option<String>,
}

impl SourceMeta {
    pub fn new(name: impl Into<String>, trust_weight: f32) -> Self {
        Self {
            name: name.into(),
            trust_weight: trust_weight.clamp(0.0, 1.0),
            license: None,
        }
    }

    pub fn with_license(mut self, license: impl Into<String>) -> Self {
        self.license = Some(license.into());
        self
    }
}

/// One page of raw records from a source.
#[derive(Debug, Clone)]
pub struct SourcePage {
    pub records: Vec<JsonValue>,
    pub next_cursor: CursorState,
    pub has_more: bool,
}

/// A candidate duplicate surfaced during normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct DuplicateCandidate {
    pub entity_ref: String,
    pub score: f32,
}

/// A field value proposed by a source, with per-field confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub value: JsonValue,
    pub confidence: f32,
}

impl FieldValue {
    pub fn new(value: JsonValue, confidence: f32) -> Self {
        Self {
            value,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// A raw record normalized into canonical fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub entity_type: String,
    pub entity_ref: String,
    pub fields: HashMap<String, FieldValue>,
    #[serde(default)]
    pub duplicate_candidates: Vec<DuplicateCandidate>,
}

impl NormalizedRecord {
    /// Mean per-field confidence; 0.0 for an empty record.
    pub fn overall_confidence(&self) -> f32 {
        if self.fields.is_empty() {
            return 0.0;
        }
        let sum: f32 = self.fields.values().map(|f| f.confidence).sum();
        sum / self.fields.len() as f32
    }
}

/// Interface every source adapter must expose. The core calls these
/// through the circuit breaker and rate limiter; it does not know
/// source-specific protocols.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Source metadata (name, trust weight, license).
    fn meta(&self) -> &SourceMeta;

    /// Fetch one page of raw records at the given cursor.
    async fn fetch_page(&self, cursor: &CursorState) -> Result<SourcePage>;

    /// Fetch one record by its entity reference (DLQ replay path).
    async fn fetch_by_id(&self, entity_ref: &str) -> Result<Option<JsonValue>>;

    /// Normalize a raw record into canonical fields.
    fn normalize(&self, record: &JsonValue) -> Result<NormalizedRecord>;
}

/// Downstream shared entity store. Writes must be idempotent upserts:
/// the checkpoint layer guarantees at-most-one-active-runner, not
/// exactly-once record processing.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn upsert(
        &self,
        entity_type: &str,
        entity_ref: &str,
        fields: &HashMap<String, JsonValue>,
    ) -> Result<()>;
}
