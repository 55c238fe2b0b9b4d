//! Typed resumption cursors.
//!
//! The checkpoint row stores the cursor as an opaque JSON blob so the
//! storage layer never needs a schema change when a job kind evolves.
//! Business logic never touches the blob: it is decoded into a
//! `CursorState` immediately after load and re-encoded on save.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Resumable position of a job, one variant per cursor shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CursorState {
    /// No progress yet; start from the beginning of the source.
    Start,
    /// Sources paginated by a monotonically increasing record id.
    IdOffset { last_id: i64 },
    /// Sources paginated by page number.
    Page { page: u32, page_size: u32 },
    /// Sources that hand back an opaque continuation token.
    Token { token: String },
    /// Sources walked segment-by-segment (e.g. one wiki category at a
    /// time) with a position inside the current segment.
    Segmented { segment: String, position: i64 },
}

impl Default for CursorState {
    fn default() -> Self {
        CursorState::Start
    }
}

impl CursorState {
    /// Encode for the storage boundary.
    pub fn to_json(&self) -> JsonValue {
        // Serialization of a tagged unit/struct enum cannot fail.
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }

    /// Decode from the storage boundary.
    ///
    /// Returns `None` for an unrecognized or corrupt blob; callers fall
    /// back to `Start`, which is safe because downstream writes are
    /// idempotent upserts.
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    pub fn is_start(&self) -> bool {
        matches!(self, CursorState::Start)
    }
}
