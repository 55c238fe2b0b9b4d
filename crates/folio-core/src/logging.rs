//! Structured logging schema and initialization for folio.
//!
//! All crates use these constants for consistent structured logging
//! fields, so log aggregation tools can query by standardized field
//! names across every subsystem.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events, lease/batch transitions, heal actions |
//! | DEBUG | Decision points, intermediate values, config choices |
//! | TRACE | Per-record iteration, high-volume data |

use tracing_subscriber::EnvFilter;

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "pipeline", "db", "stall", "dlq", "retention"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "runner", "breaker", "limiter", "pool", "sweeper"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "acquire", "fetch_page", "heal", "purge"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Job name being operated on.
pub const JOB_NAME: &str = "job_name";

/// Batch UUID being processed.
pub const BATCH_ID: &str = "batch_id";

/// Pipeline kind of a batch.
pub const PIPELINE_KIND: &str = "pipeline_kind";

/// Entity reference a record resolves to.
pub const ENTITY_REF: &str = "entity_ref";

/// External source name.
pub const SOURCE: &str = "source";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Records processed so far in a batch.
pub const RECORDS_PROCESSED: &str = "records_processed";

/// Heartbeat age at stall-detection time, in seconds.
pub const HEARTBEAT_AGE_SECS: &str = "heartbeat_age_secs";

/// Stall threshold in effect, in seconds.
pub const THRESHOLD_SECS: &str = "threshold_secs";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";

/// Initialize tracing with the `FOLIO_LOG`/`RUST_LOG` environment filter.
///
/// Falls back to `info` when neither variable is set. Safe to call once
/// per process; subsequent calls are ignored.
pub fn init() {
    init_with_filter(
        std::env::var("FOLIO_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| "info".to_string()),
    );
}

/// Initialize tracing with an explicit filter directive.
pub fn init_with_filter(directives: impl AsRef<str>) {
    let filter = EnvFilter::try_new(directives.as_ref())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_with_filter_is_idempotent() {
        init_with_filter("debug");
        // A second init must not panic.
        init_with_filter("info");
        init();
    }

    #[test]
    fn test_field_names_are_snake_case() {
        for name in [
            SUBSYSTEM,
            COMPONENT,
            OPERATION,
            JOB_NAME,
            BATCH_ID,
            PIPELINE_KIND,
            ENTITY_REF,
            SOURCE,
            DURATION_MS,
            RECORDS_PROCESSED,
            HEARTBEAT_AGE_SECS,
            THRESHOLD_SECS,
            SUCCESS,
            ERROR_MSG,
        ] {
            assert!(name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }
}
