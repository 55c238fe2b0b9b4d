//! Centralized default constants for the folio ingestion engine.
//!
//! **This module is the single source of truth** for all shared default
//! values. Crates should reference these constants instead of defining
//! their own magic numbers. When adding new constants, place them in the
//! appropriate section and document the rationale for the chosen value.

use std::time::Duration;

// =============================================================================
// CIRCUIT BREAKER
// =============================================================================

/// Consecutive failures before a breaker opens.
pub const BREAKER_FAILURE_THRESHOLD: u32 = 5;

/// Base recovery timeout before an open breaker admits a trial call.
pub const BREAKER_RECOVERY_TIMEOUT_SECS: u64 = 60;

/// Cap on the power-of-two backoff multiplier (60s × 16 ≈ 16 minutes max).
pub const BREAKER_MAX_BACKOFF_MULTIPLIER: u32 = 16;

/// Fixed rolling window of call outcomes for error-rate mode.
///
/// Bounded so the breaker snapshot embedded in the checkpoint row stays
/// O(1) in size.
pub const BREAKER_ERROR_RATE_WINDOW: usize = 20;

/// Default error-rate threshold for jobs that opt into error-rate mode.
pub const BREAKER_ERROR_RATE_THRESHOLD: f64 = 0.5;

// =============================================================================
// CHECKPOINT LEASE
// =============================================================================

/// A lease older than this is considered stale and may be taken over by
/// `acquire`. Well past any batch's stall threshold, so the self-healer
/// stays the primary recovery path.
pub const STALE_LEASE_AFTER_SECS: u64 = 3600;

// =============================================================================
// STALL DETECTION / SELF-HEAL
// =============================================================================

/// Interval between stall-detector sweeps.
pub const STALL_SWEEP_INTERVAL_SECS: u64 = 300;

/// Fixed floor for the stall threshold, regardless of history.
pub const STALL_THRESHOLD_FLOOR_SECS: u64 = 600;

/// Minimum completed batches of a kind before the adaptive p95 threshold
/// is trusted over the floor.
pub const STALL_MIN_SAMPLES: i64 = 10;

/// Maximum automatic self-heals per batch id before the batch is left
/// hard-failed for an operator.
pub const MAX_SELF_HEAL_ATTEMPTS: i32 = 3;

/// Refresh the cached per-kind duration statistics every N sweeps.
pub const STALL_STATS_REFRESH_SWEEPS: u32 = 12;

// =============================================================================
// DEAD LETTER QUEUE
// =============================================================================

/// Default maximum retry count for dead-lettered units of work.
pub const DLQ_MAX_RETRIES: i32 = 3;

/// Base delay for the exponential DLQ retry schedule.
pub const DLQ_RETRY_BASE_SECS: u64 = 300;

/// Interval between DLQ retry-scheduler sweeps.
pub const DLQ_SWEEP_INTERVAL_SECS: u64 = 120;

/// Entries claimed per retry-scheduler sweep.
pub const DLQ_SWEEP_BATCH_SIZE: i64 = 25;

// =============================================================================
// RATE LIMITING
// =============================================================================

/// Default sustained request rate per source.
pub const RATE_LIMIT_REQUESTS_PER_SEC: f64 = 2.0;

/// Default burst capacity per source.
pub const RATE_LIMIT_BURST: u32 = 5;

/// How long a call may cooperatively wait for a slot before failing.
pub const RATE_LIMIT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// MERGE / QUARANTINE
// =============================================================================

/// Records whose overall confidence falls below this are quarantined.
pub const MERGE_MIN_CONFIDENCE: f32 = 0.5;

/// Duplicate-candidate score band treated as a fuzzy match. Scores above
/// the band are safe automatic matches; scores below are distinct records.
pub const FUZZY_MATCH_LOW: f32 = 0.6;
pub const FUZZY_MATCH_HIGH: f32 = 0.92;

/// Sources at or above this trust weight are "trusted": a disagreement
/// between two of them is a conflict, never a silent overwrite.
pub const TRUSTED_SOURCE_WEIGHT: f32 = 0.7;

// =============================================================================
// RETENTION
// =============================================================================

/// Default days to keep batch metrics.
pub const RETENTION_BATCH_METRIC_DAYS: i32 = 30;

/// Default days to keep operational audit rows.
pub const RETENTION_AUDIT_DAYS: i32 = 90;

/// Default days to keep resolved/abandoned dead letters.
pub const RETENTION_DEAD_LETTER_DAYS: i32 = 60;

/// Interval between retention sweeps.
pub const RETENTION_SWEEP_INTERVAL_SECS: u64 = 86_400;

// =============================================================================
// RUNNER
// =============================================================================

/// Default event bus broadcast channel capacity.
pub const EVENT_BUS_CAPACITY: usize = 256;

/// Retry delay for the exponential DLQ schedule: `base × 2^retry_count`,
/// plus up to 10% jitter so synchronized failures do not retry in lockstep.
pub fn retry_delay(retry_count: i32, base: Duration) -> Duration {
    let exp = retry_count.clamp(0, 16) as u32;
    let scaled = base.saturating_mul(2u32.saturating_pow(exp));
    let jitter_ms = (scaled.as_millis() as u64 / 10).max(1);
    scaled + Duration::from_millis(rand::random::<u64>() % jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_defaults_are_consistent() {
        const {
            assert!(BREAKER_FAILURE_THRESHOLD > 0);
            assert!(BREAKER_MAX_BACKOFF_MULTIPLIER.is_power_of_two());
            assert!(BREAKER_ERROR_RATE_WINDOW >= BREAKER_FAILURE_THRESHOLD as usize);
        }
        assert!(BREAKER_ERROR_RATE_THRESHOLD > 0.0 && BREAKER_ERROR_RATE_THRESHOLD < 1.0);
    }

    #[test]
    fn stall_thresholds_ordered() {
        const {
            // The stale-lease fallback must sit above the stall floor so the
            // self-healer always gets the first chance to recover a lease.
            assert!(STALE_LEASE_AFTER_SECS > STALL_THRESHOLD_FLOOR_SECS);
            assert!(STALL_SWEEP_INTERVAL_SECS < STALL_THRESHOLD_FLOOR_SECS);
        }
    }

    #[test]
    fn fuzzy_band_is_a_band() {
        assert!(FUZZY_MATCH_LOW < FUZZY_MATCH_HIGH);
        assert!(FUZZY_MATCH_HIGH < 1.0);
        assert!(MERGE_MIN_CONFIDENCE < TRUSTED_SOURCE_WEIGHT);
    }

    #[test]
    fn retry_delay_is_exponential() {
        let base = Duration::from_secs(300);
        let d0 = retry_delay(0, base);
        let d1 = retry_delay(1, base);
        let d2 = retry_delay(2, base);

        // Lower bound is exact; upper bound allows for 10% jitter.
        assert!(d0 >= base && d0 <= base + base / 10 + Duration::from_millis(1));
        assert!(d1 >= base * 2);
        assert!(d2 >= base * 4);
        assert!(d2 < base * 5);
    }

    #[test]
    fn retry_delay_clamps_exponent() {
        // A pathological retry count must not overflow.
        let d = retry_delay(1000, Duration::from_secs(1));
        assert!(d >= Duration::from_secs(65_536));
    }
}
