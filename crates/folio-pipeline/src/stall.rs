//! Stall detection and bounded self-healing.
//!
//! A periodic sweep, independent of the jobs themselves, flags running
//! batches whose heartbeat has gone silent past an adaptive threshold
//! and clears the stale lease they left behind so the next scheduled
//! invocation resumes from the persisted cursor. Healing is bounded per
//! batch id; past the cap the batch is left hard-failed for an operator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use folio_core::{
    defaults, AuditEventKind, BatchMetricsRepository, CheckpointRepository, Error, JobKind,
    Result, StallSweepReport,
};
use folio_core::traits::{audit_best_effort, heartbeat_age};

use crate::registry::PipelineRegistry;
use crate::stores::StoreHandles;

/// Configuration for the stall detector.
#[derive(Debug, Clone)]
pub struct StallConfig {
    /// Interval between sweeps.
    pub sweep_interval: Duration,
    /// Fixed floor for the stall threshold.
    pub threshold_floor: Duration,
    /// Completed batches required before the adaptive p95 is trusted.
    pub min_samples: i64,
    /// Maximum self-heals per batch id.
    pub max_heal_attempts: i32,
    /// Refresh the cached duration statistics every N sweeps.
    pub stats_refresh_sweeps: u32,
}

impl Default for StallConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(defaults::STALL_SWEEP_INTERVAL_SECS),
            threshold_floor: Duration::from_secs(defaults::STALL_THRESHOLD_FLOOR_SECS),
            min_samples: defaults::STALL_MIN_SAMPLES,
            max_heal_attempts: defaults::MAX_SELF_HEAL_ATTEMPTS,
            stats_refresh_sweeps: defaults::STALL_STATS_REFRESH_SWEEPS,
        }
    }
}

impl StallConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `FOLIO_STALL_SWEEP_SECS` | `300` | Sweep interval |
    /// | `FOLIO_STALL_FLOOR_SECS` | `600` | Threshold floor |
    /// | `FOLIO_MAX_SELF_HEALS` | `3` | Heal cap per batch |
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("FOLIO_STALL_SWEEP_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                config.sweep_interval = Duration::from_secs(secs.max(1));
            }
        }
        if let Ok(val) = std::env::var("FOLIO_STALL_FLOOR_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                config.threshold_floor = Duration::from_secs(secs.max(1));
            }
        }
        if let Ok(val) = std::env::var("FOLIO_MAX_SELF_HEALS") {
            if let Ok(n) = val.parse::<i32>() {
                config.max_heal_attempts = n.max(0);
            }
        }

        config
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_threshold_floor(mut self, floor: Duration) -> Self {
        self.threshold_floor = floor;
        self
    }

    pub fn with_min_samples(mut self, samples: i64) -> Self {
        self.min_samples = samples;
        self
    }

    pub fn with_max_heal_attempts(mut self, attempts: i32) -> Self {
        self.max_heal_attempts = attempts;
        self
    }
}

/// The stall threshold for a kind: the greater of the fixed floor and
/// the p95 of its historical batch durations (when enough history
/// exists).
pub fn stall_threshold(floor: Duration, p95_secs: Option<f64>) -> Duration {
    match p95_secs {
        Some(p95) if p95 > floor.as_secs_f64() => Duration::from_secs_f64(p95),
        _ => floor,
    }
}

/// Handle for controlling a running stall detector.
pub struct StallDetectorHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl StallDetectorHandle {
    /// Signal the detector to shut down gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))
    }
}

/// Periodic stall sweep over all monitored pipeline kinds.
pub struct StallDetector {
    stores: StoreHandles,
    registry: Arc<PipelineRegistry>,
    config: StallConfig,
    /// Cached p95 duration per kind, refreshed every N sweeps.
    stats: HashMap<JobKind, f64>,
    sweeps_until_refresh: u32,
}

impl StallDetector {
    /// Create a new detector.
    pub fn new(stores: StoreHandles, registry: Arc<PipelineRegistry>, config: StallConfig) -> Self {
        Self {
            stores,
            registry,
            config,
            stats: HashMap::new(),
            sweeps_until_refresh: 0,
        }
    }

    /// Start the sweep loop and return a handle for control.
    pub fn start(mut self) -> StallDetectorHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let interval = self.config.sweep_interval;

        tokio::spawn(async move {
            info!(
                subsystem = "stall",
                sweep_interval_secs = interval.as_secs(),
                "Stall detector started"
            );
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!(subsystem = "stall", "Stall detector stopped");
                        break;
                    }
                    _ = sleep(interval) => {
                        if let Err(e) = self.sweep().await {
                            warn!(subsystem = "stall", error = %e, "sweep failed");
                        }
                    }
                }
            }
        });

        StallDetectorHandle { shutdown_tx }
    }

    /// Run one sweep. Public so operators and tests can trigger it
    /// directly.
    #[instrument(skip(self), fields(subsystem = "stall", component = "sweeper"))]
    pub async fn sweep(&mut self) -> Result<StallSweepReport> {
        if self.sweeps_until_refresh == 0 {
            self.refresh_stats().await;
            self.sweeps_until_refresh = self.config.stats_refresh_sweeps;
        }
        self.sweeps_until_refresh -= 1;

        let now = Utc::now();
        let mut report = StallSweepReport::default();

        for batch in self.stores.batches.running().await? {
            report.checked += 1;

            let threshold = stall_threshold(
                self.config.threshold_floor,
                self.stats.get(&batch.pipeline_kind).copied(),
            );
            let age = heartbeat_age(batch.last_heartbeat_at, now);
            if age <= threshold {
                continue;
            }
            report.stalled += 1;
            if let Err(e) = self.stores.batches.mark_stalled(batch.id).await {
                warn!(batch_id = %batch.id, error = %e, "failed to flag stalled batch");
            }

            let Some(entry) = self.registry.job_for_kind(batch.pipeline_kind) else {
                warn!(
                    batch_id = %batch.id,
                    pipeline_kind = batch.pipeline_kind.as_str(),
                    "stalled batch of an unmonitored kind, leaving untouched"
                );
                continue;
            };
            let job_name = entry.spec.job_name.as_str();

            if batch.heal_attempts >= self.config.max_heal_attempts {
                // Healing budget spent: stop intervening so an
                // unrecoverable job cannot burn cycles forever.
                if let Err(e) = self.stores.batches.mark_failed(batch.id).await {
                    warn!(batch_id = %batch.id, error = %e, "failed to hard-fail batch");
                    continue;
                }
                audit_best_effort(
                    self.stores.audit.as_ref(),
                    AuditEventKind::SelfHeal,
                    job_name,
                    json!({
                        "batch_id": batch.id,
                        "outcome": "exhausted",
                        "heal_attempts": batch.heal_attempts,
                        "heartbeat_age_secs": age.as_secs(),
                    }),
                )
                .await;
                report.exhausted += 1;
                warn!(
                    job_name,
                    batch_id = %batch.id,
                    heal_attempts = batch.heal_attempts,
                    "heal attempts exhausted, batch left failed"
                );
                continue;
            }

            // A fresh checkpoint heartbeat means the job resumed after
            // this batch went silent; its lease is live, not stale.
            if let Some(cp) = self.stores.checkpoints.get(job_name).await? {
                if cp.is_running && heartbeat_age(cp.updated_at, now) <= threshold {
                    debug!(job_name, batch_id = %batch.id, "job resumed, skipping heal");
                    report.resumed += 1;
                    continue;
                }
            }

            // Atomic clear-only-if-held: false means there was no lease
            // left behind (crash after release); the batch is still
            // closed out so it is not re-flagged every sweep.
            let lease_cleared = self.stores.checkpoints.heal(job_name).await?;

            let attempts = self.stores.batches.mark_self_healed(batch.id).await?;
            audit_best_effort(
                self.stores.audit.as_ref(),
                AuditEventKind::SelfHeal,
                job_name,
                json!({
                    "batch_id": batch.id,
                    "outcome": "healed",
                    "lease_cleared": lease_cleared,
                    "heal_attempts": attempts,
                    "heartbeat_age_secs": age.as_secs(),
                    "threshold_secs": threshold.as_secs(),
                }),
            )
            .await;
            report.healed += 1;
            info!(
                job_name,
                batch_id = %batch.id,
                heartbeat_age_secs = age.as_secs(),
                threshold_secs = threshold.as_secs(),
                heal_attempts = attempts,
                "stalled batch self-healed"
            );
        }

        Ok(report)
    }

    /// Refresh the cached per-kind duration statistics used for
    /// adaptive thresholding.
    async fn refresh_stats(&mut self) {
        for entry in self.registry.entries() {
            let kind = entry.spec.kind;
            match self
                .stores
                .batches
                .duration_p95_secs(kind, self.config.min_samples)
                .await
            {
                Ok(Some(p95)) => {
                    debug!(
                        pipeline_kind = kind.as_str(),
                        p95_secs = p95,
                        "refreshed duration stats"
                    );
                    self.stats.insert(kind, p95);
                }
                Ok(None) => {
                    self.stats.remove(&kind);
                }
                Err(e) => {
                    warn!(pipeline_kind = kind.as_str(), error = %e, "stats refresh failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_uses_floor_without_history() {
        let floor = Duration::from_secs(600);
        assert_eq!(stall_threshold(floor, None), floor);
    }

    #[test]
    fn test_threshold_uses_floor_when_p95_is_smaller() {
        let floor = Duration::from_secs(600);
        assert_eq!(stall_threshold(floor, Some(45.0)), floor);
    }

    #[test]
    fn test_threshold_uses_p95_when_larger() {
        let floor = Duration::from_secs(600);
        assert_eq!(
            stall_threshold(floor, Some(1800.0)),
            Duration::from_secs(1800)
        );
    }

    #[test]
    fn test_stall_config_from_defaults() {
        let config = StallConfig::default();
        assert_eq!(config.max_heal_attempts, defaults::MAX_SELF_HEAL_ATTEMPTS);
        assert!(config.sweep_interval < config.threshold_floor);
    }

    #[test]
    fn test_stall_config_builder() {
        let config = StallConfig::default()
            .with_sweep_interval(Duration::from_secs(5))
            .with_threshold_floor(Duration::from_secs(30))
            .with_min_samples(2)
            .with_max_heal_attempts(1);

        assert_eq!(config.sweep_interval, Duration::from_secs(5));
        assert_eq!(config.threshold_floor, Duration::from_secs(30));
        assert_eq!(config.min_samples, 2);
        assert_eq!(config.max_heal_attempts, 1);
    }
}
