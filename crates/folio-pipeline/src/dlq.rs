//! Dead-letter retry scheduling.
//!
//! A periodic sweep claims entries due for retry and replays each unit
//! of work through its source adapter's `fetch_by_id` path, the shared
//! merge policy, and the entity store. Replays honor the job's persisted
//! breaker snapshot and its rate limiter, so a dead source is never
//! hammered from the side while the main pipeline is backing off.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use folio_core::{
    breaker, defaults, CheckpointRepository, DeadLetter, DeadLetterRepository, Decision,
    EntityStore, Error, Result, SourceAdapter,
};

use crate::merge::{self, MergeConfig};
use crate::registry::{JobEntry, PipelineRegistry};
use crate::stores::StoreHandles;

/// Configuration for the DLQ retry scheduler.
#[derive(Debug, Clone)]
pub struct DlqConfig {
    /// Interval between sweeps.
    pub sweep_interval: Duration,
    /// Entries claimed per sweep.
    pub batch_size: i64,
    /// Merge policy thresholds for replays.
    pub merge: MergeConfig,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(defaults::DLQ_SWEEP_INTERVAL_SECS),
            batch_size: defaults::DLQ_SWEEP_BATCH_SIZE,
            merge: MergeConfig::default(),
        }
    }
}

impl DlqConfig {
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, size: i64) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Result of one retry sweep, for logging and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct DlqSweepReport {
    pub claimed: usize,
    pub resolved: usize,
    pub abandoned: usize,
    pub rescheduled: usize,
    pub deferred: usize,
}

/// Handle for controlling a running retry scheduler.
pub struct DlqSchedulerHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl DlqSchedulerHandle {
    /// Signal the scheduler to shut down gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))
    }
}

/// Periodic replay of dead-lettered units of work.
pub struct DlqRetryScheduler {
    stores: StoreHandles,
    entity_store: Arc<dyn EntityStore>,
    registry: Arc<PipelineRegistry>,
    config: DlqConfig,
}

impl DlqRetryScheduler {
    /// Create a new scheduler.
    pub fn new(
        stores: StoreHandles,
        entity_store: Arc<dyn EntityStore>,
        registry: Arc<PipelineRegistry>,
        config: DlqConfig,
    ) -> Self {
        Self {
            stores,
            entity_store,
            registry,
            config,
        }
    }

    /// Start the sweep loop and return a handle for control.
    pub fn start(self) -> DlqSchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let interval = self.config.sweep_interval;

        tokio::spawn(async move {
            info!(
                subsystem = "dlq",
                sweep_interval_secs = interval.as_secs(),
                "DLQ retry scheduler started"
            );
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!(subsystem = "dlq", "DLQ retry scheduler stopped");
                        break;
                    }
                    _ = sleep(interval) => {
                        if let Err(e) = self.sweep().await {
                            warn!(subsystem = "dlq", error = %e, "sweep failed");
                        }
                    }
                }
            }
        });

        DlqSchedulerHandle { shutdown_tx }
    }

    /// Run one sweep. Public so operators and tests can trigger it
    /// directly.
    #[instrument(skip(self), fields(subsystem = "dlq", component = "scheduler"))]
    pub async fn sweep(&self) -> Result<DlqSweepReport> {
        let due = self.stores.dead_letters.claim_due(self.config.batch_size).await?;
        let mut report = DlqSweepReport {
            claimed: due.len(),
            ..Default::default()
        };

        for entry in due {
            let Some(job) = self.registry.job_for_kind(entry.job_kind) else {
                self.stores
                    .dead_letters
                    .abandon(
                        entry.id,
                        "retry-scheduler",
                        Some("no registered job for this kind"),
                    )
                    .await?;
                report.abandoned += 1;
                continue;
            };

            // Respect the job's persisted backoff: replaying against a
            // source the breaker knows is bad would just burn retries.
            if let Some(retry_after) = self.breaker_block(&job).await {
                self.stores.dead_letters.defer(entry.id, retry_after).await?;
                report.deferred += 1;
                continue;
            }

            if job.limiter.acquire().await.is_err() {
                self.stores
                    .dead_letters
                    .defer(entry.id, self.config.sweep_interval)
                    .await?;
                report.deferred += 1;
                continue;
            }

            match self.replay(&job, &entry).await {
                Ok(true) => {
                    self.stores
                        .dead_letters
                        .resolve(entry.id, "retry-scheduler", Some("replayed successfully"))
                        .await?;
                    report.resolved += 1;
                    debug!(entity_ref = %entry.entity_ref, "dead letter replayed");
                }
                Ok(false) => {
                    self.stores
                        .dead_letters
                        .abandon(
                            entry.id,
                            "retry-scheduler",
                            Some("source no longer has the record"),
                        )
                        .await?;
                    report.abandoned += 1;
                }
                Err(e) => {
                    self.stores
                        .dead_letters
                        .record_retry_failure(entry.id, &e.to_string())
                        .await?;
                    report.rescheduled += 1;
                    warn!(entity_ref = %entry.entity_ref, error = %e, "replay failed");
                }
            }
        }

        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                resolved = report.resolved,
                abandoned = report.abandoned,
                rescheduled = report.rescheduled,
                deferred = report.deferred,
                "DLQ sweep finished"
            );
        }
        Ok(report)
    }

    /// If the job's persisted breaker would reject a call right now,
    /// returns how long to defer.
    async fn breaker_block(&self, job: &Arc<JobEntry>) -> Option<Duration> {
        let checkpoint = self
            .stores
            .checkpoints
            .get(&job.spec.job_name)
            .await
            .ok()??;
        let snapshot = checkpoint.breaker?;
        match breaker::check(&snapshot, &job.spec.breaker, Utc::now()).1 {
            Decision::Permit { .. } => None,
            Decision::Reject { retry_after } => Some(retry_after),
        }
    }

    /// Replay one entry. `Ok(false)` means the source no longer has the
    /// record.
    async fn replay(&self, job: &Arc<JobEntry>, entry: &DeadLetter) -> Result<bool> {
        let Some(raw) = job.spec.adapter.fetch_by_id(&entry.entity_ref).await? else {
            return Ok(false);
        };

        let normalized = job.spec.adapter.normalize(&raw)?;
        merge::apply_record(
            &self.stores,
            &self.entity_store,
            job.spec.adapter.meta(),
            &self.config.merge,
            &normalized,
        )
        .await?;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dlq_config_defaults() {
        let config = DlqConfig::default();
        assert_eq!(
            config.sweep_interval,
            Duration::from_secs(defaults::DLQ_SWEEP_INTERVAL_SECS)
        );
        assert_eq!(config.batch_size, defaults::DLQ_SWEEP_BATCH_SIZE);
    }

    #[test]
    fn test_dlq_config_clamps_batch_size() {
        let config = DlqConfig::default().with_batch_size(0);
        assert_eq!(config.batch_size, 1);
    }
}
