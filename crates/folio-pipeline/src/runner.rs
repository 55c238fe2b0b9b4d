//! Ingest runner: one resumable job invocation.
//!
//! The runner executes a single scheduled invocation of a named job:
//! acquire the checkpoint lease, restore the breaker, open a batch, then
//! loop over pages — control-signal check, breaker gate, limiter gate,
//! fetch, per-record merge with DLQ capture, heartbeat and cursor
//! advance — until the source is exhausted or the run is interrupted.
//! Failures of a single record never abort the batch; failures of the
//! source only end this invocation, with the breaker carrying the
//! backoff across restarts.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use tokio::sync::broadcast;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use folio_core::{
    defaults, AuditEventKind, BatchMetricsRepository, CallOutcome, Checkpoint,
    CheckpointRepository, CircuitBreaker, ControlSignal, CursorState, DeadLetterRepository,
    Decision, EntityStore, Error, NewDeadLetter, ProgressCounters, Result, SourceAdapter,
};
use folio_core::traits::audit_best_effort;

use crate::merge::{self, MergeConfig};
use crate::registry::{JobEntry, PipelineRegistry};
use crate::stores::StoreHandles;

/// Configuration for the ingest runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Leases older than this may be taken over by `acquire`.
    pub stale_lease_after: Duration,
    /// Optional page budget per invocation; `None` runs to exhaustion.
    pub max_pages_per_run: Option<u32>,
    /// Merge policy thresholds.
    pub merge: MergeConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            stale_lease_after: Duration::from_secs(defaults::STALE_LEASE_AFTER_SECS),
            max_pages_per_run: None,
            merge: MergeConfig::default(),
        }
    }
}

impl RunnerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `FOLIO_STALE_LEASE_SECS` | `3600` | Lease age considered abandoned |
    /// | `FOLIO_MAX_PAGES_PER_RUN` | unset | Page budget per invocation |
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("FOLIO_STALE_LEASE_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                config.stale_lease_after = Duration::from_secs(secs.max(1));
            }
        }
        if let Ok(val) = std::env::var("FOLIO_MAX_PAGES_PER_RUN") {
            config.max_pages_per_run = val.parse::<u32>().ok().filter(|n| *n > 0);
        }

        config
    }

    pub fn with_stale_lease_after(mut self, after: Duration) -> Self {
        self.stale_lease_after = after;
        self
    }

    pub fn with_max_pages_per_run(mut self, pages: Option<u32>) -> Self {
        self.max_pages_per_run = pages;
        self
    }

    pub fn with_merge(mut self, merge: MergeConfig) -> Self {
        self.merge = merge;
        self
    }
}

/// Why a job invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The source was exhausted.
    Completed,
    /// An admin pause took effect at a page boundary.
    Paused,
    /// An admin stop took effect.
    Stopped,
    /// The breaker rejected further calls; backoff persists across runs.
    BreakerOpen,
    /// No rate-limit slot within the acquire timeout.
    RateLimited,
    /// The per-invocation page budget was reached.
    PageBudget,
}

/// Summary of one job invocation.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub job_name: String,
    pub outcome: RunOutcome,
    pub pages: u32,
    pub counters: ProgressCounters,
    pub batch_id: Uuid,
}

/// Event emitted by the runner.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    JobStarted {
        job_name: String,
    },
    PageProcessed {
        job_name: String,
        records: usize,
    },
    RecordDeadLettered {
        job_name: String,
        entity_ref: String,
    },
    RecordQuarantined {
        job_name: String,
        entity_ref: String,
    },
    BreakerRejected {
        job_name: String,
        retry_after: Duration,
    },
    JobFinished {
        job_name: String,
        outcome: RunOutcome,
    },
}

/// Executes scheduled invocations of registered ingestion jobs.
pub struct IngestRunner {
    stores: StoreHandles,
    entity_store: Arc<dyn EntityStore>,
    registry: Arc<PipelineRegistry>,
    config: RunnerConfig,
    event_tx: broadcast::Sender<PipelineEvent>,
}

impl IngestRunner {
    /// Create a new runner.
    pub fn new(
        stores: StoreHandles,
        entity_store: Arc<dyn EntityStore>,
        registry: Arc<PipelineRegistry>,
        config: RunnerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        Self {
            stores,
            entity_store,
            registry,
            config,
            event_tx,
        }
    }

    /// Get a receiver for pipeline events.
    pub fn events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.event_tx.subscribe()
    }

    /// Execute one invocation of a named job. Called by the scheduler;
    /// safe to call again immediately after any outcome.
    #[instrument(skip(self), fields(subsystem = "pipeline", component = "runner"))]
    pub async fn run_job(&self, job_name: &str) -> Result<RunReport> {
        let entry = self
            .registry
            .get(job_name)
            .ok_or_else(|| Error::NotFound(format!("registered job {job_name}")))?;

        let checkpoint = self
            .stores
            .checkpoints
            .acquire(job_name, entry.spec.kind, self.config.stale_lease_after)
            .await?;

        info!(job_name, op = "acquire", "Lease acquired, starting run");
        let _ = self.event_tx.send(PipelineEvent::JobStarted {
            job_name: job_name.to_string(),
        });

        let result = self.run_pages(&entry, checkpoint).await;

        // The lease is released on every exit path; a paused job keeps
        // its pause marker but not the lease.
        if let Err(e) = self.stores.checkpoints.release(job_name).await {
            warn!(job_name, error = %e, "failed to release lease");
        }

        match &result {
            Ok(report) => {
                info!(
                    job_name,
                    outcome = ?report.outcome,
                    pages = report.pages,
                    records_processed = report.counters.processed,
                    "Run finished"
                );
                let _ = self.event_tx.send(PipelineEvent::JobFinished {
                    job_name: job_name.to_string(),
                    outcome: report.outcome,
                });
            }
            Err(e) => {
                error!(job_name, error = %e, "Run failed");
            }
        }

        result
    }

    async fn run_pages(&self, entry: &Arc<JobEntry>, checkpoint: Checkpoint) -> Result<RunReport> {
        let spec = &entry.spec;
        let job_name = spec.job_name.as_str();

        let mut breaker =
            CircuitBreaker::restore(job_name, spec.breaker.clone(), checkpoint.breaker.clone());
        let mut cursor = checkpoint.cursor_state();
        let mut counters = checkpoint.counters;
        let mut pages: u32 = 0;

        let batch_id = self.stores.batches.open(spec.kind, 0).await?;

        let outcome = loop {
            match self.stores.checkpoints.control_signal(job_name).await? {
                ControlSignal::Run => {}
                ControlSignal::Pause => break RunOutcome::Paused,
                ControlSignal::Stop => break RunOutcome::Stopped,
            }

            match breaker.check(Utc::now()) {
                Decision::Permit { .. } => {}
                Decision::Reject { retry_after } => {
                    let _ = self.event_tx.send(PipelineEvent::BreakerRejected {
                        job_name: job_name.to_string(),
                        retry_after,
                    });
                    break RunOutcome::BreakerOpen;
                }
            }

            if let Err(e) = entry.limiter.acquire().await {
                warn!(job_name, error = %e, "rate limiter exhausted, yielding");
                break RunOutcome::RateLimited;
            }

            match spec.adapter.fetch_page(&cursor).await {
                Ok(page) => {
                    self.note_call(&mut breaker, CallOutcome::Success, job_name)
                        .await;

                    let records = page.records.len();
                    for record in &page.records {
                        self.process_record(entry, batch_id, record, &mut counters)
                            .await;
                    }

                    cursor = page.next_cursor;
                    pages += 1;
                    self.beat(job_name, batch_id, &cursor, counters).await;
                    let _ = self.event_tx.send(PipelineEvent::PageProcessed {
                        job_name: job_name.to_string(),
                        records,
                    });

                    if !page.has_more {
                        break RunOutcome::Completed;
                    }
                    if let Some(max) = self.config.max_pages_per_run {
                        if pages >= max {
                            break RunOutcome::PageBudget;
                        }
                    }
                }
                Err(e) => {
                    counters.errors += 1;
                    warn!(job_name, error = %e, op = "fetch_page", "source call failed");
                    self.note_call(&mut breaker, CallOutcome::Failure, job_name)
                        .await;
                    self.beat(job_name, batch_id, &cursor, counters).await;
                }
            }
        };

        // Every loop exit above is deliberate; the batch is closed so the
        // stall detector never mistakes a finished run for a silent one.
        if let Err(e) = self.stores.batches.complete(batch_id).await {
            warn!(job_name, error = %e, "failed to close batch");
        }

        Ok(RunReport {
            job_name: job_name.to_string(),
            outcome,
            pages,
            counters,
            batch_id,
        })
    }

    /// Process one raw record; never propagates a per-record failure.
    async fn process_record(
        &self,
        entry: &Arc<JobEntry>,
        batch_id: Uuid,
        record: &JsonValue,
        counters: &mut ProgressCounters,
    ) {
        let spec = &entry.spec;

        let normalized = match spec.adapter.normalize(record) {
            Ok(normalized) => normalized,
            Err(e) => {
                counters.errors += 1;
                self.dead_letter(
                    entry,
                    batch_id,
                    record
                        .get("entity_ref")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown"),
                    "normalize",
                    &e,
                    Some(record.clone()),
                )
                .await;
                return;
            }
        };

        counters.processed += 1;

        match merge::apply_record(
            &self.stores,
            &self.entity_store,
            spec.adapter.meta(),
            &self.config.merge,
            &normalized,
        )
        .await
        {
            Ok(outcome) => {
                if outcome.applied_fields > 0 {
                    counters.updated += 1;
                }
                if outcome.quarantined {
                    let _ = self.event_tx.send(PipelineEvent::RecordQuarantined {
                        job_name: spec.job_name.clone(),
                        entity_ref: normalized.entity_ref.clone(),
                    });
                }
            }
            Err(e) => {
                counters.errors += 1;
                self.dead_letter(
                    entry,
                    batch_id,
                    &normalized.entity_ref,
                    "merge",
                    &e,
                    serde_json::to_value(&normalized).ok(),
                )
                .await;
            }
        }
    }

    /// Capture a failed unit of work without aborting the batch.
    async fn dead_letter(
        &self,
        entry: &Arc<JobEntry>,
        batch_id: Uuid,
        entity_ref: &str,
        error_type: &str,
        error: &Error,
        request_snapshot: Option<JsonValue>,
    ) {
        let spec = &entry.spec;
        let new_entry = NewDeadLetter {
            job_kind: spec.kind,
            batch_id: Some(batch_id),
            entity_ref: entity_ref.to_string(),
            error_type: error_type.to_string(),
            error_message: error.to_string(),
            error_trace: None,
            request_snapshot,
            response_snapshot: None,
            max_retries: spec.dlq_max_retries,
        };

        match self.stores.dead_letters.push(new_entry).await {
            Ok(_) => {
                let _ = self.event_tx.send(PipelineEvent::RecordDeadLettered {
                    job_name: spec.job_name.clone(),
                    entity_ref: entity_ref.to_string(),
                });
            }
            Err(e) => {
                error!(
                    job_name = %spec.job_name,
                    entity_ref,
                    error = %e,
                    "failed to dead-letter record"
                );
            }
        }
    }

    /// Record a source call against the breaker, audit any transition,
    /// and persist the snapshot so restarts do not reset backoff.
    async fn note_call(&self, breaker: &mut CircuitBreaker, outcome: CallOutcome, job_name: &str) {
        if let Some(event) = breaker.record(outcome, Utc::now()) {
            audit_best_effort(
                self.stores.audit.as_ref(),
                AuditEventKind::BreakerTransition,
                job_name,
                json!({
                    "from": event.from.as_str(),
                    "to": event.to.as_str(),
                    "failure_count": event.consecutive_failures,
                    "retry_after_secs": event.retry_after.map(|d| d.as_secs()),
                }),
            )
            .await;
        }

        if let Err(e) = self
            .stores
            .checkpoints
            .save_breaker(job_name, breaker.state())
            .await
        {
            warn!(job_name, error = %e, "failed to persist breaker snapshot");
        }
    }

    /// Best-effort heartbeats: losing one only delays stall detection by
    /// a sweep interval, it never corrupts state.
    async fn beat(
        &self,
        job_name: &str,
        batch_id: Uuid,
        cursor: &CursorState,
        counters: ProgressCounters,
    ) {
        if let Err(e) = self
            .stores
            .checkpoints
            .heartbeat(job_name, &cursor.to_json(), counters)
            .await
        {
            warn!(job_name, error = %e, "checkpoint heartbeat failed");
        }
        if let Err(e) = self
            .stores
            .batches
            .heartbeat(batch_id, counters.processed.min(i64::from(i32::MAX)) as i32)
            .await
        {
            warn!(job_name, error = %e, "batch heartbeat failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runner_config_default() {
        let config = RunnerConfig::default();
        assert_eq!(
            config.stale_lease_after,
            Duration::from_secs(defaults::STALE_LEASE_AFTER_SECS)
        );
        assert!(config.max_pages_per_run.is_none());
    }

    #[test]
    fn test_runner_config_builder() {
        let config = RunnerConfig::default()
            .with_stale_lease_after(Duration::from_secs(120))
            .with_max_pages_per_run(Some(8));

        assert_eq!(config.stale_lease_after, Duration::from_secs(120));
        assert_eq!(config.max_pages_per_run, Some(8));
    }

    #[test]
    fn test_run_outcome_equality() {
        assert_eq!(RunOutcome::Completed, RunOutcome::Completed);
        assert_ne!(RunOutcome::Completed, RunOutcome::Paused);
    }
}
