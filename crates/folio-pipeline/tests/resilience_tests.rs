//! End-to-end orchestration tests against the in-memory stores.
//!
//! These cover the behavior the engine guarantees across components:
//! lease exclusivity, breaker persistence across invocations, per-record
//! DLQ capture, pause/stop semantics, bounded self-healing, and DLQ
//! replay.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value as JsonValue};

use folio_pipeline::testing::{
    source_record, MemoryEntityStore, MemoryStores, StaticSourceAdapter,
};
use folio_pipeline::{
    BatchMetricsRepository, BatchStatus, BreakerConfig, CheckpointRepository, CircuitState,
    ControlSignal, DeadLetterRepository, DeadLetterStatus, DlqConfig, DlqRetryScheduler, Error,
    IngestRunner, JobKind, JobSpec, NewDeadLetter, PipelineRegistry, ProvenanceRepository,
    QuarantineRepository, RateLimitConfig, RetentionConfig, RetentionSweeper, RunOutcome,
    RunnerConfig, StallConfig, StallDetector,
};

const JOB: &str = "biblio_import_main";
const STALE: Duration = Duration::from_secs(3600);

struct Fixture {
    stores: MemoryStores,
    entity_store: Arc<MemoryEntityStore>,
    adapter: Arc<StaticSourceAdapter>,
    registry: Arc<PipelineRegistry>,
    runner: IngestRunner,
}

/// A runner wired to one job over scripted pages, with an effectively
/// unlimited rate budget so tests exercise the logic, not the pacing.
fn fixture_with(
    pages: Vec<Vec<JsonValue>>,
    breaker: BreakerConfig,
    runner_config: RunnerConfig,
) -> Fixture {
    let stores = MemoryStores::new();
    let entity_store = Arc::new(MemoryEntityStore::new());
    let adapter = Arc::new(StaticSourceAdapter::new("bibliodata", 0.9, pages));

    let registry = PipelineRegistry::builder()
        .register(
            JobSpec::new(JOB, JobKind::BiblioImport, adapter.clone())
                .with_breaker(breaker)
                .with_rate_limit(
                    RateLimitConfig::default()
                        .with_requests_per_sec(100_000.0)
                        .with_burst(100_000),
                )
                .with_dlq_max_retries(2),
        )
        .build();

    let runner = IngestRunner::new(
        stores.handles(),
        entity_store.clone(),
        registry.clone(),
        runner_config,
    );

    Fixture {
        stores,
        entity_store,
        adapter,
        registry,
        runner,
    }
}

fn fixture(pages: Vec<Vec<JsonValue>>) -> Fixture {
    fixture_with(pages, BreakerConfig::default(), RunnerConfig::default())
}

fn edition_pages(n_pages: usize, per_page: usize) -> Vec<Vec<JsonValue>> {
    (0..n_pages)
        .map(|p| {
            (0..per_page)
                .map(|r| {
                    source_record(
                        &format!("isbn:97808803817{p}{r}"),
                        &[
                            ("title", json!(format!("Annals of Krynn, vol. {p}-{r}")), 0.9),
                            ("market_price", json!(8.0 + r as f64), 0.8),
                        ],
                    )
                })
                .collect()
        })
        .collect()
}

fn detector(fix: &Fixture, config: StallConfig) -> StallDetector {
    StallDetector::new(fix.stores.handles(), fix.registry.clone(), config)
}

#[tokio::test]
async fn happy_path_ingests_every_page_and_checkpoints() {
    let fix = fixture(edition_pages(3, 2));

    let report = fix.runner.run_job(JOB).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.pages, 3);
    assert_eq!(report.counters.processed, 6);
    assert_eq!(report.counters.updated, 6);
    assert_eq!(report.counters.errors, 0);

    // Entities and provenance landed.
    let entity = fix
        .entity_store
        .entity("edition", "isbn:9780880381700")
        .expect("entity upserted");
    assert_eq!(entity["title"], json!("Annals of Krynn, vol. 0-0"));
    let prov = fix
        .stores
        .provenance
        .get("edition", "isbn:9780880381700", "title")
        .await
        .unwrap()
        .expect("provenance recorded");
    assert_eq!(prov.source_name, "bibliodata");

    // Lease released, cursor advanced, batch closed.
    let cp = fix.stores.checkpoints.get(JOB).await.unwrap().unwrap();
    assert!(!cp.is_running);
    assert_eq!(cp.counters.processed, 6);
    let batch = fix.stores.batches.get(report.batch_id).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
}

#[tokio::test]
async fn one_poison_record_never_aborts_the_batch() {
    let mut pages = edition_pages(1, 2);
    // Missing `fields` entirely: normalization fails.
    pages[0].push(json!({"entity_ref": "isbn:broken"}));

    let fix = fixture(pages);
    let report = fix.runner.run_job(JOB).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.counters.processed, 2);
    assert_eq!(report.counters.errors, 1);

    let letters = fix.stores.dead_letters.all();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].entity_ref, "isbn:broken");
    assert_eq!(letters[0].error_type, "normalize");
    assert_eq!(letters[0].status, DeadLetterStatus::Pending);

    // The good records still landed.
    assert!(fix.entity_store.entity("edition", "isbn:9780880381700").is_some());
}

#[tokio::test]
async fn entity_store_failure_dead_letters_the_record() {
    let fix = fixture(edition_pages(1, 3));
    fix.entity_store.fail_next_upserts(1);

    let report = fix.runner.run_job(JOB).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.counters.errors, 1);
    assert_eq!(report.counters.updated, 2);

    let letters = fix.stores.dead_letters.all();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].error_type, "merge");
    assert!(letters[0].request_snapshot.is_some());
}

#[tokio::test]
async fn pause_takes_effect_at_the_next_boundary_and_preserves_cursor() {
    let fix = fixture(edition_pages(2, 1));

    // Seed the checkpoint row, then pause before the next invocation.
    fix.stores
        .checkpoints
        .acquire(JOB, JobKind::BiblioImport, STALE)
        .await
        .unwrap();
    fix.stores.checkpoints.release(JOB).await.unwrap();
    fix.stores
        .handles()
        .set_job_control(JOB, ControlSignal::Pause, "admin")
        .await
        .unwrap();

    let report = fix.runner.run_job(JOB).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Paused);
    assert_eq!(report.pages, 0);
    assert_eq!(fix.adapter.fetch_calls(), 0);

    let cp = fix.stores.checkpoints.get(JOB).await.unwrap().unwrap();
    assert!(!cp.is_running, "paused job does not keep the lease");
    assert!(cp.paused_at.is_some());
    assert!(cp.cursor_state().is_start(), "cursor preserved");

    // The control change was audited.
    let audits = fix.stores.audit.all();
    assert!(audits
        .iter()
        .any(|e| e.detail.get("signal") == Some(&json!("pause"))));

    // Resume: the admin flips the signal back and the next invocation
    // picks up from the preserved cursor.
    fix.stores
        .handles()
        .set_job_control(JOB, ControlSignal::Run, "admin")
        .await
        .unwrap();
    let report = fix.runner.run_job(JOB).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.counters.processed, 2);
}

#[tokio::test]
async fn stop_clears_the_lease_immediately() {
    let fix = fixture(edition_pages(2, 1));
    fix.stores
        .checkpoints
        .acquire(JOB, JobKind::BiblioImport, STALE)
        .await
        .unwrap();
    fix.stores
        .checkpoints
        .set_control(JOB, ControlSignal::Stop)
        .await
        .unwrap();

    let cp = fix.stores.checkpoints.get(JOB).await.unwrap().unwrap();
    assert!(!cp.is_running, "stop clears the lease at once");

    let report = fix.runner.run_job(JOB).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Stopped);
    assert_eq!(fix.adapter.fetch_calls(), 0);
}

#[tokio::test]
async fn held_lease_blocks_a_second_invocation() {
    let fix = fixture(edition_pages(1, 1));

    fix.stores
        .checkpoints
        .acquire(JOB, JobKind::BiblioImport, STALE)
        .await
        .unwrap();

    let blocked = fix.runner.run_job(JOB).await;
    assert!(matches!(blocked, Err(Error::AlreadyRunning(_))));
    assert_eq!(fix.adapter.fetch_calls(), 0);
}

#[tokio::test]
async fn page_budget_yields_and_resumption_never_refetches() {
    let fix = fixture_with(
        edition_pages(3, 1),
        BreakerConfig::default(),
        RunnerConfig::default().with_max_pages_per_run(Some(1)),
    );

    let first = fix.runner.run_job(JOB).await.unwrap();
    assert_eq!(first.outcome, RunOutcome::PageBudget);
    assert_eq!(first.pages, 1);

    let second = fix.runner.run_job(JOB).await.unwrap();
    assert_eq!(second.outcome, RunOutcome::PageBudget);

    let third = fix.runner.run_job(JOB).await.unwrap();
    assert_eq!(third.outcome, RunOutcome::Completed);
    assert_eq!(third.counters.processed, 3, "each record ingested once");
    assert_eq!(fix.adapter.fetch_calls(), 3, "each page fetched once");
}

// The end-to-end scenario: 5 consecutive failures open the breaker; the
// open state persists across invocations and rejects without touching
// the source; after the recovery timeout one trial call closes it; a
// stall sweep while the job is idle reports nothing.
#[tokio::test]
async fn breaker_lifecycle_end_to_end() {
    let breaker = BreakerConfig::default()
        .with_failure_threshold(5)
        .with_recovery_timeout(Duration::from_secs(60));
    let fix = fixture_with(edition_pages(1, 1), breaker, RunnerConfig::default());

    // Phase 1: the source fails hard; the fifth failure opens the circuit.
    fix.adapter.fail_next_fetches(100);
    let report = fix.runner.run_job(JOB).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::BreakerOpen);
    assert_eq!(report.counters.errors, 5);
    assert_eq!(fix.adapter.fetch_calls(), 5);

    let snapshot = fix
        .stores
        .checkpoints
        .get(JOB)
        .await
        .unwrap()
        .unwrap()
        .breaker
        .expect("breaker persisted");
    assert_eq!(snapshot.state, CircuitState::Open);
    assert_eq!(snapshot.consecutive_failures, 5);

    // The transition was audited.
    let audits = fix.stores.audit.all();
    assert!(audits
        .iter()
        .any(|e| e.detail.get("to") == Some(&json!("open"))));

    // Phase 2: a new invocation is rejected without any source I/O.
    let report = fix.runner.run_job(JOB).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::BreakerOpen);
    assert_eq!(fix.adapter.fetch_calls(), 5, "no call while open");

    // Phase 3: recovery timeout elapses (simulated by aging the
    // persisted snapshot); the single trial succeeds and closes the
    // circuit, and the run completes normally.
    fix.adapter.fail_next_fetches(0);
    let mut aged = snapshot.clone();
    aged.opened_at = Some(Utc::now() - chrono::Duration::seconds(61));
    fix.stores.checkpoints.save_breaker(JOB, &aged).await.unwrap();

    let report = fix.runner.run_job(JOB).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);

    let closed = fix
        .stores
        .checkpoints
        .get(JOB)
        .await
        .unwrap()
        .unwrap()
        .breaker
        .unwrap();
    assert_eq!(closed.state, CircuitState::Closed);
    assert_eq!(closed.consecutive_failures, 0);
    assert_eq!(closed.backoff_multiplier, 1);

    // Phase 4: a concurrent stall sweep while the job is idle sees
    // nothing to flag.
    let mut det = detector(
        &fix,
        StallConfig::default().with_threshold_floor(Duration::from_secs(600)),
    );
    let sweep = det.sweep().await.unwrap();
    assert_eq!(sweep.checked, 0);
    assert_eq!(sweep.stalled, 0);
    assert_eq!(sweep.healed, 0);
}

#[tokio::test]
async fn audit_outage_never_blocks_the_run() {
    let breaker = BreakerConfig::default().with_failure_threshold(3);
    let fix = fixture_with(edition_pages(1, 1), breaker, RunnerConfig::default());

    fix.stores.audit.fail_appends(true);
    fix.adapter.fail_next_fetches(10);

    let report = fix.runner.run_job(JOB).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::BreakerOpen);
    assert!(fix.stores.audit.all().is_empty());
}

#[tokio::test]
async fn stalled_batch_is_healed_once_and_not_reflagged() {
    let fix = fixture(edition_pages(1, 1));
    let two_hours_ago = Utc::now() - chrono::Duration::hours(2);

    // A crashed job: lease held, batch silent, no checkpoint updates.
    fix.stores
        .checkpoints
        .acquire(JOB, JobKind::BiblioImport, STALE)
        .await
        .unwrap();
    fix.stores.checkpoints.set_updated_at(JOB, two_hours_ago);
    let batch_id = fix.stores.batches.open(JobKind::BiblioImport, 5).await.unwrap();
    fix.stores.batches.set_last_heartbeat(batch_id, two_hours_ago);

    let mut det = detector(
        &fix,
        StallConfig::default().with_threshold_floor(Duration::from_secs(600)),
    );

    let sweep = det.sweep().await.unwrap();
    assert_eq!(sweep.checked, 1);
    assert_eq!(sweep.stalled, 1);
    assert_eq!(sweep.healed, 1);

    let cp = fix.stores.checkpoints.get(JOB).await.unwrap().unwrap();
    assert!(!cp.is_running, "stale lease cleared");
    assert_eq!(cp.control_signal, ControlSignal::Run);

    let batch = fix.stores.batches.get(batch_id).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::SelfHealed);
    assert_eq!(batch.heal_attempts, 1);

    // Healed batches are not running, so the next sweep flags nothing.
    let sweep = det.sweep().await.unwrap();
    assert_eq!(sweep.stalled, 0);
    assert_eq!(sweep.healed, 0);
}

#[tokio::test]
async fn a_resumed_job_does_not_get_its_lease_yanked() {
    let fix = fixture(edition_pages(1, 1));

    // The batch went silent, but the job has since resumed: its
    // checkpoint heartbeat is fresh and its lease is live.
    fix.stores
        .checkpoints
        .acquire(JOB, JobKind::BiblioImport, STALE)
        .await
        .unwrap();
    let batch_id = fix.stores.batches.open(JobKind::BiblioImport, 5).await.unwrap();
    fix.stores
        .batches
        .set_last_heartbeat(batch_id, Utc::now() - chrono::Duration::hours(2));

    let mut det = detector(
        &fix,
        StallConfig::default().with_threshold_floor(Duration::from_secs(600)),
    );
    let sweep = det.sweep().await.unwrap();
    assert_eq!(sweep.stalled, 1);
    assert_eq!(sweep.healed, 0);
    assert_eq!(sweep.resumed, 1);

    let cp = fix.stores.checkpoints.get(JOB).await.unwrap().unwrap();
    assert!(cp.is_running, "live lease untouched");
}

#[tokio::test]
async fn self_healing_is_bounded_then_the_batch_hard_fails() {
    let fix = fixture(edition_pages(1, 1));
    let config = StallConfig::default()
        .with_threshold_floor(Duration::from_secs(600))
        .with_max_heal_attempts(3);
    let mut det = detector(&fix, config);

    let stale_at = || Utc::now() - chrono::Duration::hours(2);

    fix.stores
        .checkpoints
        .acquire(JOB, JobKind::BiblioImport, STALE)
        .await
        .unwrap();
    fix.stores.checkpoints.set_updated_at(JOB, stale_at());
    let batch_id = fix.stores.batches.open(JobKind::BiblioImport, 5).await.unwrap();

    for expected_attempts in 1..=3 {
        fix.stores.batches.set_last_heartbeat(batch_id, stale_at());
        let sweep = det.sweep().await.unwrap();
        assert_eq!(sweep.healed, 1, "heal #{expected_attempts}");

        let batch = fix.stores.batches.get(batch_id).await.unwrap().unwrap();
        assert_eq!(batch.heal_attempts, expected_attempts);

        // The wedged process wakes briefly: the batch flips back to
        // running, the lease is re-acquired, then it goes silent again.
        fix.stores.batches.heartbeat(batch_id, 0).await.unwrap();
        fix.stores
            .checkpoints
            .acquire(JOB, JobKind::BiblioImport, STALE)
            .await
            .unwrap();
        fix.stores.checkpoints.set_updated_at(JOB, stale_at());
    }

    // Budget spent: the fourth stall is left hard-failed.
    fix.stores.batches.set_last_heartbeat(batch_id, stale_at());
    let sweep = det.sweep().await.unwrap();
    assert_eq!(sweep.healed, 0);
    assert_eq!(sweep.exhausted, 1);

    let batch = fix.stores.batches.get(batch_id).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Failed);

    // Further sweeps take no action at all.
    let sweep = det.sweep().await.unwrap();
    assert_eq!(sweep.checked, 0);
    assert_eq!(sweep.exhausted, 0);
}

#[tokio::test]
async fn adaptive_threshold_spares_long_but_normal_batches() {
    let fix = fixture(edition_pages(1, 1));

    // History says p95 ≈ 2000s for this kind; a 30-minute silence is
    // normal even though it is far past the 10-minute floor.
    for _ in 0..12 {
        fix.stores
            .batches
            .seed_completed(JobKind::BiblioImport, Duration::from_secs(2000));
    }

    fix.stores
        .checkpoints
        .acquire(JOB, JobKind::BiblioImport, STALE)
        .await
        .unwrap();
    let batch_id = fix.stores.batches.open(JobKind::BiblioImport, 5).await.unwrap();
    fix.stores
        .batches
        .set_last_heartbeat(batch_id, Utc::now() - chrono::Duration::minutes(30));

    let mut det = detector(
        &fix,
        StallConfig::default()
            .with_threshold_floor(Duration::from_secs(600))
            .with_min_samples(10),
    );
    let sweep = det.sweep().await.unwrap();
    assert_eq!(sweep.checked, 1);
    assert_eq!(sweep.stalled, 0, "p95-based threshold tolerates slow kinds");
}

#[tokio::test]
async fn dlq_replay_resolves_a_recovered_record() {
    let fix = fixture(edition_pages(1, 2));

    // First pass: the entity store rejects one record.
    fix.entity_store.fail_next_upserts(1);
    fix.runner.run_job(JOB).await.unwrap();
    let letters = fix.stores.dead_letters.all();
    assert_eq!(letters.len(), 1);
    let id = letters[0].id;

    // Replay once due.
    fix.stores.dead_letters.make_due(id);
    let scheduler = DlqRetryScheduler::new(
        fix.stores.handles(),
        fix.entity_store.clone(),
        fix.registry.clone(),
        DlqConfig::default(),
    );
    let report = scheduler.sweep().await.unwrap();
    assert_eq!(report.claimed, 1);
    assert_eq!(report.resolved, 1);

    let stats = fix.stores.dead_letters.stats().await.unwrap();
    assert_eq!(stats.resolved, 1);
    assert_eq!(stats.pending, 0);

    // The replayed record landed in the entity store.
    let replayed = &letters[0].entity_ref;
    assert!(fix.entity_store.entity("edition", replayed).is_some());
}

#[tokio::test]
async fn dlq_replay_abandons_vanished_records() {
    let fix = fixture(edition_pages(1, 1));

    let id = fix
        .stores
        .dead_letters
        .push(NewDeadLetter {
            job_kind: JobKind::BiblioImport,
            batch_id: None,
            entity_ref: "isbn:gone-from-source".to_string(),
            error_type: "upsert".to_string(),
            error_message: "timeout".to_string(),
            error_trace: None,
            request_snapshot: None,
            response_snapshot: None,
            max_retries: 3,
        })
        .await
        .unwrap();
    fix.stores.dead_letters.make_due(id);

    let scheduler = DlqRetryScheduler::new(
        fix.stores.handles(),
        fix.entity_store.clone(),
        fix.registry.clone(),
        DlqConfig::default(),
    );
    let report = scheduler.sweep().await.unwrap();
    assert_eq!(report.abandoned, 1);

    let stats = fix.stores.dead_letters.stats().await.unwrap();
    assert_eq!(stats.abandoned, 1);
}

#[tokio::test]
async fn dlq_retry_budget_exhaustion_abandons_the_entry() {
    let fix = fixture(edition_pages(1, 1));

    // The record exists at the source but every upsert fails, so each
    // replay burns one retry. dlq_max_retries is 2 for this job.
    fix.entity_store.fail_next_upserts(1);
    fix.runner.run_job(JOB).await.unwrap();
    let id = fix.stores.dead_letters.all()[0].id;

    let scheduler = DlqRetryScheduler::new(
        fix.stores.handles(),
        fix.entity_store.clone(),
        fix.registry.clone(),
        DlqConfig::default(),
    );

    fix.entity_store.fail_next_upserts(100);

    fix.stores.dead_letters.make_due(id);
    let report = scheduler.sweep().await.unwrap();
    assert_eq!(report.rescheduled, 1);

    fix.stores.dead_letters.make_due(id);
    let report = scheduler.sweep().await.unwrap();
    assert_eq!(report.rescheduled, 1);

    // retry_count reached max_retries: classified abandoned, never
    // claimed again.
    let entry = &fix.stores.dead_letters.all()[0];
    assert_eq!(entry.status, DeadLetterStatus::Abandoned);
    assert_eq!(entry.retry_count, 2);

    fix.stores.dead_letters.make_due(id);
    let report = scheduler.sweep().await.unwrap();
    assert_eq!(report.claimed, 0);
}

#[tokio::test]
async fn dlq_replay_is_deferred_while_the_breaker_is_open() {
    let breaker = BreakerConfig::default().with_failure_threshold(3);
    let fix = fixture_with(edition_pages(1, 1), breaker, RunnerConfig::default());

    // Open the breaker via the main pipeline.
    fix.adapter.fail_next_fetches(10);
    fix.runner.run_job(JOB).await.unwrap();

    let id = fix
        .stores
        .dead_letters
        .push(NewDeadLetter {
            job_kind: JobKind::BiblioImport,
            batch_id: None,
            entity_ref: "isbn:9780880381700".to_string(),
            error_type: "upsert".to_string(),
            error_message: "timeout".to_string(),
            error_trace: None,
            request_snapshot: None,
            response_snapshot: None,
            max_retries: 3,
        })
        .await
        .unwrap();
    fix.stores.dead_letters.make_due(id);

    let scheduler = DlqRetryScheduler::new(
        fix.stores.handles(),
        fix.entity_store.clone(),
        fix.registry.clone(),
        DlqConfig::default(),
    );
    let report = scheduler.sweep().await.unwrap();
    assert_eq!(report.deferred, 1, "open breaker defers replays");
    assert_eq!(report.resolved, 0);

    // Deferred, not burned: the retry count is unchanged.
    let entry = &fix.stores.dead_letters.all()[0];
    assert_eq!(entry.retry_count, 0);
    assert_eq!(entry.status, DeadLetterStatus::Pending);
}

#[tokio::test]
async fn trusted_conflict_is_quarantined_not_applied() {
    // The incumbent value came from a trusted source with a higher
    // effective score than the incoming one.
    let pages = vec![vec![source_record(
        "char:raistlin-majere",
        &[("affiliation", json!("red robes"), 0.7)],
    )]];
    let fix = fixture(pages);

    fix.stores
        .provenance
        .upsert(&folio_pipeline::FieldWrite {
            entity_type: "edition".to_string(),
            entity_id: "char:raistlin-majere".to_string(),
            field_name: "affiliation".to_string(),
            source_name: "wikia".to_string(),
            source_record_id: None,
            source_url: None,
            confidence: 0.95,
            trust_weight: 0.9,
            license: None,
        })
        .await
        .unwrap();

    let report = fix.runner.run_job(JOB).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);

    let pending = fix.stores.quarantine.list_pending(10, 0).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(
        pending[0].reason,
        folio_pipeline::QuarantineReason::Conflict
    );
    assert!(pending[0].competing_values.is_some());

    // Nothing was written through.
    assert!(fix
        .entity_store
        .entity("edition", "char:raistlin-majere")
        .is_none());
    let prov = fix
        .stores
        .provenance
        .get("edition", "char:raistlin-majere", "affiliation")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(prov.source_name, "wikia");
}

#[tokio::test]
async fn locked_field_survives_reingestion() {
    let fix = fixture(edition_pages(1, 1));

    // First run writes the field; a curator then locks it.
    fix.runner.run_job(JOB).await.unwrap();
    fix.stores
        .provenance
        .lock(
            "edition",
            "isbn:9780880381700",
            "market_price",
            "curator",
            Some("priced by hand"),
        )
        .await
        .unwrap();
    let before = fix
        .stores
        .provenance
        .get("edition", "isbn:9780880381700", "market_price")
        .await
        .unwrap()
        .unwrap();

    // Re-ingesting the same source data must not touch the locked field.
    let report = fix.runner.run_job(JOB).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);

    let after = fix
        .stores
        .provenance
        .get("edition", "isbn:9780880381700", "market_price")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.fetched_at, before.fetched_at, "locked row untouched");
    assert!(after.locked);
}

#[tokio::test]
async fn retention_sweeper_proves_purges_and_noops_when_clean() {
    let fix = fixture(vec![]);
    fix.stores.retention.set_expired("ingest_audit", 40);

    let sweeper = RetentionSweeper::new(
        fix.stores.retention.clone(),
        RetentionConfig::default().with_operator("nightly"),
    );

    let proofs = sweeper.sweep().await.unwrap();
    assert_eq!(proofs.len(), 1);
    assert_eq!(proofs[0].records_purged, 40);
    assert_eq!(proofs[0].operator, "nightly");

    // Nothing newly expired: no deletions, no proofs.
    let proofs = sweeper.sweep().await.unwrap();
    assert!(proofs.is_empty());
}
