//! Repository handle bundle shared by the runner, stall detector and
//! schedulers.

use std::sync::Arc;

use serde_json::json;

use folio_core::traits::audit_best_effort;
use folio_core::{
    AuditEventKind, AuditRepository, BatchMetricsRepository, CheckpointRepository, ControlSignal,
    DeadLetterRepository, ProvenanceRepository, QuarantineRepository, Result,
};
use folio_db::Database;

/// Trait-object handles to every ingestion repository. Concrete
/// PostgreSQL repositories in production; in-memory implementations in
/// orchestration tests.
#[derive(Clone)]
pub struct StoreHandles {
    pub checkpoints: Arc<dyn CheckpointRepository>,
    pub batches: Arc<dyn BatchMetricsRepository>,
    pub dead_letters: Arc<dyn DeadLetterRepository>,
    pub quarantine: Arc<dyn QuarantineRepository>,
    pub provenance: Arc<dyn ProvenanceRepository>,
    pub audit: Arc<dyn AuditRepository>,
}

impl StoreHandles {
    /// Wrap a connected [`Database`]'s repositories.
    pub fn from_database(db: &Database) -> Self {
        Self {
            checkpoints: Arc::new(db.checkpoints.clone()),
            batches: Arc::new(db.batches.clone()),
            dead_letters: Arc::new(db.dead_letters.clone()),
            quarantine: Arc::new(db.quarantine.clone()),
            provenance: Arc::new(db.provenance.clone()),
            audit: Arc::new(db.audit.clone()),
        }
    }

    /// Admin control with an audit trail: pause, resume or stop a named
    /// job. `pause` takes effect at the job's next page boundary with
    /// the cursor preserved; `stop` clears the lease immediately.
    pub async fn set_job_control(
        &self,
        job_name: &str,
        signal: ControlSignal,
        actor: &str,
    ) -> Result<()> {
        self.checkpoints.set_control(job_name, signal).await?;
        audit_best_effort(
            self.audit.as_ref(),
            AuditEventKind::ControlChange,
            job_name,
            json!({"signal": signal.as_str(), "actor": actor}),
        )
        .await;
        Ok(())
    }
}
