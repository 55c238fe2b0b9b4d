//! Scheduled retention sweeps.
//!
//! Walks every configured policy on a fixed interval and delegates the
//! transactional delete-and-prove to the retention repository. A failed
//! table never blocks the others.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{info, instrument, warn};

use folio_core::{defaults, Error, PurgeProof, Result, RetentionRepository};

/// Configuration for the retention sweeper.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Interval between sweeps.
    pub sweep_interval: Duration,
    /// Operator name recorded on purge proofs.
    pub operator: String,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(defaults::RETENTION_SWEEP_INTERVAL_SECS),
            operator: "retention-sweeper".to_string(),
        }
    }
}

impl RetentionConfig {
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_operator(mut self, operator: impl Into<String>) -> Self {
        self.operator = operator.into();
        self
    }
}

/// Handle for controlling a running retention sweeper.
pub struct RetentionSweeperHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl RetentionSweeperHandle {
    /// Signal the sweeper to shut down gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))
    }
}

/// Periodic retention enforcement across all configured policies.
pub struct RetentionSweeper {
    retention: Arc<dyn RetentionRepository>,
    config: RetentionConfig,
}

impl RetentionSweeper {
    /// Create a new sweeper.
    pub fn new(retention: Arc<dyn RetentionRepository>, config: RetentionConfig) -> Self {
        Self { retention, config }
    }

    /// Start the sweep loop and return a handle for control.
    pub fn start(self) -> RetentionSweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let interval = self.config.sweep_interval;

        tokio::spawn(async move {
            info!(
                subsystem = "retention",
                sweep_interval_secs = interval.as_secs(),
                "Retention sweeper started"
            );
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!(subsystem = "retention", "Retention sweeper stopped");
                        break;
                    }
                    _ = sleep(interval) => {
                        if let Err(e) = self.sweep().await {
                            warn!(subsystem = "retention", error = %e, "sweep failed");
                        }
                    }
                }
            }
        });

        RetentionSweeperHandle { shutdown_tx }
    }

    /// Run one sweep over every policy, returning the proofs written.
    /// Public so operators and tests can trigger it directly.
    #[instrument(skip(self), fields(subsystem = "retention", component = "sweeper"))]
    pub async fn sweep(&self) -> Result<Vec<PurgeProof>> {
        let mut proofs = Vec::new();

        for policy in self.retention.policies().await? {
            match self
                .retention
                .purge(&policy.table_name, &self.config.operator)
                .await
            {
                Ok(Some(proof)) => {
                    info!(
                        db_table = %proof.table_name,
                        records_purged = proof.records_purged,
                        "retention purge"
                    );
                    proofs.push(proof);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(db_table = %policy.table_name, error = %e, "purge failed");
                }
            }
        }

        Ok(proofs)
    }
}
