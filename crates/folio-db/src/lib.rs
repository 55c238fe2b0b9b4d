//! # folio-db
//!
//! PostgreSQL persistence layer for the folio ingestion engine.
//!
//! This crate provides:
//! - Connection pool management
//! - Repository implementations for all ingestion state: checkpoints
//!   (with the run lease), batch metrics, dead letters, quarantine,
//!   field provenance, retention policies, and the operational audit log
//! - The sqlx migrations runner
//!
//! ## Example
//!
//! ```rust,ignore
//! use folio_db::Database;
//! use folio_core::{CheckpointRepository, JobKind};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/folio").await?;
//!
//!     let checkpoint = db
//!         .checkpoints
//!         .acquire("pricing_sync_main", JobKind::PricingSync, Duration::from_secs(3600))
//!         .await?;
//!     println!("lease held since {:?}", checkpoint.lease_acquired_at);
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod batches;
pub mod checkpoints;
pub mod dead_letters;
pub mod pool;
pub mod provenance;
pub mod quarantine;
pub mod retention;

// Test fixtures for integration tests
// Note: Always compiled so integration tests (in tests/) can use DEFAULT_TEST_DATABASE_URL
pub mod test_fixtures;

// Re-export core types
pub use folio_core::*;

// Re-export repository implementations
pub use audit::PgAuditRepository;
pub use batches::PgBatchMetricsRepository;
pub use checkpoints::PgCheckpointRepository;
pub use dead_letters::PgDeadLetterRepository;
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, PoolConfig};
pub use provenance::PgProvenanceRepository;
pub use quarantine::PgQuarantineRepository;
pub use retention::PgRetentionRepository;

/// Combined database context with all ingestion repositories.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Checkpoint repository: resumable state and the run lease.
    pub checkpoints: PgCheckpointRepository,
    /// Batch metrics repository for stall detection telemetry.
    pub batches: PgBatchMetricsRepository,
    /// Dead letter repository for failed units of work.
    pub dead_letters: PgDeadLetterRepository,
    /// Quarantine repository for ambiguous merges.
    pub quarantine: PgQuarantineRepository,
    /// Field provenance repository.
    pub provenance: PgProvenanceRepository,
    /// Retention policy and purge-proof repository.
    pub retention: PgRetentionRepository,
    /// Append-only operational audit repository.
    pub audit: PgAuditRepository,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            checkpoints: PgCheckpointRepository::new(pool.clone()),
            batches: PgBatchMetricsRepository::new(pool.clone()),
            dead_letters: PgDeadLetterRepository::new(pool.clone()),
            quarantine: PgQuarantineRepository::new(pool.clone()),
            provenance: PgProvenanceRepository::new(pool.clone()),
            retention: PgRetentionRepository::new(pool.clone()),
            audit: PgAuditRepository::new(pool.clone()),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}
