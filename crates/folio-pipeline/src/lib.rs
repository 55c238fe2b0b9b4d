//! # folio-pipeline
//!
//! Ingestion pipeline orchestration and resilience engine for folio.
//!
//! This crate wires the persisted state in `folio-db` to the resilience
//! primitives in `folio-core`:
//! - [`IngestRunner`] executes one resumable invocation of a named job,
//!   gated per call by the job's circuit breaker and rate limiter, with
//!   per-record DLQ capture and quarantine/provenance merge policy
//! - [`StallDetector`] sweeps for silent batches and performs bounded
//!   self-healing of stale leases
//! - [`DlqRetryScheduler`] replays dead-lettered units of work
//! - [`RetentionSweeper`] enforces bounded telemetry lifetime
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use folio_core::JobKind;
//! use folio_db::Database;
//! use folio_pipeline::{
//!     IngestRunner, JobSpec, PipelineRegistry, RunnerConfig, StoreHandles,
//! };
//!
//! let db = Database::connect("postgres://...").await?;
//! let registry = PipelineRegistry::builder()
//!     .register(JobSpec::new("pricing_sync_main", JobKind::PricingSync, pricing_adapter))
//!     .build();
//!
//! let runner = IngestRunner::new(
//!     StoreHandles::from_database(&db),
//!     entity_store,
//!     registry,
//!     RunnerConfig::from_env(),
//! );
//!
//! // Invoked by the scheduler; resumes from the persisted cursor.
//! let report = runner.run_job("pricing_sync_main").await?;
//! ```

pub mod dlq;
pub mod merge;
pub mod rate_limit;
pub mod registry;
pub mod retention;
pub mod runner;
pub mod stall;
pub mod stores;
pub mod testing;

// Re-export core types
pub use folio_core::*;

pub use dlq::{DlqConfig, DlqRetryScheduler, DlqSchedulerHandle, DlqSweepReport};
pub use merge::{ApplyOutcome, MergeConfig, MergePlan};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use registry::{JobEntry, JobSpec, PipelineRegistry, PipelineRegistryBuilder};
pub use retention::{RetentionConfig, RetentionSweeper, RetentionSweeperHandle};
pub use runner::{IngestRunner, PipelineEvent, RunOutcome, RunReport, RunnerConfig};
pub use stall::{stall_threshold, StallConfig, StallDetector, StallDetectorHandle};
pub use stores::StoreHandles;
