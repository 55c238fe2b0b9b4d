//! # folio-core
//!
//! Core types, traits, and resilience primitives for the folio catalog
//! ingestion engine.
//!
//! This crate provides the foundational data structures and trait
//! definitions that the other folio crates depend on: the checkpoint and
//! telemetry models, the pure circuit-breaker state machine, typed
//! resumption cursors, and the repository/adapter seams implemented by
//! `folio-db` and wired together by `folio-pipeline`.

pub mod breaker;
pub mod cursor;
pub mod defaults;
pub mod error;
pub mod logging;
pub mod models;
pub mod source;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use breaker::{
    BreakerConfig, BreakerState, CallOutcome, CircuitBreaker, CircuitState, Decision,
    TransitionEvent,
};
pub use cursor::CursorState;
pub use error::{Error, Result};
pub use models::*;
pub use source::{
    DuplicateCandidate, EntityStore, FieldValue, NormalizedRecord, SourceAdapter, SourceMeta,
    SourcePage,
};
pub use traits::*;
pub use uuid_utils::new_v7;
