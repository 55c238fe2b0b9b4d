//! Error types for folio.

use thiserror::Error;

/// Result type alias using folio's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for folio operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Another process already holds the lease for this job
    #[error("Job already running: {0}")]
    AlreadyRunning(String),

    /// The circuit breaker for this job is open; retry after the given delay
    #[error("Circuit open for {job}: retry after {retry_after_secs}s")]
    CircuitOpen { job: String, retry_after_secs: u64 },

    /// No rate-limit slot became available within the acquire timeout
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// External source call failed
    #[error("Source error: {0}")]
    Source(String),

    /// A record failed validation or normalization
    #[error("Validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Source(e.to_string())
    }
}

impl Error {
    /// Whether this error is transient from the perspective of a source
    /// call: worth recording against the circuit breaker and retrying,
    /// as opposed to a per-record permanent failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Source(_) | Error::RateLimited(_) | Error::CircuitOpen { .. }
        )
    }
}
