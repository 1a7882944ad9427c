use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::job::JobStatus;

/// Application-wide error types for trawl.
#[derive(Error, Debug)]
pub enum AppError {
    /// Connection-level failure (refused, reset, DNS).
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request exceeded its overall deadline.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The remote explicitly asked us to slow down.
    #[error("Rate limited by remote (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Remote-side error that is expected to clear on its own (5xx, 408).
    #[error("Remote error (HTTP {status}): {message}")]
    RemoteError { status: u16, message: String },

    /// The resource is gone or the request is invalid; retrying won't help.
    #[error("Permanent failure{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    PermanentFailure { status: Option<u16>, message: String },

    /// Not enough local disk or memory to hold this target.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The circuit guarding this operation is open.
    #[error("Circuit breaker '{name}' is open. Retry after {} seconds.", .retry_after.as_secs())]
    CircuitOpen { name: String, retry_after: Duration },

    /// Response body could not be interpreted.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Local write failed for a reason other than running out of space.
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// The requested control operation is not legal in the job's current state.
    #[error("Job {job_id} is {status}, cannot {action}")]
    InvalidJobState {
        job_id: Uuid,
        status: JobStatus,
        action: &'static str,
    },

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

/// Coarse classification that drives retry and reporting decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    RateLimited,
    Permanent,
    ResourceExhausted,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient_network",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Permanent => "permanent",
            FailureKind::ResourceExhausted => "resource_exhausted",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AppError {
    pub fn kind(&self) -> FailureKind {
        match self {
            AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::RemoteError { .. }
            | AppError::CircuitOpen { .. } => FailureKind::Transient,
            AppError::RateLimited { .. } => FailureKind::RateLimited,
            AppError::ResourceExhausted(_) => FailureKind::ResourceExhausted,
            _ => FailureKind::Permanent,
        }
    }

    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            FailureKind::Transient | FailureKind::RateLimited
        )
    }

    /// Returns true if this error should trip the circuit breaker.
    ///
    /// A rejected call (`CircuitOpen`) never counts against the circuit that
    /// rejected it.
    pub fn should_trip_circuit(&self) -> bool {
        match self {
            AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::RateLimited { .. }
            | AppError::RemoteError { .. } => true,
            _ => false,
        }
    }

    /// Map a local I/O failure, keeping "disk full" distinct from other errors.
    pub fn from_io(context: &str, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::StorageFull {
            AppError::ResourceExhausted(format!("{context}: {err}"))
        } else {
            AppError::StorageError(format!("{context}: {err}"))
        }
    }
}
