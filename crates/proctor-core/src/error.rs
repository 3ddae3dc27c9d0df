//! Engine and boundary error types.
//!
//! `BackendError` is defined here rather than in `proctor-backends` so the
//! sync and submission layers can downcast boundary failures and decide
//! whether to retry without string matching.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the attempt engine to its caller.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The target section or attempt is no longer in progress. Refresh and retry.
    #[error("stale attempt state: {reason}")]
    StaleAttemptState { reason: String },

    /// The operation does not apply (wrong setter for the question kind,
    /// out-of-range index, missing confirmation).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The persistence or grading boundary failed. In-memory state is kept.
    #[error("persistence failure: {message}")]
    PersistenceFailure { message: String, retryable: bool },

    /// A wall-clock gap between ticks was detected and clamped.
    #[error("clock drift of {gap_secs}s detected")]
    ClockDrift { gap_secs: u64 },

    #[error("not found: {0}")]
    NotFound(String),
}

impl EngineError {
    pub fn stale(reason: impl Into<String>) -> Self {
        EngineError::StaleAttemptState {
            reason: reason.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        EngineError::InvalidOperation(message.into())
    }

    /// Returns `true` if the caller may retry the same call unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::PersistenceFailure {
                retryable: true,
                ..
            }
        )
    }

    /// Classify a boundary failure. Unknown errors are treated as transient.
    pub fn from_boundary(err: anyhow::Error) -> Self {
        match err.downcast_ref::<BackendError>() {
            Some(BackendError::NotFound(what)) => EngineError::NotFound(what.clone()),
            Some(backend) => EngineError::PersistenceFailure {
                message: backend.to_string(),
                retryable: !backend.is_permanent(),
            },
            None => EngineError::PersistenceFailure {
                message: format!("{err:#}"),
                retryable: true,
            },
        }
    }
}

/// Errors that can occur when talking to the storage/API layer.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The attempt, template, or question does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The API token was rejected.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The server refused the write (e.g. attempt already finalized).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The API returned a 429 rate limit response.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// The API returned an error response.
    #[error("API error (HTTP {status}): {message}")]
    ApiError { status: u16, message: String },

    /// The request timed out.
    #[error("request timed out after {0}s")]
    Timeout(u64),

    /// A network error occurred.
    #[error("network error: {0}")]
    NetworkError(String),
}

impl BackendError {
    /// Returns `true` if this error is permanent and should not be retried.
    pub fn is_permanent(&self) -> bool {
        match self {
            BackendError::NotFound(_)
            | BackendError::Unauthorized(_)
            | BackendError::Conflict(_) => true,
            BackendError::ApiError { status, .. } => (400..500).contains(status),
            _ => false,
        }
    }

    /// Returns the retry-after delay in milliseconds, if applicable.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            BackendError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }
}
