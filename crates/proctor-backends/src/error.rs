//! Backend error mapping.
//!
//! The error type itself lives in `proctor-core` so the engine can classify
//! failures; this module turns transport and HTTP failures into it.

pub use proctor_core::error::BackendError;

/// Default wait when a 429 carries no usable `retry-after` header.
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// Map a transport-level reqwest failure.
pub(crate) fn from_transport(e: reqwest::Error, base_url: &str, timeout_secs: u64) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout(timeout_secs)
    } else if e.is_connect() {
        BackendError::NetworkError(format!("backend not reachable at {base_url}: {e}"))
    } else {
        BackendError::NetworkError(e.to_string())
    }
}

/// Map a non-success HTTP status. `retry_after` is the raw header value.
pub(crate) fn from_status(status: u16, retry_after: Option<&str>, body: String) -> BackendError {
    match status {
        401 | 403 => BackendError::Unauthorized(body),
        404 => BackendError::NotFound(body),
        409 => BackendError::Conflict(body),
        429 => BackendError::RateLimited {
            retry_after_ms: retry_after
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
                * 1000,
        },
        _ => BackendError::ApiError {
            status,
            message: body,
        },
    }
}
