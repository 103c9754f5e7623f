//! Shared error type for remote access. Failure class decides retry and
//! isolation behavior: Transient is retried by the client with backoff,
//! Permanent and NotFound skip the unit, everything else is reported as-is.

use thiserror::Error;

/// Remote catalog/content errors.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Invalid URL: {input}: {reason}")]
    InvalidUrl { input: String, reason: String },

    /// Bad or removed remote identifier. Reported to the user, no local change.
    #[error("Not found (HTTP 404): {url}")]
    NotFound { url: String },

    /// Network hiccup or server-side overload: timeout, connection failure,
    /// HTTP 5xx, or HTTP 429. Retryable.
    #[error("Transient failure fetching {url}: {reason}")]
    Transient { url: String, reason: String },

    /// Non-retryable HTTP failure (4xx other than 404/429).
    #[error("HTTP {status} when fetching: {url}")]
    Permanent { status: u16, url: String },

    #[error("Failed to read response body from {url}: {reason}")]
    BodyRead { url: String, reason: String },

    #[error("Could not parse catalog page {url}: {message}")]
    ParseCatalog { url: String, message: String },

    #[error("Could not parse chapter page {url}: {message}")]
    ParseChapter { url: String, message: String },
}

impl RemoteError {
    /// Whether the client should retry the request with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient { .. })
    }
}
