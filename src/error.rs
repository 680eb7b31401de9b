//! Error types for deckhand.
//!
//! Each component owns an enum; nothing here is fatal to the process.
//! Upstream failures split into transport-level (`Unavailable`) and
//! non-2xx (`Rejected`) so callers can retry the former and surface the
//! latter.

use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(String),

    #[error("invalid value for {var}: {reason}")]
    InvalidVar { var: String, reason: String },
}

/// Credential refresh errors.
///
/// Raised only when an authority has never produced a token; a failed
/// refresh with a previous token available is logged and tolerated.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("login to {authority} failed: {reason}")]
    RefreshFailed { authority: String, reason: String },
}

/// Upstream request errors.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The HTTP layer itself failed (network, DNS, timeout).
    #[error("upstream unavailable: {reason}")]
    Unavailable { reason: String },

    /// The upstream answered with a non-success status.
    #[error("upstream rejected request: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl UpstreamError {
    /// Transport failures are worth retrying; rejections are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, UpstreamError::Unavailable { .. })
    }
}

/// Snapshot rebuild and persistence errors.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("snapshot rebuild exceeded {seconds}s deadline")]
    DeadlineExceeded { seconds: u64 },

    #[error("failed to persist snapshot {name}: {source}")]
    Persist {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("template directory scan failed: {0}")]
    Scan(#[from] std::io::Error),
}

/// Deploy operation errors.
#[derive(Debug, Error)]
pub enum DeployError {
    /// Malformed request — surfaced to the caller verbatim, never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("template rendering failed: {0}")]
    Render(String),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}
