//! Error taxonomy for the dispatch substrate.
//!
//! Variants map 1:1 onto the error kinds a caller can observe on the
//! streaming path (see [`crate::events::DispatchEvent`]); `retry_after` and
//! `reason` fields carry the detail callers need without downcasting.

use std::time::Duration;

/// A single problem found while validating a [`crate::config::DispatchConfig`].
/// Startup validation collects every problem before failing, rather than
/// stopping at the first one.
pub type ConfigProblems = Vec<String>;

#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum DispatchError {
    #[error("invalid log kind: {0}")]
    InvalidKind(String),

    #[error("invalid analysis mode: {0}")]
    InvalidMode(String),

    #[error("file too large: {size} bytes exceeds limit of {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("no provider available{}", .hint.as_deref().map(|h| format!(" (hint: {h})")).unwrap_or_default())]
    NoProvider { hint: Option<String> },

    #[error("estimated cost {cost} exceeds budget {budget}")]
    BudgetExceeded { cost: f64, budget: f64 },

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("transient provider error: {0}")]
    ProviderTransient(String),

    #[error("provider error: {0}")]
    ProviderFatal(String),

    #[error("timed out")]
    Timeout,

    #[error("cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("cache error: {0}")]
    CacheError(String),

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("invalid configuration:\n{}", .0.join("\n"))]
    Config(ConfigProblems),
}

impl From<std::io::Error> for DispatchError {
    fn from(err: std::io::Error) -> Self {
        DispatchError::CacheError(err.to_string())
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::StorageError(err.to_string())
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for DispatchError {
    fn from(err: sqlx::Error) -> Self {
        DispatchError::StorageError(err.to_string())
    }
}

impl DispatchError {
    /// Whether the dispatch engine may retry this error against the same
    /// provider (§7: only `ProviderTransient`, and only once).
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::ProviderTransient(_))
    }
}
