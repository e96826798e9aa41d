//! Outbound event contract for `Dispatch::analyze_stream` (§6).
//!
//! This is the only thing an inbound control-surface adapter (HTTP/SSE façade, CLI, …)
//! ever sees; it never observes a provider's native `StreamEvent` (§9 "do not expose
//! per-provider event types to callers").

use uuid::Uuid;

use crate::error::DispatchError;

/// One event in the ordered sequence consumed by a caller of `analyze_stream` (§6).
/// `Start` is always first; exactly one of `Complete`/`Cancelled`/`Error` is always last.
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    Start { analysis_id: Uuid },
    Content { text: String },
    Progress { percent: f64, chunks: (usize, usize), tokens: (u64, u64) },
    Message { level: crate::status::MessageLevel, text: String },
    Cancelled { reason: String },
    Error { kind: ErrorKind, text: String },
    Complete { tokens_in: u64, tokens_out: u64, cost: f64 },
}

/// The caller-facing error taxonomy (§7), independent of `DispatchError`'s internal
/// `Display` text so that the wire contract doesn't shift if an error message wording
/// changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidKind,
    InvalidMode,
    FileTooLarge,
    NoProvider,
    BudgetExceeded,
    RateLimited,
    ProviderFatal,
    Internal,
}

impl From<&DispatchError> for ErrorKind {
    fn from(err: &DispatchError) -> Self {
        match err {
            DispatchError::InvalidKind(_) => ErrorKind::InvalidKind,
            DispatchError::InvalidMode(_) => ErrorKind::InvalidMode,
            DispatchError::FileTooLarge { .. } => ErrorKind::FileTooLarge,
            DispatchError::NoProvider { .. } => ErrorKind::NoProvider,
            DispatchError::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
            DispatchError::RateLimited { .. } => ErrorKind::RateLimited,
            DispatchError::ProviderTransient(_) | DispatchError::ProviderFatal(_) => ErrorKind::ProviderFatal,
            _ => ErrorKind::Internal,
        }
    }
}
