//! Cooperative, token-based cancellation (§4.1).
//!
//! Grounded on `original_source/src/core/cancellation.py`'s `CancellationToken`/
//! `CancellationManager` pair, reworked from a `threading.Lock`-guarded object into
//! `Arc<Mutex<..>>` shared state plus a `Mutex<Vec<Callback>>` fired outside the state
//! lock (§5 "callback invocations happen outside the component's own lock").

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use uuid::Uuid;

use crate::error::DispatchError;

type Callback = Box<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone)]
struct TokenState {
    cancelled: bool,
    reason: Option<String>,
    cancelled_at: Option<SystemTime>,
}

/// A cooperative cancellation signal. Cheaply cloneable; clones share the same
/// underlying state. State machine: `Live -> Cancelled`, no reverse edge.
#[derive(Clone)]
pub struct CancellationToken {
    id: Uuid,
    state: Arc<Mutex<TokenState>>,
    callbacks: Arc<Mutex<Vec<Callback>>>,
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken").field("id", &self.id).finish()
    }
}

impl CancellationToken {
    pub fn new(id: Option<Uuid>) -> Self {
        Self {
            id: id.unwrap_or_else(Uuid::new_v4),
            state: Arc::new(Mutex::new(TokenState {
                cancelled: false,
                reason: None,
                cancelled_at: None,
            })),
            callbacks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().unwrap().cancelled
    }

    pub fn reason(&self) -> Option<String> {
        self.state.lock().unwrap().reason.clone()
    }

    pub fn cancelled_at(&self) -> Option<SystemTime> {
        self.state.lock().unwrap().cancelled_at
    }

    /// Idempotent: the first call flips the flag, records the reason and timestamp, and
    /// fires every registered callback in registration order; later calls are no-ops.
    /// A callback that panics is caught and does not block its siblings.
    pub fn cancel(&self, reason: impl Into<String>) {
        let already = {
            let mut state = self.state.lock().unwrap();
            if state.cancelled {
                true
            } else {
                state.cancelled = true;
                state.reason = Some(reason.into());
                state.cancelled_at = Some(SystemTime::now());
                false
            }
        };
        if already {
            return;
        }
        let callbacks = self.callbacks.lock().unwrap();
        for cb in callbacks.iter() {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb()));
        }
    }

    /// Fails with `Cancelled(reason)` if the token has been cancelled.
    pub fn check(&self) -> Result<(), DispatchError> {
        let state = self.state.lock().unwrap();
        if state.cancelled {
            Err(DispatchError::Cancelled {
                reason: state.reason.clone().unwrap_or_else(|| "cancelled".to_string()),
            })
        } else {
            Ok(())
        }
    }

    /// Registers a fire-on-cancel callback. If the token is already cancelled, `cb` runs
    /// synchronously before this call returns.
    pub fn add_callback<F>(&self, cb: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let already_cancelled = self.is_cancelled();
        if already_cancelled {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(&cb));
        }
        self.callbacks.lock().unwrap().push(Box::new(cb));
    }
}

/// A named reason a dispatch's token was cancelled for, surfaced on the terminal event.
pub mod reasons {
    pub const USER_CANCELLED: &str = "user_cancelled";
    pub const TIMEOUT: &str = "timeout";
    pub const BUDGET_EXCEEDED: &str = "budget_exceeded";
    pub const ERROR: &str = "error";
    pub const SYSTEM_SHUTDOWN: &str = "system_shutdown";
}

/// Owns the id -> token mapping for a process (§4.1, §9 "process-wide singleton").
#[derive(Default)]
pub struct CancellationManager {
    tokens: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl CancellationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_token(&self, id: Option<Uuid>) -> CancellationToken {
        let token = CancellationToken::new(id);
        self.tokens.lock().unwrap().insert(token.id(), token.clone());
        token
    }

    pub fn get_token(&self, id: Uuid) -> Option<CancellationToken> {
        self.tokens.lock().unwrap().get(&id).cloned()
    }

    pub fn cancel(&self, id: Uuid, reason: impl Into<String>) -> bool {
        match self.get_token(id) {
            Some(token) => {
                token.cancel(reason);
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let tokens: Vec<_> = self.tokens.lock().unwrap().values().cloned().collect();
        for token in tokens {
            token.cancel(reason.clone());
        }
    }

    /// Removes tokens whose `cancelled_at` is older than `age`. Live tokens are untouched.
    pub fn cleanup_older_than(&self, age: Duration) -> usize {
        let now = SystemTime::now();
        let mut tokens = self.tokens.lock().unwrap();
        let before = tokens.len();
        tokens.retain(|_, token| match token.cancelled_at() {
            Some(at) => now.duration_since(at).unwrap_or_default() < age,
            None => true,
        });
        before - tokens.len()
    }

    pub fn remove(&self, id: Uuid) -> bool {
        self.tokens.lock().unwrap().remove(&id).is_some()
    }

    pub fn active_count(&self) -> usize {
        self.tokens
            .lock()
            .unwrap()
            .values()
            .filter(|t| !t.is_cancelled())
            .count()
    }

    pub fn cancelled_count(&self) -> usize {
        self.tokens
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.is_cancelled())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn cancel_is_idempotent_and_monotonic() {
        let token = CancellationToken::new(None);
        assert!(token.check().is_ok());
        token.cancel(reasons::USER_CANCELLED);
        let first_at = token.cancelled_at();
        assert!(token.check().is_err());
        token.cancel("second reason");
        assert_eq!(token.reason().as_deref(), Some(reasons::USER_CANCELLED));
        assert_eq!(token.cancelled_at(), first_at);
    }

    #[test]
    fn callbacks_fire_exactly_once_in_order() {
        let token = CancellationToken::new(None);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            token.add_callback(move || order.lock().unwrap().push(i));
        }
        token.cancel("x");
        token.cancel("x");
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn late_callback_on_already_cancelled_token_fires_immediately() {
        let token = CancellationToken::new(None);
        token.cancel("x");
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        token.add_callback(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_callback_does_not_block_siblings() {
        let token = CancellationToken::new(None);
        let ran = Arc::new(AtomicUsize::new(0));
        token.add_callback(|| panic!("boom"));
        let ran2 = ran.clone();
        token.add_callback(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        token.cancel("x");
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn manager_cancel_all_and_active_count() {
        let mgr = CancellationManager::new();
        let a = mgr.create_token(None);
        let _b = mgr.create_token(None);
        assert_eq!(mgr.active_count(), 2);
        mgr.cancel(a.id(), "x");
        assert_eq!(mgr.active_count(), 1);
        assert_eq!(mgr.cancelled_count(), 1);
        mgr.cancel_all("shutdown");
        assert_eq!(mgr.active_count(), 0);
    }

    #[test]
    fn cleanup_older_than_removes_only_stale_cancelled_tokens() {
        let mgr = CancellationManager::new();
        let a = mgr.create_token(None);
        mgr.cancel(a.id(), "x");
        assert_eq!(mgr.cleanup_older_than(Duration::from_secs(3600)), 0);
        assert_eq!(mgr.cleanup_older_than(Duration::from_secs(0)), 1);
        assert!(mgr.get_token(a.id()).is_none());
    }
}
