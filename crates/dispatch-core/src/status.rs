//! Publish-subscribe status manager for progress, messages, and usage (§4.6).
//!
//! Grounded on `original_source/src/utils/status_manager.py::EnhancedStatusManager`,
//! ported from `asyncio.Lock` + listener callables to `tokio::sync::Mutex` + boxed
//! `Fn(StatusSnapshot)` subscribers, matching §5's "Status Manager (single mutex on the
//! state, copy-on-read snapshots)" and "callback invocations happen outside the
//! component's own lock" discipline.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};

use serde::Serialize;
use tokio::sync::Mutex;

use crate::model::{ProgressState, UsageCounters};

/// Severity of a `record_message` entry (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageLevel {
    Info,
    Warning,
    Error,
    Success,
    Progress,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusMessage {
    pub level: MessageLevel,
    pub text: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub details: Option<serde_json::Value>,
}

/// Immutable copy of the current state (§4.6). Subscribers may retain past snapshots
/// without them mutating underneath them.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub status: String,
    pub progress: ProgressState,
    pub progress_percentage: f64,
    pub estimated_remaining_secs: Option<f64>,
    pub usage: UsageCounters,
    pub recent_messages: Vec<StatusMessage>,
    pub has_errors: bool,
    pub is_cancelled: bool,
}

const MAX_RECENT_MESSAGES: usize = 10;

/// Handle returned by [`StatusManager::subscribe`], passed back to [`StatusManager::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber = Box<dyn Fn(&StatusSnapshot) + Send + Sync>;

struct Inner {
    status: String,
    progress: ProgressState,
    usage: UsageCounters,
    messages: VecDeque<StatusMessage>,
    max_messages: usize,
}

/// Publish-subscribe hub for one dispatch's status. Mutations take the single internal
/// lock; subscriber callbacks run after the lock is released.
pub struct StatusManager {
    inner: Mutex<Inner>,
    subscribers: StdMutex<Vec<(SubscriptionId, Subscriber)>>,
    next_subscription_id: std::sync::atomic::AtomicU64,
}

impl Default for StatusManager {
    fn default() -> Self {
        Self::new(100)
    }
}

impl StatusManager {
    pub fn new(max_messages: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                status: "idle".to_string(),
                progress: ProgressState::default(),
                usage: UsageCounters::default(),
                messages: VecDeque::new(),
                max_messages,
            }),
            subscribers: StdMutex::new(Vec::new()),
            next_subscription_id: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Registers `cb` to be called with every subsequent snapshot. Returns a handle that
    /// can be passed to [`Self::unsubscribe`] (§4.6).
    pub fn subscribe<F>(&self, cb: F) -> SubscriptionId
    where
        F: Fn(&StatusSnapshot) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst));
        self.subscribers.lock().unwrap().push((id, Box::new(cb)));
        id
    }

    /// Removes a previously registered subscriber. No-op if `id` is unknown or was already
    /// removed (§4.6).
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.lock().unwrap().retain(|(sub_id, _)| *sub_id != id);
    }

    pub async fn set_status(&self, status: impl Into<String>) {
        {
            let mut inner = self.inner.lock().await;
            inner.status = status.into();
        }
        self.notify().await;
    }

    pub async fn update_progress(
        &self,
        current_chunk: usize,
        total_chunks: usize,
        processed_tokens: u64,
        estimated_total_tokens: u64,
    ) {
        {
            let mut inner = self.inner.lock().await;
            inner.progress.current_chunk = current_chunk;
            inner.progress.total_chunks = total_chunks;
            inner.progress.processed_tokens = processed_tokens;
            inner.progress.estimated_total_tokens = estimated_total_tokens;
        }
        self.record_message_inner(MessageLevel::Progress, None, None).await;
        self.notify().await;
    }

    pub async fn record_message(&self, level: MessageLevel, text: impl Into<String>, details: Option<serde_json::Value>) {
        self.record_message_inner(level, Some(text.into()), details).await;
        self.notify().await;
    }

    async fn record_message_inner(&self, level: MessageLevel, text: Option<String>, details: Option<serde_json::Value>) {
        let mut inner = self.inner.lock().await;
        let text = text.unwrap_or_else(|| format!("progress: {:.1}%", inner.progress.percentage()));
        let max = inner.max_messages;
        inner.messages.push_back(StatusMessage {
            level,
            text,
            timestamp: chrono::Utc::now(),
            details,
        });
        while inner.messages.len() > max {
            inner.messages.pop_front();
        }
    }

    pub async fn record_usage(&self, input_tokens: u64, output_tokens: u64, cost_usd: f64) {
        {
            let mut inner = self.inner.lock().await;
            inner.usage.add_request(input_tokens, output_tokens, cost_usd);
        }
        self.notify().await;
    }

    pub async fn record_error(&self, text: impl Into<String>) {
        {
            let mut inner = self.inner.lock().await;
            inner.usage.add_error();
        }
        self.record_message(MessageLevel::Error, text, None).await;
    }

    pub async fn record_cancellation(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut inner = self.inner.lock().await;
            inner.usage.add_cancellation();
        }
        self.record_message(MessageLevel::Warning, format!("analysis cancelled: {reason}"), None)
            .await;
    }

    pub async fn reset(&self) {
        {
            let mut inner = self.inner.lock().await;
            inner.messages.clear();
            inner.progress = ProgressState::default();
            inner.usage = UsageCounters::default();
            inner.status = "idle".to_string();
        }
        self.notify().await;
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        let inner = self.inner.lock().await;
        self.snapshot_locked(&inner)
    }

    fn snapshot_locked(&self, inner: &Inner) -> StatusSnapshot {
        StatusSnapshot {
            status: inner.status.clone(),
            progress: inner.progress,
            progress_percentage: inner.progress.percentage(),
            estimated_remaining_secs: inner.progress.estimated_remaining().map(|d| d.as_secs_f64()),
            usage: inner.usage,
            recent_messages: inner
                .messages
                .iter()
                .rev()
                .take(MAX_RECENT_MESSAGES)
                .rev()
                .cloned()
                .collect(),
            has_errors: inner.usage.errors > 0,
            is_cancelled: inner.usage.cancellations > 0,
        }
    }

    async fn notify(&self) {
        let snapshot = self.snapshot().await;
        let subscribers = self.subscribers.lock().unwrap();
        for (_, sub) in subscribers.iter() {
            sub(&snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn progress_percentage_zero_when_no_total() {
        let manager = StatusManager::default();
        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot.progress_percentage, 0.0);
    }

    #[tokio::test]
    async fn update_progress_notifies_subscribers() {
        let manager = Arc::new(StatusManager::default());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        manager.subscribe(move |snap| seen2.lock().unwrap().push(snap.progress.current_chunk));
        manager.update_progress(1, 4, 10, 40).await;
        manager.update_progress(2, 4, 20, 40).await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn unsubscribe_stops_further_notifications() {
        let manager = Arc::new(StatusManager::default());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        let id = manager.subscribe(move |snap| seen2.lock().unwrap().push(snap.progress.current_chunk));
        manager.update_progress(1, 4, 10, 40).await;
        manager.unsubscribe(id);
        manager.update_progress(2, 4, 20, 40).await;
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn record_error_and_cancellation_set_flags() {
        let manager = StatusManager::default();
        manager.record_error("boom").await;
        let snapshot = manager.snapshot().await;
        assert!(snapshot.has_errors);
        manager.record_cancellation("user").await;
        let snapshot = manager.snapshot().await;
        assert!(snapshot.is_cancelled);
    }

    #[tokio::test]
    async fn recent_messages_bounded() {
        let manager = StatusManager::new(3);
        for i in 0..5 {
            manager
                .record_message(MessageLevel::Info, format!("m{i}"), None)
                .await;
        }
        let snapshot = manager.snapshot().await;
        assert!(snapshot.recent_messages.len() <= 3);
        assert_eq!(snapshot.recent_messages.last().unwrap().text, "m4");
    }
}
