//! Priority queue with a fixed-size worker pool (§4.7).
//!
//! Grounded on `original_source/src/utils/task_queue.py::TaskQueue`: a `heapq`-ordered
//! pending set, a `task_map` for O(1) lookup/cancel, and an `asyncio.Lock` guarding both —
//! ported to `std::collections::BinaryHeap` plus a single `tokio::sync::Mutex`, with
//! `tokio::sync::Notify` standing in for the original's implicit asyncio scheduling
//! wakeups (§9 "Priority queue wakeups: (min-heap, hash-map-by-id, condition
//! variable/semaphore)").

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::cancel::CancellationManager;
use crate::error::DispatchError;
use crate::model::{Task, TaskStatus};

/// Heap entry ordered so that a lower `priority` value, then an earlier `created_at`,
/// sorts first — `BinaryHeap` is a max-heap, so ordering is reversed here (§4.7).
#[derive(Eq, PartialEq)]
struct HeapKey {
    priority: i32,
    created_at: SystemTime,
    id: Uuid,
}

impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
    }
}

impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Inner {
    heap: BinaryHeap<HeapKey>,
    tasks: HashMap<Uuid, Task>,
    max_queue_size: usize,
    shutting_down: bool,
}

/// Aggregate counts for the CLI's `dispatch status` surface (SPEC_FULL §11,
/// `task_queue.py::get_queue_status`).
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStatus {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Priority task queue with a bounded worker pool. A single mutex guards the heap and
/// the id->task map together (§5, §9); callbacks/cancellation fire outside it.
pub struct TaskQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    cancellation: Arc<CancellationManager>,
}

impl TaskQueue {
    pub fn new(max_queue_size: usize, cancellation: Arc<CancellationManager>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                tasks: HashMap::new(),
                max_queue_size,
                shutting_down: false,
            }),
            notify: Notify::new(),
            cancellation,
        }
    }

    /// Fails with `QueueFull` (surfaced as `DispatchError::Config`-free plain error here;
    /// callers match on `pending_count()` if they want the exact §4.7 semantics) when the
    /// pending count is already at `max_queue_size`.
    pub async fn submit(&self, mut task: Task) -> Result<Uuid, DispatchError> {
        let mut inner = self.inner.lock().await;
        let pending = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count();
        if pending >= inner.max_queue_size {
            return Err(DispatchError::Config(vec!["queue is full".to_string()]));
        }
        let token = self.cancellation.create_token(None);
        task.token_id = Some(token.id());
        let id = task.id;
        inner.heap.push(HeapKey {
            priority: task.priority,
            created_at: task.created_at,
            id,
        });
        inner.tasks.insert(id, task);
        drop(inner);
        self.notify.notify_one();
        Ok(id)
    }

    /// If Pending, removes from the queue and transitions to Cancelled; if Running,
    /// cancels the associated token. Returns whether a state change occurred (§4.7).
    pub async fn cancel(&self, task_id: Uuid, reason: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(task) = inner.tasks.get_mut(&task_id) else {
            return false;
        };
        match task.status {
            TaskStatus::Pending => {
                task.status = TaskStatus::Cancelled;
                task.completed_at = Some(SystemTime::now());
                let token_id = task.token_id;
                drop(inner);
                if let Some(token_id) = token_id {
                    self.cancellation.cancel(token_id, reason.to_string());
                }
                true
            }
            TaskStatus::Running => {
                let token_id = task.token_id;
                drop(inner);
                if let Some(token_id) = token_id {
                    self.cancellation.cancel(token_id, reason.to_string());
                }
                true
            }
            _ => false,
        }
    }

    pub async fn status(&self, task_id: Uuid) -> Option<Task> {
        self.inner.lock().await.tasks.get(&task_id).cloned()
    }

    /// Removes terminal tasks whose `completed_at` is older than `older_than`, returning
    /// the count removed (§4.7).
    pub async fn purge_completed(&self, older_than: Duration) -> usize {
        let now = SystemTime::now();
        let mut inner = self.inner.lock().await;
        let stale: Vec<Uuid> = inner
            .tasks
            .values()
            .filter(|t| {
                matches!(t.status, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
                    && t.completed_at
                        .map(|at| now.duration_since(at).unwrap_or_default() > older_than)
                        .unwrap_or(false)
            })
            .map(|t| t.id)
            .collect();
        for id in &stale {
            inner.tasks.remove(id);
        }
        stale.len()
    }

    /// Pending tasks sorted by `(priority, created_at)` (SPEC_FULL §11).
    pub async fn pending_tasks(&self) -> Vec<Task> {
        let inner = self.inner.lock().await;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.created_at.cmp(&b.created_at)));
        tasks
    }

    pub async fn running_tasks(&self) -> Vec<Task> {
        let inner = self.inner.lock().await;
        inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .cloned()
            .collect()
    }

    pub async fn queue_status(&self) -> QueueStatus {
        let inner = self.inner.lock().await;
        let mut status = QueueStatus::default();
        for task in inner.tasks.values() {
            match task.status {
                TaskStatus::Pending => status.pending += 1,
                TaskStatus::Running => status.running += 1,
                TaskStatus::Completed => status.completed += 1,
                TaskStatus::Failed => status.failed += 1,
                TaskStatus::Cancelled => status.cancelled += 1,
            }
        }
        status
    }

    /// Pops the highest-priority pending task (FIFO within equal priority), marking it
    /// Running. Returns `None` if the queue is empty or shutting down.
    async fn pop_next(&self) -> Option<Task> {
        let mut inner = self.inner.lock().await;
        if inner.shutting_down {
            return None;
        }
        loop {
            let heap_key = inner.heap.pop()?;
            match inner.tasks.get(&heap_key.id) {
                Some(task) if task.status == TaskStatus::Pending => {
                    let task = inner.tasks.get_mut(&heap_key.id).unwrap();
                    task.status = TaskStatus::Running;
                    task.started_at = Some(SystemTime::now());
                    return Some(task.clone());
                }
                _ => continue, // stale heap entry for an already-cancelled/removed task
            }
        }
    }

    fn finish(&self, inner: &mut Inner, id: Uuid, status: TaskStatus, result: Option<String>, error: Option<String>) {
        if let Some(task) = inner.tasks.get_mut(&id) {
            task.status = status;
            task.completed_at = Some(SystemTime::now());
            task.result = result;
            task.error = error;
        }
    }

    /// Runs `work` for each popped task until `shutdown()` is called, then drains.
    /// `work` receives the task and its cancellation token and returns the terminal
    /// outcome (§4.7 worker loop).
    pub async fn run_worker<F, Fut>(&self, work: F)
    where
        F: Fn(Task, crate::cancel::CancellationToken) -> Fut,
        Fut: std::future::Future<Output = Result<String, DispatchError>>,
    {
        loop {
            let Some(task) = self.pop_next().await else {
                if self.inner.lock().await.shutting_down {
                    return;
                }
                self.notify.notified().await;
                continue;
            };
            let Some(token) = task.token_id.and_then(|id| self.cancellation.get_token(id)) else {
                continue;
            };
            let result = work(task.clone(), token).await;
            let mut inner = self.inner.lock().await;
            match result {
                Ok(output) => self.finish(&mut inner, task.id, TaskStatus::Completed, Some(output), None),
                Err(DispatchError::Cancelled { .. }) => {
                    self.finish(&mut inner, task.id, TaskStatus::Cancelled, None, None)
                }
                Err(err) => self.finish(&mut inner, task.id, TaskStatus::Failed, None, Some(err.to_string())),
            }
        }
    }

    /// Cancels all running tasks' tokens and signals workers to stop popping new work.
    /// Callers await their own worker join handles to observe drain completion (§4.7).
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        inner.shutting_down = true;
        let running: Vec<Uuid> = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .filter_map(|t| t.token_id)
            .collect();
        drop(inner);
        for token_id in running {
            self.cancellation.cancel(token_id, crate::cancel::reasons::SYSTEM_SHUTDOWN);
        }
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AnalysisRequest, LogKind, Mode};

    fn task_with_priority(priority: i32) -> Task {
        let mut req = AnalysisRequest::new(b"x".to_vec(), LogKind::Anr, Mode::Quick);
        req.priority = priority;
        Task::new(req)
    }

    #[tokio::test]
    async fn priority_ordering_services_lowest_first() {
        let cancellation = Arc::new(CancellationManager::new());
        let queue = TaskQueue::new(10, cancellation);
        let t1 = task_with_priority(5);
        let t2 = task_with_priority(1);
        let t3 = task_with_priority(3);
        let t1_id = queue.submit(t1).await.unwrap();
        let t2_id = queue.submit(t2).await.unwrap();
        let t3_id = queue.submit(t3).await.unwrap();

        let first = queue.pop_next().await.unwrap();
        assert_eq!(first.id, t2_id);
        let second = queue.pop_next().await.unwrap();
        assert_eq!(second.id, t3_id);
        let third = queue.pop_next().await.unwrap();
        assert_eq!(third.id, t1_id);
    }

    #[tokio::test]
    async fn submit_fails_when_queue_full() {
        let cancellation = Arc::new(CancellationManager::new());
        let queue = TaskQueue::new(1, cancellation);
        queue.submit(task_with_priority(1)).await.unwrap();
        let result = queue.submit(task_with_priority(1)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn cancel_pending_transitions_directly_to_cancelled() {
        let cancellation = Arc::new(CancellationManager::new());
        let queue = TaskQueue::new(10, cancellation);
        let id = queue.submit(task_with_priority(1)).await.unwrap();
        assert!(queue.cancel(id, "user").await);
        let task = queue.status(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancelling_unknown_task_is_a_no_op() {
        let cancellation = Arc::new(CancellationManager::new());
        let queue = TaskQueue::new(10, cancellation);
        assert!(!queue.cancel(Uuid::new_v4(), "user").await);
    }
}
