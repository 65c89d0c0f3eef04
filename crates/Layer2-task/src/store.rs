//! Task table - the single shared mutable resource of the engine
//!
//! Lock order is always `tasks` then `running`.

use crate::event::{EventHub, TaskEvent};
use crate::state::TaskStatus;
use crate::task::{Task, TaskId};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How an execution ended, as observed by the worker
#[derive(Debug)]
pub(crate) enum Outcome {
    Completed(Value),
    Failed(String),
    TimedOut(Duration),
    Cancelled,
}

/// Filter for [`crate::TaskManager::list`]; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<String>,
}

impl TaskFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        if let Some(status) = self.status {
            if task.status != status {
                return false;
            }
        }
        if let Some(ref task_type) = self.task_type {
            if &task.task_type != task_type {
                return false;
            }
        }
        true
    }
}

/// Per-status tally of the table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct StatusCounts {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub timed_out: usize,
}

pub(crate) struct TaskStore {
    tasks: RwLock<HashMap<TaskId, Task>>,

    /// Cancellation handles of executions in flight
    running: Mutex<HashMap<TaskId, CancellationToken>>,

    events: EventHub,

    next_seq: AtomicU64,
}

impl TaskStore {
    pub(crate) fn new(event_capacity: usize) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            running: Mutex::new(HashMap::with_capacity(16)),
            events: EventHub::new(event_capacity),
            next_seq: AtomicU64::new(0),
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    pub(crate) async fn insert(&self, mut task: Task) {
        task.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let event = TaskEvent::new(task.id, task.task_type.clone(), None, task.status);
        let mut tasks = self.tasks.write().await;
        tasks.insert(task.id, task);
        self.events.emit(event);
    }

    /// Drop a record that never made it into the queue
    pub(crate) async fn remove(&self, id: TaskId) -> Option<Task> {
        self.tasks.write().await.remove(&id)
    }

    pub(crate) async fn get(&self, id: TaskId) -> Option<Task> {
        self.tasks.read().await.get(&id).cloned()
    }

    pub(crate) async fn list(&self, filter: &TaskFilter, limit: usize) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        let mut matched: Vec<Task> = tasks.values().filter(|t| filter.matches(t)).cloned().collect();
        drop(tasks);

        matched.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.seq.cmp(&a.seq))
        });
        matched.truncate(limit);
        matched
    }

    /// Pending -> Running, registering the execution's cancellation handle
    /// under the same lock so a concurrent `cancel` always finds it.
    ///
    /// Events are emitted with the table lock held so subscribers see each
    /// task's transitions in order.
    pub(crate) async fn begin(&self, id: TaskId, token: CancellationToken) -> Option<Task> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id)?;
        if !task.start() {
            debug!("Skipping task {}: status is {}", id.short(), task.status);
            return None;
        }
        self.running.lock().await.insert(id, token);

        self.events.emit(TaskEvent::new(
            id,
            task.task_type.clone(),
            Some(TaskStatus::Pending),
            TaskStatus::Running,
        ));
        Some(task.clone())
    }

    /// Apply the outcome of an execution and release its handle.
    ///
    /// Returns the status the record ends up in. A task cancelled while it
    /// was running stays `Cancelled` and the late outcome is discarded.
    pub(crate) async fn finish(&self, id: TaskId, outcome: Outcome) -> Option<TaskStatus> {
        let mut tasks = self.tasks.write().await;
        self.running.lock().await.remove(&id);
        let task = tasks.get_mut(&id)?;

        let from = task.status;
        let applied = match outcome {
            Outcome::Completed(value) => task.complete(value),
            Outcome::Failed(message) => task.fail(message),
            Outcome::TimedOut(limit) => task.time_out(limit),
            Outcome::Cancelled => task.cancel(),
        };

        let status = task.status;
        if applied {
            self.events
                .emit(TaskEvent::new(id, task.task_type.clone(), Some(from), status));
        } else {
            debug!("Discarding late outcome for task {} ({})", id.short(), status);
        }
        Some(status)
    }

    /// Flag a non-terminal task `Cancelled` and signal its execution, if any
    pub(crate) async fn cancel(&self, id: TaskId) -> bool {
        let mut tasks = self.tasks.write().await;
        let Some(task) = tasks.get_mut(&id) else {
            return false;
        };

        let from = task.status;
        if !task.cancel() {
            return false;
        }
        if let Some(token) = self.running.lock().await.get(&id) {
            token.cancel();
        }

        self.events.emit(TaskEvent::new(
            id,
            task.task_type.clone(),
            Some(from),
            TaskStatus::Cancelled,
        ));
        true
    }

    /// Signal every execution in flight; statuses are settled by the workers
    pub(crate) async fn cancel_running(&self) -> usize {
        let running = self.running.lock().await;
        for token in running.values() {
            token.cancel();
        }
        running.len()
    }

    pub(crate) async fn update_progress(
        &self,
        id: TaskId,
        progress: f32,
        message: Option<String>,
    ) -> bool {
        let mut tasks = self.tasks.write().await;
        tasks
            .get_mut(&id)
            .map(|task| task.set_progress(progress, message))
            .unwrap_or(false)
    }

    /// Remove terminal tasks created before `cutoff`
    pub(crate) async fn cleanup_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, task| !(task.is_terminal() && task.created_at < cutoff));
        before - tasks.len()
    }

    pub(crate) async fn counts(&self) -> StatusCounts {
        let tasks = self.tasks.read().await;
        let mut counts = StatusCounts {
            total: tasks.len(),
            ..StatusCounts::default()
        };

        for task in tasks.values() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Cancelled => counts.cancelled += 1,
                TaskStatus::TimedOut => counts.timed_out += 1,
            }
        }
        counts
    }
}
