//! Task Manager - single entry point for submitting, inspecting, cancelling
//! and reaping tasks
//!
//! Features:
//! - Idempotent start of a fixed-size worker pool
//! - Fire-and-forget submission with optional per-task deadline
//! - Point lookups, filtered listing, statistics
//! - Cancellation of pending and in-flight work
//! - Retention cleanup (on demand or periodic)
//! - Graceful shutdown

use crate::event::TaskEvent;
use crate::handler::HandlerRegistry;
use crate::job::{job, TaskContext};
use crate::pool::WorkerPool;
use crate::queue::{WorkItem, WorkQueue};
use crate::retention::{cutoff_for, spawn_retention_loop};
use crate::state::TaskStatus;
use crate::store::{TaskFilter, TaskStore};
use crate::task::{Task, TaskId, TaskSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use taskforge_foundation::{EngineConfig, Error, Result};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Point-in-time snapshot of the engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub timed_out: usize,
    /// Items waiting in the work queue
    pub queue_depth: usize,
    pub max_concurrency: usize,
    /// Concurrency permits not currently held
    pub available_permits: usize,
    /// Started and not shut down
    pub is_running: bool,
}

struct Inner {
    config: EngineConfig,
    store: Arc<TaskStore>,
    queue: Arc<WorkQueue>,
    pool: OnceLock<WorkerPool>,
    shutdown: CancellationToken,
    closing: AtomicBool,
    retention: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Task Manager - owns the task table, the work queue and the worker pool
///
/// Cheap to clone; all clones share one engine. Construct it once at process
/// start and hand it to whoever submits work.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

impl TaskManager {
    /// Create a new task manager; no workers run until [`TaskManager::start`]
    ///
    /// Fails with `Config` when `config` does not validate.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(TaskStore::new(config.event_capacity));
        let queue = Arc::new(WorkQueue::new(&config.queue));

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                queue,
                pool: OnceLock::new(),
                shutdown: CancellationToken::new(),
                closing: AtomicBool::new(false),
                retention: std::sync::Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Spawn `concurrency` workers the first time it is called; later calls
    /// are no-ops. Must be called from within a tokio runtime.
    pub fn start(&self, concurrency: usize) -> Result<()> {
        if self.is_closing() {
            return Err(Error::ShuttingDown);
        }
        if self.is_started() {
            debug!("Task manager already started");
            return Ok(());
        }
        if concurrency == 0 {
            return Err(Error::InvalidInput(
                "concurrency must be at least 1".to_string(),
            ));
        }

        let mut spawned = false;
        self.inner.pool.get_or_init(|| {
            spawned = true;
            WorkerPool::spawn(
                concurrency,
                Arc::clone(&self.inner.queue),
                Arc::clone(&self.inner.store),
                self.inner.shutdown.clone(),
            )
        });

        if spawned {
            info!("Task manager started (concurrency={})", concurrency);
            let retention = &self.inner.config.retention;
            if retention.enabled {
                self.start_retention(retention.interval(), retention.max_age())?;
            }
        } else {
            debug!("Task manager already started");
        }
        Ok(())
    }

    /// Start with `maxConcurrency` from the configuration
    pub fn start_default(&self) -> Result<()> {
        self.start(self.inner.config.max_concurrency)
    }

    pub fn is_started(&self) -> bool {
        self.inner.pool.get().is_some()
    }

    fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    /// Stop the engine: reject new submissions, cancel queued and running
    /// tasks, and wait up to `shutdownGraceSecs` for workers to exit.
    pub async fn shutdown(&self) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Task manager shutting down");

        self.inner.queue.close();
        let queued = self.inner.queue.drain().await;
        let mut cancelled = 0;
        for item in queued {
            if self.inner.store.cancel(item.id).await {
                cancelled += 1;
            }
        }

        let in_flight = self.inner.store.cancel_running().await;
        self.inner.shutdown.cancel();

        if let Some(pool) = self.inner.pool.get() {
            pool.join(self.inner.config.shutdown_grace()).await;
        }

        let retention = match self.inner.retention.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = retention {
            let _ = handle.await;
        }

        info!(
            "Task manager stopped ({} queued cancelled, {} in flight signalled)",
            cancelled, in_flight
        );
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Record a new task as `Pending` and queue the callable. Returns as soon
    /// as the item is queued; execution happens on a worker.
    ///
    /// Fails with `NotStarted` before [`TaskManager::start`], `ShuttingDown`
    /// after [`TaskManager::shutdown`], and `QueueFull` when a bounded queue
    /// rejects the item.
    pub async fn submit<F, Fut>(&self, spec: TaskSpec, f: F) -> Result<TaskId>
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        if self.is_closing() {
            return Err(Error::ShuttingDown);
        }
        if !self.is_started() {
            return Err(Error::NotStarted);
        }

        let timeout = spec.resolve_timeout(self.inner.config.default_timeout());
        let mut task = Task::new(spec);
        task.timeout = timeout;
        let id = task.id;
        let label = format!("{}: {}", task.task_type, task.name);

        self.inner.store.insert(task).await;

        let item = WorkItem {
            id,
            job: job(f),
            timeout,
        };
        if let Err(e) = self.inner.queue.push(item).await {
            self.inner.store.remove(id).await;
            warn!("Rejected task {} ({}): {}", id.short(), label, e);
            return Err(e);
        }

        debug!("Submitted task {} ({})", id.short(), label);
        Ok(id)
    }

    /// Submit through a handler registered for `spec.task_type`
    pub async fn submit_registered(
        &self,
        registry: &HandlerRegistry,
        spec: TaskSpec,
        input: Value,
    ) -> Result<TaskId> {
        let handler = registry.get(&spec.task_type).ok_or_else(|| {
            Error::NotFound(format!("No handler for task type {}", spec.task_type))
        })?;

        self.submit(spec, move |ctx| async move { handler.run(ctx, input).await })
            .await
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Get a task by ID
    pub async fn get(&self, id: TaskId) -> Option<Task> {
        self.inner.store.get(id).await
    }

    pub async fn get_status(&self, id: TaskId) -> Option<TaskStatus> {
        self.get(id).await.map(|task| task.status)
    }

    /// The result, only once the task has `Completed`
    pub async fn get_result(&self, id: TaskId) -> Option<Value> {
        self.get(id)
            .await
            .filter(|task| task.status == TaskStatus::Completed)
            .and_then(|task| task.result)
    }

    /// Tasks matching `filter`, newest first, at most `limit`
    pub async fn list(&self, filter: &TaskFilter, limit: usize) -> Vec<Task> {
        self.inner.store.list(filter, limit).await
    }

    pub async fn stats(&self) -> TaskStats {
        let counts = self.inner.store.counts().await;
        let queue_depth = self.inner.queue.len().await;
        let pool = self.inner.pool.get();

        TaskStats {
            total: counts.total,
            pending: counts.pending,
            running: counts.running,
            completed: counts.completed,
            failed: counts.failed,
            cancelled: counts.cancelled,
            timed_out: counts.timed_out,
            queue_depth,
            max_concurrency: pool
                .map(WorkerPool::size)
                .unwrap_or(self.inner.config.max_concurrency),
            available_permits: pool.map(WorkerPool::available_permits).unwrap_or(0),
            is_running: pool.is_some() && !self.is_closing(),
        }
    }

    /// Queue capacity, `None` when unbounded
    pub fn queue_capacity(&self) -> Option<usize> {
        self.inner.queue.capacity()
    }

    /// Receive every status transition from now on
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.store.subscribe()
    }

    /// Wait until the task is terminal and return its record.
    ///
    /// `None` if the id is unknown, the record was reaped, or `timeout`
    /// elapsed first.
    pub async fn wait(&self, id: TaskId, timeout: Option<Duration>) -> Option<Task> {
        let waiting = self.wait_terminal(id);
        match timeout {
            Some(limit) => tokio::time::timeout(limit, waiting).await.ok().flatten(),
            None => waiting.await,
        }
    }

    async fn wait_terminal(&self, id: TaskId) -> Option<Task> {
        // subscribe before the first lookup so no transition slips through
        let mut events = self.subscribe();

        loop {
            let task = self.get(id).await?;
            if task.is_terminal() {
                return Some(task);
            }

            loop {
                match events.recv().await {
                    Ok(event) if event.task_id == id && event.is_terminal() => break,
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("wait({}) lagged by {} events", id.short(), skipped);
                        break;
                    }
                    Err(RecvError::Closed) => return self.get(id).await,
                }
            }
        }
    }

    // ========================================================================
    // Control
    // ========================================================================

    /// Cancel a task. False if the id is unknown or already terminal.
    ///
    /// A pending task never starts; a running task has its cancellation
    /// token signalled and its callable dropped by the worker.
    pub async fn cancel(&self, id: TaskId) -> bool {
        let cancelled = self.inner.store.cancel(id).await;
        if cancelled {
            info!("Cancelled task {}", id.short());
        }
        cancelled
    }

    /// Report progress for a task from outside its callable
    pub async fn update_progress(
        &self,
        id: TaskId,
        progress: f32,
        message: impl Into<String>,
    ) -> bool {
        self.inner
            .store
            .update_progress(id, progress, Some(message.into()))
            .await
    }

    // ========================================================================
    // Retention
    // ========================================================================

    /// 특정 기간 이전에 생성된 종료 태스크 제거
    ///
    /// Pending and running tasks are never removed.
    pub async fn cleanup(&self, older_than: Duration) -> usize {
        self.cleanup_before(cutoff_for(older_than)).await
    }

    /// Remove terminal tasks created before `cutoff`
    pub async fn cleanup_before(&self, cutoff: DateTime<Utc>) -> usize {
        let removed = self.inner.store.cleanup_before(cutoff).await;
        if removed > 0 {
            debug!("Cleaned up {} tasks created before {}", removed, cutoff);
        }
        removed
    }

    /// 주기적 정리 시작 (백그라운드 태스크)
    ///
    /// Replaces a previously started loop. Stops on shutdown. A zero
    /// `interval` is rejected with `InvalidInput`.
    pub fn start_retention(&self, interval: Duration, max_age: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(Error::InvalidInput(
                "retention interval must be positive".to_string(),
            ));
        }
        let handle = spawn_retention_loop(
            Arc::clone(&self.inner.store),
            interval,
            max_age,
            self.inner.shutdown.clone(),
        );

        let previous = match self.inner.retention.lock() {
            Ok(mut guard) => guard.replace(handle),
            Err(poisoned) => poisoned.into_inner().replace(handle),
        };
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("started", &self.is_started())
            .field("closing", &self.is_closing())
            .field("config", &self.inner.config)
            .finish()
    }
}
