//! Worker pool - bounded-parallelism execution of queued work
//!
//! Each worker loops: pop an item (blocking while the queue is empty),
//! acquire a concurrency permit, execute, release the permit. The semaphore,
//! not the queue, bounds how many callables run at once.

use crate::job::{Job, TaskContext};
use crate::queue::{WorkItem, WorkQueue};
use crate::store::{Outcome, TaskStore};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub(crate) struct WorkerPool {
    size: usize,
    semaphore: Arc<Semaphore>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `size` worker loops on the current runtime
    pub(crate) fn spawn(
        size: usize,
        queue: Arc<WorkQueue>,
        store: Arc<TaskStore>,
        shutdown: CancellationToken,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(size));

        let handles = (0..size)
            .map(|worker_id| {
                let worker = Worker {
                    id: worker_id,
                    queue: Arc::clone(&queue),
                    store: Arc::clone(&store),
                    semaphore: Arc::clone(&semaphore),
                    shutdown: shutdown.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!("Worker pool started with {} workers", size);

        Self {
            size,
            semaphore,
            handles: std::sync::Mutex::new(handles),
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for every worker to exit, up to `grace`
    pub(crate) async fn join(&self, grace: Duration) {
        let handles: Vec<_> = match self.handles.lock() {
            Ok(mut handles) => handles.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        if handles.is_empty() {
            return;
        }

        let count = handles.len();
        match tokio::time::timeout(grace, futures::future::join_all(handles)).await {
            Ok(_) => debug!("All {} workers exited", count),
            Err(_) => warn!("Workers did not exit within {:?}", grace),
        }
    }
}

struct Worker {
    id: usize,
    queue: Arc<WorkQueue>,
    store: Arc<TaskStore>,
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(self) {
        debug!("Worker {} started", self.id);

        loop {
            let item = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                item = self.queue.pop() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.store.cancel(item.id).await;
                    break;
                }
                permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        self.store.cancel(item.id).await;
                        break;
                    }
                },
            };

            let id = item.id;
            let result = AssertUnwindSafe(self.execute(item)).catch_unwind().await;
            if let Err(panic) = result {
                // Fault in the engine, not the callable
                error!(
                    "Worker {} faulted on task {}: {}",
                    self.id,
                    id.short(),
                    panic_message(&*panic)
                );
                self.store
                    .finish(id, Outcome::Failed("internal worker error".to_string()))
                    .await;
            }

            drop(permit);
        }

        debug!("Worker {} stopped", self.id);
    }

    async fn execute(&self, item: WorkItem) {
        let WorkItem { id, job, timeout } = item;
        let token = self.shutdown.child_token();

        let Some(task) = self.store.begin(id, token.clone()).await else {
            return;
        };
        debug!(
            "Worker {} running task {} ({}: {})",
            self.id,
            id.short(),
            task.task_type,
            task.name
        );

        let ctx = TaskContext::new(id, token.clone(), Arc::clone(&self.store));
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Outcome::Cancelled,
            outcome = invoke(job, ctx, timeout) => outcome,
        };

        match &outcome {
            Outcome::Completed(_) => debug!("Task {} completed", id.short()),
            Outcome::Failed(message) => warn!("Task {} failed: {}", id.short(), message),
            Outcome::TimedOut(limit) => {
                warn!("Task {} timed out after {:?}", id.short(), limit);
                token.cancel();
            }
            Outcome::Cancelled => info!("Task {} cancelled while running", id.short()),
        }

        self.store.finish(id, outcome).await;
    }
}

/// Run the callable, racing it against its deadline and catching panics
async fn invoke(job: Job, ctx: TaskContext, timeout: Option<Duration>) -> Outcome {
    let future = match std::panic::catch_unwind(AssertUnwindSafe(move || job(ctx))) {
        Ok(future) => future,
        Err(panic) => {
            return Outcome::Failed(format!("task panicked: {}", panic_message(&*panic)))
        }
    };
    let guarded = AssertUnwindSafe(future).catch_unwind();

    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(result) => result,
            Err(_) => return Outcome::TimedOut(limit),
        },
        None => guarded.await,
    };

    match result {
        Ok(Ok(value)) => Outcome::Completed(value),
        Ok(Err(err)) => Outcome::Failed(format!("{:#}", err)),
        Err(panic) => Outcome::Failed(format!("task panicked: {}", panic_message(&*panic))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
