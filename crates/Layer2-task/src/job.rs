//! Callables accepted by the engine and the context handed to them

use crate::store::TaskStore;
use crate::task::TaskId;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Future produced by a job
pub type JobFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// A type-erased unit of work. Arguments are captured by the closure.
pub type Job = Box<dyn FnOnce(TaskContext) -> JobFuture + Send + 'static>;

/// Box a closure returning a future into a [`Job`]
pub fn job<F, Fut>(f: F) -> Job
where
    F: FnOnce(TaskContext) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Box::new(move |ctx| f(ctx).boxed())
}

/// Handed to every callable when a worker starts it
#[derive(Clone)]
pub struct TaskContext {
    id: TaskId,
    token: CancellationToken,
    store: Arc<TaskStore>,
}

impl TaskContext {
    pub(crate) fn new(id: TaskId, token: CancellationToken, store: Arc<TaskStore>) -> Self {
        Self { id, token, store }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Fires when the task is cancelled, times out, or the engine shuts down.
    ///
    /// The worker already drops the callable's future at that point; the
    /// token is for work the callable spawned on its own.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Report progress in [0, 100]; returns false once the task is terminal
    pub async fn set_progress(&self, progress: f32, message: impl Into<String>) -> bool {
        self.store
            .update_progress(self.id, progress, Some(message.into()))
            .await
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("id", &self.id)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}
