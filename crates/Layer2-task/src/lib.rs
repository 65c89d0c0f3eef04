//! # taskforge-task
//!
//! Asynchronous task execution engine for Taskforge.
//! Accepts arbitrary units of work, runs them under a bounded concurrency
//! limit, and tracks their lifecycle.
//!
//! ## Features
//!
//! - FIFO work queue (unbounded, or bounded with reject/wait overflow)
//! - Fixed-size worker pool gated by a concurrency semaphore
//! - Per-task deadlines and cancellation of pending or running work
//! - Status queries, filtered listing, statistics
//! - Status transition events for external subscribers
//! - Retention cleanup of old terminal records
//!
//! ```ignore
//! let manager = TaskManager::new(EngineConfig::default())?;
//! manager.start(4)?;
//!
//! let id = manager
//!     .submit(TaskSpec::new("ingest", "load docs"), |ctx| async move {
//!         ctx.set_progress(50.0, "parsing").await;
//!         Ok(serde_json::json!({"documents": 12}))
//!     })
//!     .await?;
//!
//! let task = manager.wait(id, None).await;
//! ```

pub mod event;
pub mod handler;
pub mod job;
pub mod manager;
mod pool;
mod queue;
mod retention;
pub mod state;
mod store;
pub mod task;

// Engine
pub use manager::{TaskManager, TaskStats};
pub use store::TaskFilter;

// Task model
pub use state::TaskStatus;
pub use task::{Task, TaskId, TaskSpec, TIMEOUT_METADATA_KEY};

// Callables
pub use handler::{HandlerRegistry, TaskHandler};
pub use job::{job, Job, JobFuture, TaskContext};

// Events
pub use event::TaskEvent;

// Foundation re-exports commonly needed alongside the engine
pub use taskforge_foundation::{EngineConfig, Error, OverflowPolicy, Result, RetentionConfig};
