//! Task definition and types

use crate::state::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Metadata key consulted for a per-task timeout (seconds, as a number or a
/// numeric string)
pub const TIMEOUT_METADATA_KEY: &str = "timeout";

/// Unique identifier for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Generate a new random TaskId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, for log lines
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = taskforge_foundation::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self).map_err(|e| {
            taskforge_foundation::Error::InvalidInput(format!("Invalid task id {}: {}", s, e))
        })
    }
}

// ============================================================================
// TaskSpec (submission descriptor)
// ============================================================================

/// Everything about a submission except the callable itself
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    /// Free-form category used for filtering and statistics
    #[serde(rename = "type")]
    pub task_type: String,

    /// Human-readable label
    pub name: String,

    /// Deadline for the callable, measured from the moment it starts running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,

    /// Free-form key/value pairs, copied onto the task record
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl TaskSpec {
    pub fn new(task_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            name: name.into(),
            timeout: None,
            metadata: HashMap::new(),
        }
    }

    /// Set timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Effective deadline: explicit timeout, then the `timeout` metadata
    /// entry (seconds), then `default`.
    ///
    /// A metadata value that is not a positive number of seconds, or is too
    /// large for a `Duration`, is ignored.
    pub fn resolve_timeout(&self, default: Option<Duration>) -> Option<Duration> {
        self.timeout
            .or_else(|| {
                self.metadata
                    .get(TIMEOUT_METADATA_KEY)
                    .and_then(metadata_secs)
                    .filter(|secs| *secs > 0.0)
                    .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            })
            .or(default)
    }
}

fn metadata_secs(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// ============================================================================
// Task (lifecycle record)
// ============================================================================

/// A submitted unit of work and its tracked lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique task identifier
    pub id: TaskId,

    /// Caller-supplied category
    #[serde(rename = "type")]
    pub task_type: String,

    /// Human-readable label
    pub name: String,

    /// Current status
    pub status: TaskStatus,

    /// When the task was submitted
    pub created_at: DateTime<Utc>,

    /// When a worker started executing it
    pub started_at: Option<DateTime<Utc>>,

    /// When it reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,

    /// Percentage in [0, 100]
    pub progress: f32,

    /// Last message passed along with a progress update
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_message: Option<String>,

    /// Present only when `Completed`
    pub result: Option<Value>,

    /// Present only when `Failed` or `TimedOut`
    pub error: Option<String>,

    /// Deadline the worker enforced, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,

    /// Submission metadata
    pub metadata: HashMap<String, Value>,

    /// Submission sequence number, breaks `created_at` ties when listing
    #[serde(skip)]
    pub(crate) seq: u64,
}

impl Task {
    /// Create a new pending task from a submission
    pub fn new(spec: TaskSpec) -> Self {
        Self {
            id: TaskId::new(),
            task_type: spec.task_type,
            name: spec.name,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress: 0.0,
            progress_message: None,
            result: None,
            error: None,
            timeout: spec.timeout,
            metadata: spec.metadata,
            seq: 0,
        }
    }

    /// Mark task as running
    pub fn start(&mut self) -> bool {
        if !self.status.can_transition_to(TaskStatus::Running) {
            return false;
        }
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        true
    }

    /// Mark task as completed successfully
    pub fn complete(&mut self, result: Value) -> bool {
        if !self.finish(TaskStatus::Completed) {
            return false;
        }
        self.result = Some(result);
        self.progress = 100.0;
        true
    }

    /// Mark task as failed
    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        if !self.finish(TaskStatus::Failed) {
            return false;
        }
        self.error = Some(error.into());
        true
    }

    /// Mark task as timed out
    pub fn time_out(&mut self, limit: Duration) -> bool {
        if !self.finish(TaskStatus::TimedOut) {
            return false;
        }
        self.error = Some(format!("Task timed out after {:.3}s", limit.as_secs_f64()));
        true
    }

    /// Mark task as cancelled
    pub fn cancel(&mut self) -> bool {
        self.finish(TaskStatus::Cancelled)
    }

    fn finish(&mut self, status: TaskStatus) -> bool {
        if !self.status.can_transition_to(status) {
            return false;
        }
        self.status = status;
        self.completed_at = Some(Utc::now());
        true
    }

    /// Record progress; ignored once the task is terminal
    pub fn set_progress(&mut self, progress: f32, message: Option<String>) -> bool {
        if self.is_terminal() || progress.is_nan() {
            return false;
        }
        self.progress = progress.clamp(0.0, 100.0);
        if message.is_some() {
            self.progress_message = message;
        }
        true
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Check if task is still active (pending or running)
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Get execution duration if task has started
    pub fn duration(&self) -> Option<Duration> {
        let start = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some((end - start).to_std().unwrap_or_default())
    }
}
