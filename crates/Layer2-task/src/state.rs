//! Task state machine

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Lifecycle status of a task
///
/// Transitions only move forward:
/// `Pending -> Running -> {Completed | Failed | Cancelled | TimedOut}`,
/// with `Pending -> Cancelled` allowed for work cancelled before it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the queue
    Pending,

    /// A worker is executing the callable
    Running,

    /// Callable returned a value
    Completed,

    /// Callable returned an error or panicked
    Failed,

    /// Cancelled by a caller or by shutdown
    Cancelled,

    /// Callable exceeded its deadline
    TimedOut,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
        TaskStatus::TimedOut,
    ];

    /// Check if this is a terminal state (cannot transition further)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::TimedOut
        )
    }

    /// Whether `next` is a legal successor of `self`
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match self {
            TaskStatus::Pending => matches!(next, TaskStatus::Running | TaskStatus::Cancelled),
            TaskStatus::Running => next.is_terminal(),
            _ => false,
        }
    }

    /// Get display name for the state
    pub fn display_name(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "Pending",
            TaskStatus::Running => "Running",
            TaskStatus::Completed => "Completed",
            TaskStatus::Failed => "Failed",
            TaskStatus::Cancelled => "Cancelled",
            TaskStatus::TimedOut => "TimedOut",
        }
    }

    /// Get a symbol for the state (for terminal output)
    pub fn symbol(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "◯",
            TaskStatus::Running => "⟳",
            TaskStatus::Completed => "✓",
            TaskStatus::Failed => "✗",
            TaskStatus::Cancelled => "⊘",
            TaskStatus::TimedOut => "⏱",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl FromStr for TaskStatus {
    type Err = taskforge_foundation::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['_', '-'], "");
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.display_name().to_ascii_lowercase() == normalized)
            .ok_or_else(|| {
                taskforge_foundation::Error::InvalidInput(format!("Unknown task status: {}", s))
            })
    }
}
