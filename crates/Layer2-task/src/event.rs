//! Task status events
//!
//! Every status transition is published on a broadcast channel so that
//! collaborators (persistence mirrors, dashboards) can follow the lifecycle
//! without polling. Publishing never blocks; slow subscribers lag.

use crate::state::TaskStatus;
use crate::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// A single status transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    pub task_id: TaskId,

    #[serde(rename = "type")]
    pub task_type: String,

    /// `None` for the submission event
    pub from: Option<TaskStatus>,

    pub to: TaskStatus,

    pub at: DateTime<Utc>,
}

impl TaskEvent {
    pub fn new(
        task_id: TaskId,
        task_type: impl Into<String>,
        from: Option<TaskStatus>,
        to: TaskStatus,
    ) -> Self {
        Self {
            task_id,
            task_type: task_type.into(),
            from,
            to,
            at: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.to.is_terminal()
    }
}

/// Fan-out point for [`TaskEvent`]s
#[derive(Debug)]
pub(crate) struct EventHub {
    sender: broadcast::Sender<TaskEvent>,
}

impl EventHub {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }

    pub(crate) fn emit(&self, event: TaskEvent) {
        trace!(
            "event {} {:?} -> {}",
            event.task_id.short(),
            event.from,
            event.to
        );
        // No subscribers is the common case
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_subscribers() {
        let hub = EventHub::new(8);
        let mut rx = hub.subscribe();

        let id = TaskId::new();
        hub.emit(TaskEvent::new(id, "ingest", None, TaskStatus::Pending));
        hub.emit(TaskEvent::new(
            id,
            "ingest",
            Some(TaskStatus::Pending),
            TaskStatus::Running,
        ));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.from, None);
        assert_eq!(first.to, TaskStatus::Pending);

        let second = rx.recv().await.unwrap();
        assert_eq!(second.to, TaskStatus::Running);
        assert!(!second.is_terminal());
    }

    #[test]
    fn test_emit_without_subscribers() {
        let hub = EventHub::new(1);
        hub.emit(TaskEvent::new(
            TaskId::new(),
            "x",
            Some(TaskStatus::Running),
            TaskStatus::Completed,
        ));
    }
}
