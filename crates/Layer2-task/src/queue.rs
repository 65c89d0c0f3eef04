//! Work queue - FIFO channel of pending work items
//!
//! Unbounded by default. With a capacity, a full queue either rejects the
//! submission or makes it wait, per [`OverflowPolicy`].

use crate::job::Job;
use crate::task::TaskId;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use taskforge_foundation::{Error, OverflowPolicy, QueueConfig, Result};
use tokio::sync::{Mutex, Notify};

/// One queued execution
pub(crate) struct WorkItem {
    pub id: TaskId,
    pub job: Job,
    pub timeout: Option<Duration>,
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("id", &self.id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

pub(crate) struct WorkQueue {
    items: Mutex<VecDeque<WorkItem>>,

    /// Signalled when an item is pushed
    available: Notify,

    /// Signalled when an item is popped
    space: Notify,

    capacity: Option<usize>,
    overflow: OverflowPolicy,
    closed: AtomicBool,
}

impl WorkQueue {
    pub(crate) fn new(config: &QueueConfig) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(config.capacity.unwrap_or(64).min(1024))),
            available: Notify::new(),
            space: Notify::new(),
            capacity: config.capacity,
            overflow: config.overflow,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub(crate) async fn push(&self, item: WorkItem) -> Result<()> {
        loop {
            let space = self.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            {
                // checked under the lock so `close` + `drain` cannot miss this item
                let mut items = self.items.lock().await;
                if self.is_closed() {
                    return Err(Error::ShuttingDown);
                }
                match self.capacity {
                    Some(capacity) if items.len() >= capacity => {
                        if self.overflow == OverflowPolicy::Reject {
                            return Err(Error::QueueFull { capacity });
                        }
                    }
                    _ => {
                        items.push_back(item);
                        drop(items);
                        self.available.notify_one();
                        return Ok(());
                    }
                }
            }

            space.await;
        }
    }

    /// Wait for the next item. Returns `None` once the queue is closed.
    pub(crate) async fn pop(&self) -> Option<WorkItem> {
        loop {
            let available = self.available.notified();
            tokio::pin!(available);
            available.as_mut().enable();

            if self.is_closed() {
                return None;
            }

            if let Some(item) = self.items.lock().await.pop_front() {
                self.space.notify_one();
                return Some(item);
            }

            available.await;
        }
    }

    pub(crate) async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop accepting and handing out items; wakes every waiter
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.available.notify_waiters();
        self.space.notify_waiters();
    }

    /// Take everything still queued
    pub(crate) async fn drain(&self) -> Vec<WorkItem> {
        self.items.lock().await.drain(..).collect()
    }
}
