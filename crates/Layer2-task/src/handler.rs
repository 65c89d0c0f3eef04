//! Handler registry - caller-side dispatch from a task type to a callable
//!
//! The engine itself only accepts closures. Callers that route work by a
//! type string register one [`TaskHandler`] per type here and submit through
//! [`crate::TaskManager::submit_registered`].

use crate::job::TaskContext;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Handler trait - implement to add a new kind of task
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Type string this handler serves
    fn task_type(&self) -> &str;

    /// Execute one task with its input payload
    async fn run(&self, ctx: TaskContext, input: Value) -> anyhow::Result<Value>;
}

/// Type string -> handler
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same type
    pub fn register(&mut self, handler: impl TaskHandler + 'static) -> &mut Self {
        let handler: Arc<dyn TaskHandler> = Arc::new(handler);
        let task_type = handler.task_type().to_string();
        if self.handlers.insert(task_type.clone(), handler).is_some() {
            debug!("Replaced handler for task type {}", task_type);
        }
        self
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Registered types, sorted
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.types())
            .finish()
    }
}
