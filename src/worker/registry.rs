//! Task handler registry
//!
//! Handlers are values registered under symbolic task names; no inheritance
//! hierarchy. Cross-cutting behavior (tracing span, timing) is composed by
//! wrapping handlers at registration time, so every handler gets the same
//! instrumentation without reflection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info_span, Instrument};

use super::context::TaskContext;
use super::retry::TaskError;

/// A task handler. Implementations must be idempotent under at-least-once
/// delivery.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, args: Value, ctx: TaskContext) -> Result<Value, TaskError>;

    /// Soft timeout: the runtime cancels the context token when it elapses
    /// and the handler is expected to wind down. `None` uses the pool
    /// default.
    fn soft_timeout(&self) -> Option<Duration> {
        None
    }

    /// Hard timeout: the runtime aborts the handler future. `None` uses
    /// the pool default.
    fn hard_timeout(&self) -> Option<Duration> {
        None
    }
}

/// Timing + tracing wrapper applied to every registered handler
struct Instrumented {
    name: String,
    inner: Arc<dyn TaskHandler>,
}

#[async_trait]
impl TaskHandler for Instrumented {
    async fn run(&self, args: Value, ctx: TaskContext) -> Result<Value, TaskError> {
        let span = info_span!("task", name = %self.name, task_id = %ctx.task_id);
        let started = std::time::Instant::now();
        let result = self.inner.run(args, ctx).instrument(span).await;
        let elapsed_ms = started.elapsed().as_millis();

        match &result {
            Ok(_) => tracing::info!("Task {} completed in {}ms", self.name, elapsed_ms),
            Err(e) => tracing::warn!("Task {} failed after {}ms: {}", self.name, elapsed_ms, e),
        }
        result
    }

    fn soft_timeout(&self) -> Option<Duration> {
        self.inner.soft_timeout()
    }

    fn hard_timeout(&self) -> Option<Duration> {
        self.inner.hard_timeout()
    }
}

/// Registry mapping symbolic task names to handlers
#[derive(Default, Clone)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its symbolic name, composing the standard
    /// middleware around it.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let name = name.into();
        let wrapped = Arc::new(Instrumented {
            name: name.clone(),
            inner: handler,
        });
        tracing::debug!("Registered task handler '{name}'");
        self.handlers.insert(name, wrapped);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl TaskHandler for Echo {
        async fn run(&self, args: Value, _ctx: TaskContext) -> Result<Value, TaskError> {
            Ok(args)
        }
    }

    #[test]
    fn registry_resolves_by_symbolic_name() {
        let mut registry = TaskRegistry::new();
        registry.register("sync.products", Arc::new(Echo));
        registry.register("image.download", Arc::new(Echo));

        assert!(registry.get("sync.products").is_some());
        assert!(registry.get("sync.nope").is_none());
        assert_eq!(registry.names(), vec!["image.download", "sync.products"]);
    }
}
