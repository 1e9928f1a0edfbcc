//! Task Registry
//!
//! Maps task kinds (e.g. "crawl", "commit") to factories building a
//! [`GridTask`] for a given task id. Every node of a grid registers the same
//! kinds so `run_task` can be resolved wherever it is called.
//!
//! Tasks handed directly to `execute_task` have no kind; each node publishes
//! its instance under the task id instead, and workers look it up there.

use super::task::{GridTask, TaskContext};
use super::types::{ExecutionMode, TaskExecutionResult, TaskRef};
use crate::error::{GridError, GridResult};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

/// Builds a task for the given task id.
pub type TaskFactoryFn = Arc<dyn Fn(&str) -> Arc<dyn GridTask> + Send + Sync>;

/// A factory-built task that remembers its kind.
struct RegisteredTask {
    kind: String,
    inner: Arc<dyn GridTask>,
}

#[async_trait]
impl GridTask for RegisteredTask {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn kind(&self) -> Option<&str> {
        Some(&self.kind)
    }

    fn execution_mode(&self) -> ExecutionMode {
        self.inner.execution_mode()
    }

    fn once(&self) -> bool {
        self.inner.once()
    }

    async fn run(&self, ctx: &TaskContext) -> anyhow::Result<Option<Value>> {
        self.inner.run(ctx).await
    }

    fn aggregate(&self, results: Vec<TaskExecutionResult>) -> Option<TaskExecutionResult> {
        self.inner.aggregate(results)
    }
}

pub struct TaskRegistry {
    factories: DashMap<String, TaskFactoryFn>,
    published: DashMap<String, Arc<dyn GridTask>>,
}

impl TaskRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `factory` under `kind`, replacing any previous factory.
    pub fn register<F>(&self, kind: &str, factory: F)
    where
        F: Fn(&str) -> Arc<dyn GridTask> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Arc::new(factory));
        tracing::info!("Registered task kind: {}", kind);
    }

    /// Builds the task of `kind` for `task_id`.
    pub fn create(&self, kind: &str, task_id: &str) -> GridResult<Arc<dyn GridTask>> {
        match self.factories.get(kind) {
            Some(factory) => {
                tracing::debug!("Creating task '{}' of kind '{}'", task_id, kind);
                Ok(Arc::new(RegisteredTask {
                    kind: kind.to_string(),
                    inner: factory.value()(task_id),
                }))
            }
            None => {
                tracing::error!("Unknown task kind: {}", kind);
                Err(GridError::UnknownTask(kind.to_string()))
            }
        }
    }

    /// Makes a task without a kind resolvable by its id on this node. The
    /// latest instance published for an id wins.
    pub fn publish(&self, task: &Arc<dyn GridTask>) {
        if task.kind().is_none() {
            self.published.insert(task.id().to_string(), task.clone());
        }
    }

    /// Builds or looks up the task a start request refers to.
    pub fn resolve(&self, task: &TaskRef) -> GridResult<Arc<dyn GridTask>> {
        match &task.kind {
            Some(kind) => self.create(kind, &task.task_id),
            None => self
                .published
                .get(&task.task_id)
                .map(|entry| entry.value().clone())
                .ok_or_else(|| GridError::UnknownTask(format!("unpublished task '{}'", task.task_id))),
        }
    }

    pub fn list_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        kinds.sort();
        kinds
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self {
            factories: DashMap::new(),
            published: DashMap::new(),
        }
    }
}
