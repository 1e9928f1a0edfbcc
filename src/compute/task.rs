//! Task abstraction.
//!
//! A [`GridTask`] has a stable id, says where it runs, and knows how to fold
//! the per-node results into one. [`FnTask`] builds one from a closure.

use super::dispatcher::WorkDispatcher;
use super::types::{ExecutionMode, TaskExecutionResult, TaskState};
use crate::grid::Grid;
use crate::membership::types::NodeAddress;
use crate::storage::GridStorage;

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::watch;

#[async_trait]
pub trait GridTask: Send + Sync {
    /// Identifier shared by every node running this task.
    fn id(&self) -> &str;

    /// Registered kind this task was built from, if any.
    fn kind(&self) -> Option<&str> {
        None
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::AllNodes
    }

    /// When true, the task runs at most once per grid session.
    fn once(&self) -> bool {
        false
    }

    /// Task body, executed on each node the task is dispatched to. The body
    /// may be re-sent to a node that lost track of it, so it should tolerate
    /// being started again.
    async fn run(&self, ctx: &TaskContext) -> anyhow::Result<Option<Value>>;

    /// Folds per-node results into the grid result. `None` is treated as a
    /// failure by the coordinator.
    fn aggregate(&self, results: Vec<TaskExecutionResult>) -> Option<TaskExecutionResult> {
        aggregate_results(results)
    }
}

/// Default aggregation: non-terminal entries are ignored, any failure fails
/// the task, otherwise the task completes with the node payloads (a single
/// value, or an array when several nodes returned one).
pub fn aggregate_results(results: Vec<TaskExecutionResult>) -> Option<TaskExecutionResult> {
    let terminal: Vec<TaskExecutionResult> =
        results.into_iter().filter(|r| r.is_terminal()).collect();
    if terminal.is_empty() {
        return None;
    }

    let errors: Vec<String> = terminal
        .iter()
        .filter(|r| r.state == TaskState::Failed)
        .map(|r| r.error.clone().unwrap_or_else(|| "Unknown error".to_string()))
        .collect();
    if !errors.is_empty() {
        return Some(TaskExecutionResult::failed(errors.join("; ")));
    }

    let mut values: Vec<Value> = terminal.into_iter().filter_map(|r| r.result).collect();
    let result = match values.len() {
        0 => None,
        1 => values.pop(),
        _ => Some(Value::Array(values)),
    };
    Some(TaskExecutionResult::completed(result))
}

/// What a running task can see of its surroundings.
#[derive(Clone)]
pub struct TaskContext {
    task_id: String,
    grid: Arc<dyn Grid>,
    storage: GridStorage,
    dispatcher: Arc<WorkDispatcher>,
    stop: watch::Receiver<bool>,
}

impl TaskContext {
    pub(crate) fn new(
        task_id: &str,
        grid: Arc<dyn Grid>,
        dispatcher: Arc<WorkDispatcher>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            storage: grid.storage().clone(),
            grid,
            dispatcher,
            stop,
        }
    }

    /// Same context, with task storage going through `storage` (the
    /// transaction of an atomic run).
    pub(crate) fn with_storage(&self, storage: GridStorage) -> Self {
        Self {
            storage,
            ..self.clone()
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn grid(&self) -> &Arc<dyn Grid> {
        &self.grid
    }

    /// Storage for the task body. Inside an atomic run this is the run's
    /// transaction; `grid().storage()` always bypasses it.
    pub fn storage(&self) -> &GridStorage {
        &self.storage
    }

    pub fn node_address(&self) -> &NodeAddress {
        self.grid.node_address()
    }

    /// Whether a stop was requested for this task on this node.
    pub fn is_stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// Resolves once a stop is requested.
    pub async fn stopped(&self) {
        let mut stop = self.stop.clone();
        let _ = stop.wait_for(|requested| *requested).await;
    }

    /// Asks every node of the grid to stop this task.
    pub async fn stop_task(&self) {
        self.dispatcher.stop_task_on_nodes(&self.task_id).await;
    }
}

type RunFn = Arc<
    dyn Fn(TaskContext) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<Value>>> + Send>>
        + Send
        + Sync,
>;
type AggregateFn =
    Arc<dyn Fn(Vec<TaskExecutionResult>) -> Option<TaskExecutionResult> + Send + Sync>;

/// A task assembled from closures.
pub struct FnTask {
    id: String,
    mode: ExecutionMode,
    once: bool,
    run: RunFn,
    aggregator: Option<AggregateFn>,
}

impl FnTask {
    /// Creates an all-nodes task running `f` on every node.
    pub fn new<F, Fut>(id: &str, f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
    {
        let run: RunFn = Arc::new(move |ctx: TaskContext| {
            Box::pin(f(ctx))
                as Pin<Box<dyn Future<Output = anyhow::Result<Option<Value>>> + Send>>
        });

        Self {
            id: id.to_string(),
            mode: ExecutionMode::AllNodes,
            once: false,
            run,
            aggregator: None,
        }
    }

    pub fn single_node(mut self) -> Self {
        self.mode = ExecutionMode::SingleNode;
        self
    }

    pub fn all_nodes(mut self) -> Self {
        self.mode = ExecutionMode::AllNodes;
        self
    }

    pub fn run_once(mut self) -> Self {
        self.once = true;
        self
    }

    pub fn with_aggregator<F>(mut self, f: F) -> Self
    where
        F: Fn(Vec<TaskExecutionResult>) -> Option<TaskExecutionResult> + Send + Sync + 'static,
    {
        self.aggregator = Some(Arc::new(f));
        self
    }

    pub fn into_task(self) -> Arc<dyn GridTask> {
        Arc::new(self)
    }
}

#[async_trait]
impl GridTask for FnTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn execution_mode(&self) -> ExecutionMode {
        self.mode
    }

    fn once(&self) -> bool {
        self.once
    }

    async fn run(&self, ctx: &TaskContext) -> anyhow::Result<Option<Value>> {
        (self.run)(ctx.clone()).await
    }

    fn aggregate(&self, results: Vec<TaskExecutionResult>) -> Option<TaskExecutionResult> {
        match &self.aggregator {
            Some(aggregator) => aggregator(results),
            None => aggregate_results(results),
        }
    }
}

impl std::fmt::Debug for FnTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTask")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("once", &self.once)
            .finish()
    }
}
