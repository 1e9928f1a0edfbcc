use super::coordinator::TaskCoordinator;
use super::dispatcher::WorkDispatcher;
use super::pipeline::{GridPipeline, PipelineCoordinator};
use super::registry::TaskRegistry;
use super::task::GridTask;
use super::task_store::TaskStore;
use super::types::{RunOptions, TaskExecutionResult, TaskState};
use super::worker::Worker;
use crate::error::GridResult;
use crate::grid::Grid;

use std::sync::Arc;

/// Entry point of the compute layer for one node.
///
/// Every node of a grid calls the same operations; the coordinator does the
/// work and the other nodes wait for its outcome.
pub struct GridCompute {
    grid: Arc<dyn Grid>,
    registry: Arc<TaskRegistry>,
    store: TaskStore,
    dispatcher: Arc<WorkDispatcher>,
    worker: Arc<Worker>,
    coordinator: Arc<TaskCoordinator>,
    pipelines: Arc<PipelineCoordinator>,
}

impl GridCompute {
    pub fn new(grid: Arc<dyn Grid>, registry: Arc<TaskRegistry>) -> GridResult<Arc<Self>> {
        let store = TaskStore::open(grid.storage())?;
        let dispatcher = WorkDispatcher::new(grid.clone());
        let worker = Worker::new(
            grid.clone(),
            dispatcher.clone(),
            registry.clone(),
            store.clone(),
        );
        let coordinator = TaskCoordinator::new(
            grid.clone(),
            dispatcher.clone(),
            worker.clone(),
            registry.clone(),
            store.clone(),
        );
        let pipelines = PipelineCoordinator::new(
            grid.clone(),
            dispatcher.clone(),
            worker.clone(),
            coordinator.clone(),
        )?;

        Ok(Arc::new(Self {
            grid,
            registry,
            store,
            dispatcher,
            worker,
            coordinator,
            pipelines,
        }))
    }

    pub fn grid(&self) -> &Arc<dyn Grid> {
        &self.grid
    }

    /// This node's worker, which answers the coordinator's requests.
    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    pub fn dispatcher(&self) -> &Arc<WorkDispatcher> {
        &self.dispatcher
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub async fn execute_task(&self, task: Arc<dyn GridTask>) -> GridResult<TaskExecutionResult> {
        self.execute_task_with(task, RunOptions::default()).await
    }

    pub async fn execute_task_with(
        &self,
        task: Arc<dyn GridTask>,
        options: RunOptions,
    ) -> GridResult<TaskExecutionResult> {
        self.coordinator.execute_task(task, options).await
    }

    /// Builds the registered task of `kind` for `task_id` and runs it.
    pub async fn run_task(
        &self,
        kind: &str,
        task_id: &str,
        options: RunOptions,
    ) -> GridResult<TaskExecutionResult> {
        let task = self.registry.create(kind, task_id)?;
        self.execute_task_with(task, options).await
    }

    pub async fn stop_task(&self, task_id: &str) {
        self.coordinator.stop_task(task_id).await;
    }

    /// Last state the coordinator persisted for `task_id`.
    pub fn task_state(&self, task_id: &str) -> GridResult<Option<TaskState>> {
        self.store.state(task_id)
    }

    /// Final result of the last completed run of `task_id`.
    pub fn terminated_result(&self, task_id: &str) -> GridResult<Option<TaskExecutionResult>> {
        self.store.terminated(task_id)
    }

    pub async fn execute_pipeline(
        &self,
        pipeline: &GridPipeline,
    ) -> GridResult<Option<TaskExecutionResult>> {
        self.pipelines.execute_pipeline(pipeline).await
    }

    pub async fn stop_pipeline(&self, pipeline_id: &str) -> GridResult<()> {
        self.pipelines.stop_pipeline(pipeline_id).await
    }

    pub fn active_stage_index(&self, pipeline_id: &str) -> GridResult<i64> {
        self.pipelines.active_stage_index(pipeline_id)
    }
}
