//! Task Pipelines
//!
//! A pipeline is an ordered list of stages, each running one grid task
//! through the [`TaskCoordinator`]. The coordinator node drives the stages;
//! other nodes only wait for the pipeline to be reported done.
//!
//! ## Stage Rules
//! - Stages before the persisted active stage already ran and are skipped,
//!   so a pipeline interrupted by a coordinator change resumes where it was.
//! - Once a stage fails or a stop is requested, the remaining stages are
//!   skipped, except those flagged `always`.
//! - `always` stages that run out of turn do not move the active stage.
//! - A stage whose provider returns no task is skipped but still becomes the
//!   active one.

use super::coordinator::TaskCoordinator;
use super::dispatcher::WorkDispatcher;
use super::task::GridTask;
use super::types::{RunOptions, TaskExecutionResult, TaskState};
use super::worker::Worker;
use crate::error::{GridError, GridResult};
use crate::grid::Grid;
use crate::storage::GridMap;
use crate::util::wait::{Backoff, Check, WaitOutcome, wait_until};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub const PIPELINE_ACTIVE_STAGE_STORE: &str = "pipelineActiveStage";
pub const PIPELINE_LAST_RESULT_STORE: &str = "pipelineLastResult";

/// Active stage value of a pipeline that ran to the end.
pub const PIPELINE_DONE: i64 = -1;

type TaskProvider =
    Arc<dyn Fn(Option<&TaskExecutionResult>) -> Option<Arc<dyn GridTask>> + Send + Sync>;

/// One step of a [`GridPipeline`].
#[derive(Clone)]
pub struct PipelineStage {
    provider: TaskProvider,
    always: bool,
    options: RunOptions,
}

impl PipelineStage {
    /// A stage always running the same task.
    pub fn new(task: Arc<dyn GridTask>) -> Self {
        Self::from_fn(move |_| Some(task.clone()))
    }

    /// A stage building its task from the previous stage's result. Returning
    /// `None` skips the stage.
    pub fn from_fn<F>(provider: F) -> Self
    where
        F: Fn(Option<&TaskExecutionResult>) -> Option<Arc<dyn GridTask>> + Send + Sync + 'static,
    {
        Self {
            provider: Arc::new(provider),
            always: false,
            options: RunOptions::default(),
        }
    }

    /// Runs the stage even after an earlier failure or a stop request.
    pub fn always(mut self) -> Self {
        self.always = true;
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn is_always(&self) -> bool {
        self.always
    }

    fn task_for(&self, previous: Option<&TaskExecutionResult>) -> Option<Arc<dyn GridTask>> {
        (self.provider)(previous)
    }
}

#[derive(Clone)]
pub struct GridPipeline {
    id: String,
    stages: Vec<PipelineStage>,
}

impl GridPipeline {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            stages: Vec::new(),
        }
    }

    pub fn stage(mut self, stage: PipelineStage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stages(&self) -> &[PipelineStage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// State shared with the stop monitor.
#[derive(Default)]
struct PipeRun {
    stop_requested: AtomicBool,
    active_task: Mutex<Option<String>>,
}

impl PipeRun {
    fn set_active_task(&self, task_id: Option<&str>) {
        if let Ok(mut active) = self.active_task.lock() {
            *active = task_id.map(str::to_string);
        }
    }

    fn active_task(&self) -> Option<String> {
        self.active_task.lock().ok().and_then(|active| active.clone())
    }
}

enum Directive {
    Run { mark_active: bool },
    Skip,
}

pub struct PipelineCoordinator {
    grid: Arc<dyn Grid>,
    dispatcher: Arc<WorkDispatcher>,
    worker: Arc<Worker>,
    tasks: Arc<TaskCoordinator>,
    active_stages: GridMap<i64>,
    last_results: GridMap<TaskExecutionResult>,
}

impl PipelineCoordinator {
    pub fn new(
        grid: Arc<dyn Grid>,
        dispatcher: Arc<WorkDispatcher>,
        worker: Arc<Worker>,
        tasks: Arc<TaskCoordinator>,
    ) -> GridResult<Arc<Self>> {
        let active_stages = grid.storage().map(PIPELINE_ACTIVE_STAGE_STORE)?;
        let last_results = grid.storage().map(PIPELINE_LAST_RESULT_STORE)?;

        Ok(Arc::new(Self {
            grid,
            dispatcher,
            worker,
            tasks,
            active_stages,
            last_results,
        }))
    }

    /// Runs `pipeline` on the grid and returns the result of the last stage
    /// that ran.
    pub async fn execute_pipeline(
        &self,
        pipeline: &GridPipeline,
    ) -> GridResult<Option<TaskExecutionResult>> {
        if !self.grid.is_coordinator() {
            tracing::debug!(
                "Node {} waiting for the coordinator to run pipeline {}",
                self.grid.node_address(),
                pipeline.id()
            );
            if let Some(result) = self.await_pipeline_done(pipeline.id()).await {
                return Ok(result);
            }
            tracing::warn!(
                "Node {} became coordinator while waiting for pipeline {}. Resuming it.",
                self.grid.node_address(),
                pipeline.id()
            );
        }

        let run = Arc::new(PipeRun::default());
        let monitor = self.monitor_stop_request(pipeline.id(), run.clone());
        let outcome = self.run_stages(pipeline, &run).await;
        monitor.abort();

        let result = match &outcome {
            Ok(result) => result.clone(),
            Err(e) => {
                tracing::error!("Pipeline {} failed: {}", pipeline.id(), e);
                None
            }
        };
        self.dispatcher
            .set_pipeline_done_on_nodes(pipeline.id(), result)
            .await;
        // Nobody waits here for our own signal.
        self.worker.take_pipeline_done(pipeline.id());

        outcome
    }

    /// Waits for the done signal. Returns `None` if this node became the
    /// coordinator in the meantime.
    async fn await_pipeline_done(&self, pipeline_id: &str) -> Option<Option<TaskExecutionResult>> {
        let worker = &self.worker;
        let grid = &self.grid;

        let outcome = wait_until(
            move || async move {
                if let Some(result) = worker.take_pipeline_done(pipeline_id) {
                    return Check::Ready(result);
                }
                if grid.is_coordinator() {
                    return Check::Cancel;
                }
                Check::NotYet
            },
            Backoff::fixed(self.grid.config().heartbeat_interval()),
            None,
        )
        .await;

        match outcome {
            WaitOutcome::Done(result) => Some(result),
            WaitOutcome::Expired | WaitOutcome::Cancelled => None,
        }
    }

    async fn run_stages(
        &self,
        pipeline: &GridPipeline,
        run: &PipeRun,
    ) -> GridResult<Option<TaskExecutionResult>> {
        let pipeline_id = pipeline.id();
        if pipeline.is_empty() {
            return Err(GridError::InvalidPipeline(format!(
                "Pipeline {} stage list must not be empty.",
                pipeline_id
            )));
        }

        let start_index = self.starting_stage_index(pipeline_id)?;
        let mut last = if start_index > 0 {
            self.last_results.get(pipeline_id)?
        } else {
            None
        };
        let mut failed_index: Option<usize> = None;

        for (index, stage) in pipeline.stages().iter().enumerate() {
            if self.worker.is_pipeline_stop_requested(pipeline_id) {
                run.stop_requested.store(true, Ordering::SeqCst);
            }

            let mark_active = match self.stage_directive(
                pipeline_id,
                index,
                stage,
                start_index,
                failed_index,
                run.stop_requested.load(Ordering::SeqCst),
            ) {
                Directive::Skip => continue,
                Directive::Run { mark_active } => mark_active,
            };
            if mark_active {
                self.active_stages.put(pipeline_id, &(index as i64))?;
            }

            let Some(task) = stage.task_for(last.as_ref()) else {
                tracing::info!(
                    "Pipeline {} stage index {} has no task to run. Skipping it.",
                    pipeline_id,
                    index
                );
                continue;
            };

            run.set_active_task(Some(task.id()));
            let result = match self.tasks.execute_task(task.clone(), stage.options).await {
                Ok(result) => result,
                Err(e) => TaskExecutionResult::failed(e.to_string()),
            };
            run.set_active_task(None);

            if result.state != TaskState::Completed {
                failed_index = Some(index);
                tracing::error!(
                    "Pipeline {} stage index {} (task {}) failed: {}",
                    pipeline_id,
                    index,
                    task.id(),
                    result.error.as_deref().unwrap_or("no error given")
                );
            }
            self.last_results.put(pipeline_id, &result)?;
            last = Some(result);
        }

        self.active_stages.put(pipeline_id, &PIPELINE_DONE)?;
        self.last_results.delete(pipeline_id)?;
        self.worker.clear_pipeline_stop(pipeline_id);
        tracing::info!("Pipeline {} done", pipeline_id);

        Ok(last)
    }

    fn stage_directive(
        &self,
        pipeline_id: &str,
        index: usize,
        stage: &PipelineStage,
        start_index: usize,
        failed_index: Option<usize>,
        stop_requested: bool,
    ) -> Directive {
        let out_of_turn = if stop_requested {
            Some("the pipeline is being stopped")
        } else if index < start_index {
            Some("it already ran")
        } else if failed_index.is_some() {
            Some("an earlier stage failed")
        } else {
            None
        };

        match out_of_turn {
            None => Directive::Run { mark_active: true },
            Some(reason) if stage.is_always() => {
                tracing::info!(
                    "Pipeline {} stage index {} runs although {}: it is marked as \"always\" run.",
                    pipeline_id,
                    index,
                    reason
                );
                Directive::Run { mark_active: false }
            }
            Some(reason) => {
                tracing::info!(
                    "Pipeline {} stage index {} skipped: {}.",
                    pipeline_id,
                    index,
                    reason
                );
                Directive::Skip
            }
        }
    }

    /// Resumes from the persisted active stage. A completed pipeline starts
    /// over.
    fn starting_stage_index(&self, pipeline_id: &str) -> GridResult<usize> {
        match self.active_stages.get(pipeline_id)? {
            Some(index) if index > 0 => {
                tracing::info!(
                    "Unterminated execution detected for pipeline {}. Resuming at stage index {}.",
                    pipeline_id,
                    index
                );
                Ok(index as usize)
            }
            Some(PIPELINE_DONE) => {
                tracing::info!(
                    "Previous execution of pipeline {} completed. Starting it again.",
                    pipeline_id
                );
                Ok(0)
            }
            _ => Ok(0),
        }
    }

    /// Watches this node's stop flag and stops the active task once set.
    fn monitor_stop_request(&self, pipeline_id: &str, run: Arc<PipeRun>) -> tokio::task::JoinHandle<()> {
        let worker = self.worker.clone();
        let dispatcher = self.dispatcher.clone();
        let pipeline_id = pipeline_id.to_string();
        let interval = self.grid.config().heartbeat_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if run.stop_requested.load(Ordering::SeqCst)
                    || !worker.is_pipeline_stop_requested(&pipeline_id)
                {
                    continue;
                }

                run.stop_requested.store(true, Ordering::SeqCst);
                if let Some(task_id) = run.active_task() {
                    tracing::info!("Stopping task {} of pipeline {}", task_id, pipeline_id);
                    dispatcher.stop_task_on_nodes(&task_id).await;
                }
            }
        })
    }

    /// Asks the coordinator to stop `pipeline_id`.
    pub async fn stop_pipeline(&self, pipeline_id: &str) -> GridResult<()> {
        let response = self.dispatcher.stop_pipeline(pipeline_id).await;
        match response.error_message() {
            None => Ok(()),
            Some(error) => Err(GridError::Transport(format!(
                "Could not request stop of pipeline {}: {}",
                pipeline_id, error
            ))),
        }
    }

    /// Index of the stage being run, or `-1` when none is.
    pub fn active_stage_index(&self, pipeline_id: &str) -> GridResult<i64> {
        Ok(self
            .active_stages
            .get(pipeline_id)?
            .unwrap_or(PIPELINE_DONE))
    }
}
