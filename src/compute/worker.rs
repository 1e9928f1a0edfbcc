//! Node Worker
//!
//! Runs the tasks dispatched to this node and answers the coordinator's
//! progress queries.
//!
//! ## Responsibilities
//! - **Execution**: spawns each started task, optionally inside a storage
//!   transaction whose storage replaces the one in the task context, and records `Completed`/`Failed` when it ends. A task that is
//!   already running or done on this node is not started twice.
//! - **Heartbeats**: while a task runs, a sidecar refreshes its progress every
//!   heartbeat interval and persists it to the `workersTaskProgress` store.
//! - **Signals**: keeps stop requests, the grid progress published by the
//!   coordinator and pipeline completion/stop flags for local waiters.

use super::dispatcher::WorkDispatcher;
use super::protocol::{WorkerReply, WorkerRequest};
use super::registry::TaskRegistry;
use super::task::{GridTask, TaskContext};
use super::task_store::TaskStore;
use super::types::{RunOptions, TaskExecutionResult, TaskProgress, TaskState};
use crate::error::GridError;
use crate::grid::{Grid, NodeEndpoint};
use crate::membership::types::NodeAddress;
use crate::storage::memory::panic_message;
use crate::util::now_ms;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;

/// Progress of one local run. `run_id` tells runs of the same task apart so
/// a run whose status was cleared cannot write it back.
struct LocalRun {
    run_id: u64,
    progress: TaskProgress,
}

pub struct Worker {
    me: Weak<Worker>,
    grid: Arc<dyn Grid>,
    dispatcher: Arc<WorkDispatcher>,
    registry: Arc<TaskRegistry>,
    store: TaskStore,
    next_run_id: AtomicU64,
    local_runs: DashMap<String, LocalRun>,
    grid_progress: DashMap<String, TaskProgress>,
    stop_signals: DashMap<String, watch::Sender<bool>>,
    pipelines_done: DashMap<String, Option<TaskExecutionResult>>,
    pipeline_stops: DashSet<String>,
}

impl Worker {
    pub fn new(
        grid: Arc<dyn Grid>,
        dispatcher: Arc<WorkDispatcher>,
        registry: Arc<TaskRegistry>,
        store: TaskStore,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            grid,
            dispatcher,
            registry,
            store,
            next_run_id: AtomicU64::new(1),
            local_runs: DashMap::new(),
            grid_progress: DashMap::new(),
            stop_signals: DashMap::new(),
            pipelines_done: DashMap::new(),
            pipeline_stops: DashSet::new(),
        })
    }

    fn address(&self) -> &NodeAddress {
        self.grid.node_address()
    }

    fn stop_receiver(&self, task_id: &str) -> watch::Receiver<bool> {
        self.stop_signals
            .entry(task_id.to_string())
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    fn persist(&self, task_id: &str, progress: &TaskProgress) {
        if let Err(e) = self.store.save_node_progress(task_id, self.address(), progress) {
            tracing::warn!("Could not persist progress of task {}: {}", task_id, e);
        }
    }

    // ============================================================
    // TASK EXECUTION
    // ============================================================

    /// Starts `task` on this node unless it is already running or done here.
    /// Returns whether it was started.
    pub fn start_node_task(self: &Arc<Self>, task: Arc<dyn GridTask>, options: RunOptions) -> bool {
        let task_id = task.id().to_string();
        let run_id = self.next_run_id.fetch_add(1, Ordering::SeqCst);
        let running = TaskProgress::now(Some(TaskExecutionResult::running()));

        match self.local_runs.entry(task_id.clone()) {
            Entry::Occupied(mut entry) => {
                if let Some(state) = entry.get().progress.state()
                    && (state.is_running() || state.is_terminal())
                {
                    tracing::debug!(
                        "Task {} already {:?} on node {}, not starting it again",
                        task_id,
                        state,
                        self.address()
                    );
                    return false;
                }
                entry.insert(LocalRun {
                    run_id,
                    progress: running.clone(),
                });
            }
            Entry::Vacant(entry) => {
                entry.insert(LocalRun {
                    run_id,
                    progress: running.clone(),
                });
            }
        }
        self.persist(&task_id, &running);

        let ctx = TaskContext::new(
            &task_id,
            self.grid.clone(),
            self.dispatcher.clone(),
            self.stop_receiver(&task_id),
        );

        tracing::info!(
            "Node {} starting task {} (atomic: {})",
            self.address(),
            task_id,
            options.atomic
        );

        let heartbeat = self.spawn_heartbeat(&task_id, run_id);
        let worker = self.clone();
        tokio::spawn(async move {
            let status = worker.execute(task, options, ctx).await;
            heartbeat.abort();
            worker.finish(&task_id, run_id, status);
        });

        true
    }

    async fn execute(
        &self,
        task: Arc<dyn GridTask>,
        options: RunOptions,
        ctx: TaskContext,
    ) -> TaskExecutionResult {
        let outcome = if options.atomic {
            let storage = self.grid.storage().clone();
            tokio::spawn(async move {
                storage
                    .run_in_transaction_async(|tx| {
                        let task = task.clone();
                        let ctx = ctx.with_storage(tx);
                        async move { task.run(&ctx).await }
                    })
                    .await
                    .map_err(|e| match e {
                        GridError::Transaction(inner) => inner,
                        other => anyhow::Error::new(other),
                    })
            })
            .await
        } else {
            tokio::spawn(async move { task.run(&ctx).await }).await
        };

        match outcome {
            Ok(Ok(value)) => TaskExecutionResult::completed(value),
            Ok(Err(e)) => TaskExecutionResult::failed(format!("{:#}", e)),
            Err(e) if e.is_panic() => TaskExecutionResult::failed(format!(
                "Task panicked: {}",
                panic_message(e.into_panic().as_ref())
            )),
            Err(e) => TaskExecutionResult::failed(format!("Task aborted: {}", e)),
        }
    }

    fn finish(&self, task_id: &str, run_id: u64, status: TaskExecutionResult) {
        match status.state {
            TaskState::Failed => tracing::warn!(
                "Task {} failed on node {}: {}",
                task_id,
                self.address(),
                status.error.as_deref().unwrap_or("unknown error")
            ),
            _ => tracing::info!("Task {} ended on node {} ({:?})", task_id, self.address(), status.state),
        }

        let progress = TaskProgress::now(Some(status));
        let recorded = match self.local_runs.get_mut(task_id) {
            Some(mut run) if run.run_id == run_id => {
                run.progress = progress.clone();
                true
            }
            _ => false,
        };

        if recorded {
            self.persist(task_id, &progress);
        } else {
            tracing::debug!("Status of task {} was cleared while it ran, dropping result", task_id);
        }
    }

    /// Refreshes the heartbeat of a running task every heartbeat interval.
    ///
    /// Stops on its own once the run is no longer `Running` or was cleared.
    fn spawn_heartbeat(self: &Arc<Self>, task_id: &str, run_id: u64) -> tokio::task::JoinHandle<()> {
        let worker = self.clone();
        let task_id = task_id.to_string();
        let interval = self.grid.config().heartbeat_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let progress = match worker.local_runs.get_mut(&task_id) {
                    Some(mut run)
                        if run.run_id == run_id
                            && run.progress.state() == Some(TaskState::Running) =>
                    {
                        run.progress.last_heartbeat = now_ms();
                        run.progress.clone()
                    }
                    _ => {
                        tracing::trace!("Task {} no longer needs heartbeats", task_id);
                        break;
                    }
                };

                worker.persist(&task_id, &progress);
            }
        })
    }

    // ============================================================
    // PROGRESS & SIGNALS
    // ============================================================

    /// Local progress of a task. Unknown tasks report no status with a fresh
    /// heartbeat.
    pub fn get_node_task_progress(&self, task_id: &str) -> TaskProgress {
        self.local_runs
            .get(task_id)
            .map(|run| run.progress.clone())
            .unwrap_or_else(|| TaskProgress::now(None))
    }

    pub fn set_grid_task_progress(&self, task_id: &str, progress: TaskProgress) {
        self.grid_progress.insert(task_id.to_string(), progress);
    }

    /// Latest grid-level progress published by the coordinator.
    pub fn get_grid_task_progress(&self, task_id: &str) -> Option<TaskProgress> {
        self.grid_progress.get(task_id).map(|p| p.clone())
    }

    pub(crate) fn take_grid_task_progress(&self, task_id: &str) -> Option<TaskProgress> {
        self.grid_progress.remove(task_id).map(|(_, p)| p)
    }

    pub fn stop_node_task(&self, task_id: &str) {
        tracing::info!("Stop requested for task {} on node {}", task_id, self.address());
        self.stop_signals
            .entry(task_id.to_string())
            .or_insert_with(|| watch::channel(false).0)
            .send_replace(true);
    }

    pub fn is_node_task_stop_requested(&self, task_id: &str) -> bool {
        self.stop_signals
            .get(task_id)
            .map(|signal| *signal.borrow())
            .unwrap_or(false)
    }

    /// Forgets the local status and stop flag of a task so it can run again.
    pub fn clear_task_status(&self, task_id: &str) {
        self.local_runs.remove(task_id);
        self.stop_signals.remove(task_id);
        if let Err(e) = self.store.remove_node_progress(task_id, self.address()) {
            tracing::warn!("Could not remove persisted progress of task {}: {}", task_id, e);
        }
        tracing::debug!("Cleared status of task {} on node {}", task_id, self.address());
    }

    pub fn set_pipeline_done(&self, pipeline_id: &str, result: Option<TaskExecutionResult>) {
        self.pipelines_done.insert(pipeline_id.to_string(), result);
    }

    /// Consumes the completion signal of a pipeline. The outer `Option` is
    /// `None` while the pipeline is not done.
    pub fn take_pipeline_done(&self, pipeline_id: &str) -> Option<Option<TaskExecutionResult>> {
        self.pipelines_done.remove(pipeline_id).map(|(_, r)| r)
    }

    pub fn request_pipeline_stop(&self, pipeline_id: &str) {
        tracing::info!("Stop requested for pipeline {} on node {}", pipeline_id, self.address());
        self.pipeline_stops.insert(pipeline_id.to_string());
    }

    pub fn is_pipeline_stop_requested(&self, pipeline_id: &str) -> bool {
        self.pipeline_stops.contains(pipeline_id)
    }

    pub fn clear_pipeline_stop(&self, pipeline_id: &str) {
        self.pipeline_stops.remove(pipeline_id);
    }
}

#[async_trait]
impl NodeEndpoint for Worker {
    async fn handle(
        &self,
        from: &NodeAddress,
        request: WorkerRequest,
    ) -> anyhow::Result<WorkerReply> {
        tracing::trace!("{} from {} on {}", request.name(), from, self.address());

        let reply = match request {
            WorkerRequest::StartTask { task, options } => {
                let worker = self
                    .me
                    .upgrade()
                    .ok_or_else(|| anyhow::anyhow!("worker is shutting down"))?;
                let task = self.registry.resolve(&task)?;
                WorkerReply::Started(worker.start_node_task(task, options))
            }
            WorkerRequest::StopTask { task_id } => {
                self.stop_node_task(&task_id);
                WorkerReply::Ack
            }
            WorkerRequest::GetProgress { task_id } => {
                WorkerReply::Progress(self.get_node_task_progress(&task_id))
            }
            WorkerRequest::SetGridProgress { task_id, progress } => {
                self.set_grid_task_progress(&task_id, progress);
                WorkerReply::Ack
            }
            WorkerRequest::ClearTaskStatus { task_id } => {
                self.clear_task_status(&task_id);
                WorkerReply::Ack
            }
            WorkerRequest::SetPipelineDone {
                pipeline_id,
                result,
            } => {
                self.set_pipeline_done(&pipeline_id, result);
                WorkerReply::Ack
            }
            WorkerRequest::StopPipeline { pipeline_id } => {
                self.request_pipeline_stop(&pipeline_id);
                WorkerReply::Ack
            }
        };
        Ok(reply)
    }
}
