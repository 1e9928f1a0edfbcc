//! Task Coordinator
//!
//! Drives one task execution across the grid.
//!
//! ## Lifecycle
//! 1. **Dispatch**: the coordinator persists `Running` and sends the task to
//!    the coordinator itself (single-node tasks) or to every member.
//! 2. **Polling**: every heartbeat interval it asks the pending nodes for
//!    their progress. Nodes without a status get the task again; nodes whose
//!    heartbeat is older than the node timeout are dropped; nodes that cannot
//!    be reached get a synthesized `Failed` status.
//! 3. **Aggregation**: once every node is done (or the task times out) the
//!    per-node results are folded by the task, persisted, and published to
//!    every node as the grid progress.
//!
//! Non-coordinator nodes do not dispatch anything: they wait until the
//! coordinator publishes a terminal grid progress for the task.

use super::dispatcher::WorkDispatcher;
use super::registry::TaskRegistry;
use super::task::GridTask;
use super::task_store::TaskStore;
use super::types::{
    ExecutionMode, RunOptions, TaskExecutionResult, TaskProgress, TaskRequest, TaskState,
};
use super::worker::Worker;
use crate::error::{GridError, GridResult};
use crate::grid::{Grid, NodeResponse};
use crate::membership::types::NodeAddress;
use crate::util::now_ms;
use crate::util::wait::{Backoff, Check, WaitOutcome, wait_until};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

const COORDINATOR_EXPIRED: &str = "Task expired. No heartbeat received from coordinator.";

/// Coordinator-side state of one `execute_task` call.
struct AggregatedContext {
    last_progresses: BTreeMap<NodeAddress, TaskProgress>,
    done_nodes: BTreeSet<NodeAddress>,
    task_start_time: u64,
    task_timeout: Option<Duration>,
    all_done: bool,
}

impl AggregatedContext {
    fn new(task_timeout: Option<Duration>) -> Self {
        Self {
            last_progresses: BTreeMap::new(),
            done_nodes: BTreeSet::new(),
            task_start_time: now_ms(),
            task_timeout,
            all_done: false,
        }
    }

    fn elapsed_ms(&self) -> u64 {
        now_ms().saturating_sub(self.task_start_time)
    }

    fn is_expired(&self) -> bool {
        match self.task_timeout {
            Some(timeout) => self.elapsed_ms() >= timeout.as_millis() as u64,
            None => false,
        }
    }
}

pub struct TaskCoordinator {
    grid: Arc<dyn Grid>,
    dispatcher: Arc<WorkDispatcher>,
    worker: Arc<Worker>,
    registry: Arc<TaskRegistry>,
    store: TaskStore,
}

impl TaskCoordinator {
    pub fn new(
        grid: Arc<dyn Grid>,
        dispatcher: Arc<WorkDispatcher>,
        worker: Arc<Worker>,
        registry: Arc<TaskRegistry>,
        store: TaskStore,
    ) -> Arc<Self> {
        Arc::new(Self {
            grid,
            dispatcher,
            worker,
            registry,
            store,
        })
    }

    /// Runs `task` on the grid and returns its aggregated result.
    ///
    /// On a non-coordinator node this only waits for the coordinator's
    /// verdict. Errors are reserved for faults of the grid itself; task
    /// failures, timeouts and unreachable nodes come back as a `Failed` result.
    pub async fn execute_task(
        &self,
        task: Arc<dyn GridTask>,
        options: RunOptions,
    ) -> GridResult<TaskExecutionResult> {
        if self.grid.coord_address().is_none() {
            return Err(GridError::Coordinator(format!(
                "No coordinator in grid '{}', is node {} connected?",
                self.grid.grid_name(),
                self.grid.node_address()
            )));
        }
        // Lets this node's worker build the task when the coordinator sends it.
        self.registry.publish(&task);

        if !self.grid.is_coordinator() {
            tracing::debug!(
                "Node {} waiting for the coordinator to run task {}",
                self.grid.node_address(),
                task.id()
            );
            return self.await_coordinator_done_signal(task.id()).await;
        }

        let task_id = task.id().to_string();

        if options.lock && !self.acquire_lock(&task_id).await? {
            let result = TaskExecutionResult::failed(format!(
                "Could not acquire lock for task {} before the task timeout",
                task_id
            ));
            tracing::error!("{}", result.error.as_deref().unwrap_or(""));
            self.publish(&task_id, result.clone()).await;
            return Ok(result);
        }

        let outcome = self.coordinate(task, options).await;

        if options.lock
            && let Err(e) = self.store.unlock(&task_id)
        {
            tracing::error!("Could not release lock of task {}: {}", task_id, e);
        }
        outcome
    }

    async fn coordinate(
        &self,
        task: Arc<dyn GridTask>,
        options: RunOptions,
    ) -> GridResult<TaskExecutionResult> {
        let task_id = task.id().to_string();
        let state = self.store.state(&task_id)?.unwrap_or(TaskState::Pending);

        if task.once() && state.is_terminal() {
            let result = TaskExecutionResult::failed(format!(
                "Task already ran in this grid session with state: {:?}",
                state
            ));
            tracing::warn!("Not running task {}: {}", task_id, result.error.as_deref().unwrap_or(""));
            self.publish(&task_id, result.clone()).await;
            return Ok(result);
        }

        // A coordinator never starts a task already running, but a newly
        // elected one takes over tracking it.
        let takeover = state.is_running();

        let outcome = self.run_tracked(task, options, takeover).await;
        self.retire(&task_id).await;
        outcome
    }

    async fn run_tracked(
        &self,
        task: Arc<dyn GridTask>,
        options: RunOptions,
        takeover: bool,
    ) -> GridResult<TaskExecutionResult> {
        let task_id = task.id().to_string();
        let mut agg = AggregatedContext::new(self.grid.config().task_timeout());

        self.store.record_request(&TaskRequest {
            task_id: task_id.clone(),
            execution_mode: task.execution_mode(),
            once: task.once(),
            options,
            coordinator: self.grid.node_address().clone(),
            requested_at: agg.task_start_time,
        })?;

        if takeover {
            tracing::warn!(
                "Coordinator {} found task {} already running. Could be newly elected. Taking over.",
                self.grid.node_address(),
                task_id
            );
            for (node, progress) in self.store.node_progresses(&task_id)? {
                agg.last_progresses.insert(node, progress);
            }
        } else {
            tracing::info!(
                "Coordinator {} executing task: {}",
                self.grid.node_address(),
                task_id
            );
            self.store.set_state(&task_id, TaskState::Running)?;
            self.dispatcher.start_task_on_nodes(task.clone(), options).await;
        }

        self.track_and_aggregate(task, options, &mut agg).await
    }

    async fn track_and_aggregate(
        &self,
        task: Arc<dyn GridTask>,
        options: RunOptions,
        agg: &mut AggregatedContext,
    ) -> GridResult<TaskExecutionResult> {
        let task_id = task.id().to_string();
        let interval = self.grid.config().heartbeat_interval();

        let started = agg.task_start_time;
        for node in self.expected_nodes(task.as_ref()) {
            agg.last_progresses
                .entry(node)
                .or_insert_with(|| TaskProgress::new(Some(TaskExecutionResult::pending()), started));
        }
        // Replaces any grid progress left over from an earlier run.
        self.publish(&task_id, TaskExecutionResult::running()).await;

        while !agg.all_done && !agg.is_expired() {
            let pending = self.pending_nodes(task.as_ref(), &agg.done_nodes);
            if pending.is_empty() {
                agg.all_done = true;
                break;
            }

            self.track_progress(task.clone(), options, pending, agg).await;
            if self.pending_nodes(task.as_ref(), &agg.done_nodes).is_empty() {
                agg.all_done = true;
                break;
            }

            self.publish(&task_id, TaskExecutionResult::running()).await;
            tokio::time::sleep(interval).await;
        }

        self.conclude(task.as_ref(), agg).await
    }

    async fn track_progress(
        &self,
        task: Arc<dyn GridTask>,
        options: RunOptions,
        pending: Vec<NodeAddress>,
        agg: &mut AggregatedContext,
    ) {
        let task_id = task.id();
        let node_timeout = self.grid.config().node_timeout();
        let responses = self
            .dispatcher
            .get_task_progress_from_nodes(task_id, pending)
            .await;

        for (node, response) in responses {
            let progress = response.value().cloned();
            if let Some(progress) = &progress {
                agg.last_progresses.insert(node.clone(), progress.clone());
            }
            let status = progress.as_ref().and_then(|p| p.status.clone());

            // Statuses are set the moment a node receives the task. None
            // means the node never got it (e.g. it joined late).
            if response.is_valid() && status.is_none() {
                tracing::debug!("Node {} has no status for task {}, sending it", node, task_id);
                self.dispatcher
                    .start_task_on_node(task.clone(), options, &node)
                    .await;
            }

            // A node that stops answering is measured from its last known
            // heartbeat, so a crash is reported as a failure, not an expiry.
            let expired = match progress.as_ref().or_else(|| agg.last_progresses.get(&node)) {
                Some(progress) => progress.is_stale(now_ms(), node_timeout),
                None => now_ms().saturating_sub(agg.task_start_time) > node_timeout.as_millis() as u64,
            };
            if expired {
                agg.done_nodes.insert(node.clone());
                tracing::error!(
                    "Node {} expired - No heartbeat received for task {}.",
                    node,
                    task_id
                );
                continue;
            }

            if response.is_valid() {
                if let Some(status) = &status
                    && status.is_terminal()
                {
                    tracing::debug!(
                        "Task {} done on node {} with state: {:?}",
                        task_id,
                        node,
                        status.state
                    );
                    agg.done_nodes.insert(node);
                }
            } else {
                self.handle_error(agg, &node, &response, progress);
                agg.done_nodes.insert(node);
            }
        }
    }

    fn handle_error(
        &self,
        agg: &mut AggregatedContext,
        node: &NodeAddress,
        response: &NodeResponse<TaskProgress>,
        progress: Option<TaskProgress>,
    ) {
        let status = progress.as_ref().and_then(|p| p.status.clone());
        let heartbeat = progress.map(|p| p.last_heartbeat).unwrap_or(0);

        let error = status
            .as_ref()
            .and_then(|s| s.error.clone())
            .or_else(|| response.error_message())
            .unwrap_or_else(|| "No response or failed RPC".to_string());
        tracing::error!("Node {} failed to report progress: {}", node, error);

        if status.map(|s| s.state) != Some(TaskState::Failed) {
            agg.last_progresses.insert(
                node.clone(),
                TaskProgress::new(Some(TaskExecutionResult::failed(error)), heartbeat),
            );
        }
    }

    /// Produces, persists and publishes the final result.
    async fn conclude(
        &self,
        task: &dyn GridTask,
        agg: &AggregatedContext,
    ) -> GridResult<TaskExecutionResult> {
        let task_id = task.id();

        let result = if !agg.all_done {
            let error = match (agg.is_expired(), agg.task_timeout) {
                (true, Some(timeout)) => {
                    format!("Task {} timed out after {:?}.", task_id, timeout)
                }
                _ => "Task coordinator reported being done while some nodes are still \
                      executing. This should not happen. Failing the task."
                    .to_string(),
            };
            tracing::error!("{}", error);
            TaskExecutionResult::failed(error)
        } else {
            let statuses = agg
                .last_progresses
                .values()
                .map(|p| p.status.clone().unwrap_or_default())
                .collect();
            task.aggregate(statuses)
                .unwrap_or_else(|| TaskExecutionResult::failed("Task produced no aggregated result"))
        };

        tracing::info!(
            "Task {} ended with state {:?} after {} ms",
            task_id,
            result.state,
            agg.elapsed_ms()
        );

        let persisted = self
            .store
            .set_state(task_id, result.state)
            .and_then(|_| self.store.record_terminated(task_id, &result));
        self.publish(task_id, result.clone()).await;
        persisted?;

        Ok(result)
    }

    /// Clears node statuses and the request entry. Failures are only logged.
    async fn retire(&self, task_id: &str) {
        for (node, error) in self.dispatcher.clear_task_status_on_nodes(task_id).await {
            tracing::error!("Could not clear status of task {} on node {}: {}", task_id, node, error);
        }
        if let Err(e) = self.store.remove_request(task_id) {
            tracing::error!("Could not remove request of task {}: {}", task_id, e);
        }
    }

    async fn publish(&self, task_id: &str, status: TaskExecutionResult) {
        self.dispatcher
            .set_grid_task_progress_on_nodes(task_id, TaskProgress::now(Some(status)))
            .await;
    }

    fn expected_nodes(&self, task: &dyn GridTask) -> Vec<NodeAddress> {
        match task.execution_mode() {
            ExecutionMode::SingleNode => self.grid.coord_address().into_iter().collect(),
            ExecutionMode::AllNodes => self.grid.grid_members(),
        }
    }

    fn pending_nodes(&self, task: &dyn GridTask, done: &BTreeSet<NodeAddress>) -> Vec<NodeAddress> {
        self.expected_nodes(task)
            .into_iter()
            .filter(|node| !done.contains(node))
            .collect()
    }

    /// Waits for the grid-wide lock on `task_id`, publishing `Running` while
    /// waiting so other nodes keep hearing from the coordinator. Returns
    /// `false` if the task timeout elapsed first.
    async fn acquire_lock(&self, task_id: &str) -> GridResult<bool> {
        if self.store.try_lock(task_id)? {
            return Ok(true);
        }
        tracing::info!("Task {} is locked, waiting for the lock to be released", task_id);

        let store = &self.store;
        let coordinator = self;
        let outcome = wait_until(
            move || async move {
                match store.try_lock(task_id) {
                    Ok(true) => return Check::Ready(Ok(())),
                    Ok(false) => {}
                    Err(e) => return Check::Ready(Err(e)),
                }
                match coordinator.lock_is_orphaned(task_id) {
                    Ok(true) => Check::Ready(Ok(())),
                    Ok(false) => {
                        coordinator.publish(task_id, TaskExecutionResult::running()).await;
                        Check::NotYet
                    }
                    Err(e) => Check::Ready(Err(e)),
                }
            },
            Backoff::fixed(self.grid.config().heartbeat_interval()),
            self.grid.config().task_timeout(),
        )
        .await;

        match outcome {
            WaitOutcome::Done(Ok(())) => Ok(true),
            WaitOutcome::Done(Err(e)) => Err(e),
            WaitOutcome::Expired | WaitOutcome::Cancelled => Ok(false),
        }
    }

    /// A lock is orphaned when the coordinator that recorded the request
    /// holding it left the grid. The new coordinator inherits it.
    fn lock_is_orphaned(&self, task_id: &str) -> GridResult<bool> {
        let Some(request) = self.store.request(task_id)? else {
            return Ok(false);
        };
        let orphaned = request.coordinator != *self.grid.node_address()
            && !self.grid.grid_members().contains(&request.coordinator);
        if orphaned {
            tracing::warn!(
                "Lock of task {} was held by departed coordinator {}. Inheriting it.",
                task_id,
                request.coordinator
            );
        }
        Ok(orphaned)
    }

    /// Waits until the coordinator publishes a terminal grid progress for
    /// `task_id`, a local stop is requested, or the coordinator goes silent
    /// for longer than the node timeout.
    async fn await_coordinator_done_signal(&self, task_id: &str) -> GridResult<TaskExecutionResult> {
        let wait_start = now_ms();
        let node_timeout_ms = self.grid.config().node_timeout().as_millis() as u64;
        let worker = &self.worker;
        let node = self.grid.node_address();

        let outcome = wait_until(
            move || async move {
                if worker.is_node_task_stop_requested(task_id) {
                    tracing::info!(
                        "Node {} received a request to stop task {} while waiting for the \
                         coordinator. No longer waiting.",
                        node,
                        task_id
                    );
                    return Check::Ready(Ok(TaskExecutionResult::completed(None)));
                }

                let progress = worker.get_grid_task_progress(task_id);
                if let Some(progress) = &progress
                    && let Some(status) = &progress.status
                    && status.is_terminal()
                {
                    worker.take_grid_task_progress(task_id);
                    return Check::Ready(Ok(status.clone()));
                }

                let last_heard = progress
                    .map(|p| p.last_heartbeat)
                    .unwrap_or(0)
                    .max(wait_start);
                if now_ms().saturating_sub(last_heard) > node_timeout_ms {
                    return Check::Ready(Err(GridError::Expired(COORDINATOR_EXPIRED.to_string())));
                }
                Check::NotYet
            },
            Backoff::fixed(self.grid.config().heartbeat_interval()),
            None,
        )
        .await;

        match outcome {
            WaitOutcome::Done(result) => result,
            WaitOutcome::Expired | WaitOutcome::Cancelled => {
                Err(GridError::Expired(COORDINATOR_EXPIRED.to_string()))
            }
        }
    }

    /// Asks every node to stop `task_id`. Any node may call this.
    pub async fn stop_task(&self, task_id: &str) {
        self.dispatcher.stop_task_on_nodes(task_id).await;
    }
}
