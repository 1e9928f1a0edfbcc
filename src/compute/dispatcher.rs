//! Work Dispatcher
//!
//! Sends worker requests to one or many nodes through the grid transport.
//! Broadcasts fan out concurrently; every call is bounded by the configured
//! RPC timeout and a call that times out is reported as `Suspected`.

use super::protocol::{WorkerReply, WorkerRequest};
use super::task::GridTask;
use super::types::{ExecutionMode, RunOptions, TaskExecutionResult, TaskProgress, TaskRef};
use crate::grid::{Grid, NodeResponse};
use crate::membership::types::NodeAddress;

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;

fn unexpected<T>(reply: WorkerReply) -> NodeResponse<T> {
    NodeResponse::Failed(format!("Unexpected reply: {:?}", reply))
}

pub struct WorkDispatcher {
    grid: Arc<dyn Grid>,
}

impl WorkDispatcher {
    pub fn new(grid: Arc<dyn Grid>) -> Arc<Self> {
        Arc::new(Self { grid })
    }

    async fn call(&self, to: &NodeAddress, request: WorkerRequest) -> NodeResponse<WorkerReply> {
        call_node(self.grid.as_ref(), to, request).await
    }

    async fn broadcast(
        &self,
        nodes: Vec<NodeAddress>,
        request: WorkerRequest,
    ) -> BTreeMap<NodeAddress, NodeResponse<WorkerReply>> {
        let mut calls = JoinSet::new();
        for node in nodes {
            let grid = self.grid.clone();
            let request = request.clone();
            calls.spawn(async move {
                let response = call_node(grid.as_ref(), &node, request).await;
                (node, response)
            });
        }

        let mut responses = BTreeMap::new();
        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok((node, response)) => {
                    responses.insert(node, response);
                }
                Err(e) => tracing::error!("{} broadcast call aborted: {}", request.name(), e),
            }
        }
        responses
    }

    fn log_failures(&self, request: &str, responses: &BTreeMap<NodeAddress, NodeResponse<WorkerReply>>) {
        for (node, response) in responses {
            if let Some(error) = response.error_message() {
                tracing::warn!("{} on {} failed: {}", request, node, error);
            }
        }
    }

    /// Starts `task` where its execution mode says: on the coordinator only,
    /// or on every member.
    pub async fn start_task_on_nodes(
        &self,
        task: Arc<dyn GridTask>,
        options: RunOptions,
    ) -> BTreeMap<NodeAddress, NodeResponse<bool>> {
        let targets = match task.execution_mode() {
            ExecutionMode::SingleNode => self.grid.coord_address().into_iter().collect(),
            ExecutionMode::AllNodes => self.grid.grid_members(),
        };
        tracing::debug!("Dispatching task {} to {} node(s)", task.id(), targets.len());

        let request = WorkerRequest::StartTask {
            task: TaskRef::of(task.as_ref()),
            options,
        };
        let responses = self.broadcast(targets, request).await;
        self.log_failures("startNodeTask", &responses);

        responses
            .into_iter()
            .map(|(node, response)| {
                let started = response.and_then(|reply| match reply {
                    WorkerReply::Started(started) => NodeResponse::Received(started),
                    other => unexpected(other),
                });
                (node, started)
            })
            .collect()
    }

    /// Starts `task` on a single node. A single-node task is only ever sent
    /// to the coordinator; aiming it elsewhere is ignored.
    pub async fn start_task_on_node(
        &self,
        task: Arc<dyn GridTask>,
        options: RunOptions,
        node: &NodeAddress,
    ) -> NodeResponse<bool> {
        if task.execution_mode() == ExecutionMode::SingleNode
            && self.grid.coord_address().as_ref() != Some(node)
        {
            tracing::debug!(
                "Not sending single-node task {} to non-coordinator {}",
                task.id(),
                node
            );
            return NodeResponse::Received(false);
        }

        let request = WorkerRequest::StartTask {
            task: TaskRef::of(task.as_ref()),
            options,
        };
        self.call(node, request)
            .await
            .and_then(|reply| match reply {
                WorkerReply::Started(started) => NodeResponse::Received(started),
                other => unexpected(other),
            })
    }

    pub async fn get_task_progress_from_nodes(
        &self,
        task_id: &str,
        nodes: Vec<NodeAddress>,
    ) -> BTreeMap<NodeAddress, NodeResponse<TaskProgress>> {
        let request = WorkerRequest::GetProgress {
            task_id: task_id.to_string(),
        };

        self.broadcast(nodes, request)
            .await
            .into_iter()
            .map(|(node, response)| {
                let progress = response.and_then(|reply| match reply {
                    WorkerReply::Progress(progress) => NodeResponse::Received(progress),
                    other => unexpected(other),
                });
                (node, progress)
            })
            .collect()
    }

    /// Asks every member to stop `task_id`.
    pub async fn stop_task_on_nodes(&self, task_id: &str) {
        tracing::info!("Requesting stop of task {} on all nodes", task_id);
        let responses = self
            .broadcast(
                self.grid.grid_members(),
                WorkerRequest::StopTask {
                    task_id: task_id.to_string(),
                },
            )
            .await;
        self.log_failures("stopNodeTask", &responses);
    }

    pub async fn set_grid_task_progress_on_nodes(&self, task_id: &str, progress: TaskProgress) {
        let responses = self
            .broadcast(
                self.grid.grid_members(),
                WorkerRequest::SetGridProgress {
                    task_id: task_id.to_string(),
                    progress,
                },
            )
            .await;
        self.log_failures("setGridTaskProgress", &responses);
    }

    /// Clears the local status of `task_id` on every member. Returns the
    /// nodes that could not be cleared, with the reason.
    pub async fn clear_task_status_on_nodes(&self, task_id: &str) -> Vec<(NodeAddress, String)> {
        self.broadcast(
            self.grid.grid_members(),
            WorkerRequest::ClearTaskStatus {
                task_id: task_id.to_string(),
            },
        )
        .await
        .into_iter()
        .filter_map(|(node, response)| response.error_message().map(|e| (node, e)))
        .collect()
    }

    pub async fn set_pipeline_done_on_nodes(
        &self,
        pipeline_id: &str,
        result: Option<TaskExecutionResult>,
    ) {
        let responses = self
            .broadcast(
                self.grid.grid_members(),
                WorkerRequest::SetPipelineDone {
                    pipeline_id: pipeline_id.to_string(),
                    result,
                },
            )
            .await;
        self.log_failures("setPipelineDone", &responses);
    }

    /// Forwards a pipeline stop request to the coordinator.
    pub async fn stop_pipeline(&self, pipeline_id: &str) -> NodeResponse<()> {
        let Some(coordinator) = self.grid.coord_address() else {
            return NodeResponse::Unreachable;
        };

        self.call(
            &coordinator,
            WorkerRequest::StopPipeline {
                pipeline_id: pipeline_id.to_string(),
            },
        )
        .await
        .and_then(|_| NodeResponse::Received(()))
    }
}

async fn call_node(grid: &dyn Grid, to: &NodeAddress, request: WorkerRequest) -> NodeResponse<WorkerReply> {
    let name = request.name();
    let transport = grid.transport();

    match tokio::time::timeout(
        grid.config().rpc_timeout(),
        transport.send(grid.node_address(), to, request),
    )
    .await
    {
        Ok(response) => response,
        Err(_) => {
            tracing::warn!("{} to {} timed out", name, to);
            NodeResponse::Suspected
        }
    }
}
