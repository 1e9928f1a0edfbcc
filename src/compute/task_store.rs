//! Grid-wide task bookkeeping kept in storage.

use super::types::{TaskExecutionResult, TaskProgress, TaskRequest, TaskState};
use crate::error::GridResult;
use crate::membership::types::NodeAddress;
use crate::storage::{GridMap, GridSet, GridStorage};

use serde::{Deserialize, Serialize};

pub const TASK_STATE_STORE: &str = "task_state";
pub const TASK_REQUESTS_STORE: &str = "taskRequests";
pub const TERMINATED_TASKS_STORE: &str = "terminatedTasks";
pub const WORKERS_TASK_PROGRESS_STORE: &str = "workersTaskProgress";
pub const TASK_LOCKS_STORE: &str = "taskLocks";

#[derive(Clone)]
pub struct TaskStore {
    states: GridMap<TaskState>,
    requests: GridMap<TaskRequest>,
    terminated: GridMap<TaskExecutionResult>,
    progress: GridMap<NodeProgress>,
    locks: GridSet<String>,
}

/// Persisted heartbeat of one node for one task. The owning task and node
/// are stored alongside, so lookups never depend on parsing the key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeProgress {
    task_id: String,
    node: NodeAddress,
    progress: TaskProgress,
}

/// The task id is length-prefixed so no `(task, node)` pair shares a key
/// with another.
fn progress_key(task_id: &str, node: &NodeAddress) -> String {
    format!("{}:{}:{}", task_id.len(), task_id, node)
}

impl TaskStore {
    pub fn open(storage: &GridStorage) -> GridResult<Self> {
        Ok(Self {
            states: storage.map(TASK_STATE_STORE)?,
            requests: storage.map(TASK_REQUESTS_STORE)?,
            terminated: storage.map(TERMINATED_TASKS_STORE)?,
            progress: storage.map(WORKERS_TASK_PROGRESS_STORE)?,
            locks: storage.set(TASK_LOCKS_STORE)?,
        })
    }

    pub fn state(&self, task_id: &str) -> GridResult<Option<TaskState>> {
        self.states.get(task_id)
    }

    pub fn set_state(&self, task_id: &str, state: TaskState) -> GridResult<()> {
        self.states.put(task_id, &state)?;
        Ok(())
    }

    pub fn record_request(&self, request: &TaskRequest) -> GridResult<()> {
        self.requests.put(&request.task_id, request)?;
        Ok(())
    }

    pub fn request(&self, task_id: &str) -> GridResult<Option<TaskRequest>> {
        self.requests.get(task_id)
    }

    pub fn remove_request(&self, task_id: &str) -> GridResult<bool> {
        self.requests.delete(task_id)
    }

    pub fn record_terminated(&self, task_id: &str, result: &TaskExecutionResult) -> GridResult<()> {
        self.terminated.put(task_id, result)?;
        Ok(())
    }

    pub fn terminated(&self, task_id: &str) -> GridResult<Option<TaskExecutionResult>> {
        self.terminated.get(task_id)
    }

    pub fn save_node_progress(
        &self,
        task_id: &str,
        node: &NodeAddress,
        progress: &TaskProgress,
    ) -> GridResult<()> {
        let entry = NodeProgress {
            task_id: task_id.to_string(),
            node: node.clone(),
            progress: progress.clone(),
        };
        self.progress.put(&progress_key(task_id, node), &entry)?;
        Ok(())
    }

    pub fn remove_node_progress(&self, task_id: &str, node: &NodeAddress) -> GridResult<bool> {
        self.progress.delete(&progress_key(task_id, node))
    }

    /// Last persisted progress of every node for `task_id`.
    pub fn node_progresses(&self, task_id: &str) -> GridResult<Vec<(NodeAddress, TaskProgress)>> {
        let mut found = Vec::new();
        self.progress.for_each(|_, entry| {
            if entry.task_id == task_id {
                found.push((entry.node, entry.progress));
            }
            true
        })?;
        Ok(found)
    }

    /// Returns `true` if the lock on `task_id` was free and is now held.
    pub fn try_lock(&self, task_id: &str) -> GridResult<bool> {
        self.locks.add(&task_id.to_string())
    }

    pub fn is_locked(&self, task_id: &str) -> GridResult<bool> {
        self.locks.contains(&task_id.to_string())
    }

    pub fn unlock(&self, task_id: &str) -> GridResult<bool> {
        self.locks.remove(&task_id.to_string())
    }
}
