use super::task::GridTask;
use crate::membership::types::NodeAddress;
use crate::util::now_ms;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Lifecycle state of a task, either on one node or for the whole grid.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Not started (or not known) yet.
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    /// `Completed` and `Failed` are final; only they stop the coordinator
    /// from polling a node.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, TaskState::Running)
    }
}

/// Outcome of a task on one node, or the aggregated outcome for the grid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskExecutionResult {
    pub state: TaskState,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl TaskExecutionResult {
    pub fn new(state: TaskState, result: Option<Value>, error: Option<String>) -> Self {
        Self {
            state,
            result,
            error,
        }
    }

    pub fn pending() -> Self {
        Self::new(TaskState::Pending, None, None)
    }

    pub fn running() -> Self {
        Self::new(TaskState::Running, None, None)
    }

    pub fn completed(result: Option<Value>) -> Self {
        Self::new(TaskState::Completed, result, None)
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::new(TaskState::Failed, None, Some(error.into()))
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

impl Default for TaskExecutionResult {
    fn default() -> Self {
        Self::pending()
    }
}

/// Heartbeat snapshot of a task on a node.
///
/// `status == None` means the node has no progress to report for the task:
/// it never received it, or already cleared it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskProgress {
    pub status: Option<TaskExecutionResult>,
    /// Epoch milliseconds.
    pub last_heartbeat: u64,
}

impl TaskProgress {
    pub fn new(status: Option<TaskExecutionResult>, last_heartbeat: u64) -> Self {
        Self {
            status,
            last_heartbeat,
        }
    }

    /// Progress stamped with the current time.
    pub fn now(status: Option<TaskExecutionResult>) -> Self {
        Self::new(status, now_ms())
    }

    pub fn state(&self) -> Option<TaskState> {
        self.status.as_ref().map(|s| s.state)
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_some_and(|s| s.is_terminal())
    }

    /// True when no heartbeat was recorded within `timeout` of `now_ms`.
    pub fn is_stale(&self, now_ms: u64, timeout: Duration) -> bool {
        now_ms.saturating_sub(self.last_heartbeat) > timeout.as_millis() as u64
    }
}

/// Where a task runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Only the coordinator runs the task.
    SingleNode,
    /// Every member of the grid runs the task.
    #[default]
    AllNodes,
}

/// Per-run execution options.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RunOptions {
    /// Run the task body inside a storage transaction on each node.
    pub atomic: bool,
    /// Hold a grid-wide lock on the task id while the task runs.
    pub lock: bool,
}

impl RunOptions {
    pub fn atomic(mut self) -> Self {
        self.atomic = true;
        self
    }

    pub fn locked(mut self) -> Self {
        self.lock = true;
        self
    }
}

/// What travels to a worker in place of the task itself. Workers build the
/// task from their registry: by `kind` when it came from a registered
/// factory, otherwise from the instance this node published under `task_id`
/// when it was asked to run the task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskRef {
    pub task_id: String,
    pub kind: Option<String>,
}

impl TaskRef {
    pub fn of(task: &dyn GridTask) -> Self {
        Self {
            task_id: task.id().to_string(),
            kind: task.kind().map(str::to_string),
        }
    }
}

/// Bookkeeping entry written to the `taskRequests` store while a task is in flight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRequest {
    pub task_id: String,
    pub execution_mode: ExecutionMode,
    pub once: bool,
    pub options: RunOptions,
    pub coordinator: NodeAddress,
    pub requested_at: u64,
}
