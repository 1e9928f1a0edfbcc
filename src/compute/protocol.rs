//! Messages exchanged between the dispatcher and node workers.
//!
//! Every message is plain serde data. A start request names the task through
//! a [`TaskRef`] and the receiving worker builds it from its registry.

use super::types::{RunOptions, TaskExecutionResult, TaskProgress, TaskRef};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerRequest {
    StartTask {
        task: TaskRef,
        options: RunOptions,
    },
    StopTask {
        task_id: String,
    },
    GetProgress {
        task_id: String,
    },
    SetGridProgress {
        task_id: String,
        progress: TaskProgress,
    },
    ClearTaskStatus {
        task_id: String,
    },
    SetPipelineDone {
        pipeline_id: String,
        result: Option<TaskExecutionResult>,
    },
    StopPipeline {
        pipeline_id: String,
    },
}

impl WorkerRequest {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerRequest::StartTask { .. } => "startNodeTask",
            WorkerRequest::StopTask { .. } => "stopNodeTask",
            WorkerRequest::GetProgress { .. } => "getNodeTaskProgress",
            WorkerRequest::SetGridProgress { .. } => "setGridTaskProgress",
            WorkerRequest::ClearTaskStatus { .. } => "clearTaskStatus",
            WorkerRequest::SetPipelineDone { .. } => "setPipelineDone",
            WorkerRequest::StopPipeline { .. } => "stopPipeline",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerReply {
    Ack,
    /// Whether a start request actually started the task.
    Started(bool),
    Progress(TaskProgress),
}
