//! Grid Compute Module
//!
//! Runs tasks across the nodes of a grid and reports one aggregated result.
//!
//! ## Architecture Overview
//! Every node hosts the same stack; only the current coordinator drives a run:
//! 1. **Request**: any node calls `GridCompute::execute_task` (or `run_task`
//!    with a registered kind). Non-coordinators simply wait for the verdict.
//! 2. **Dispatch**: the coordinator persists `Running` and sends the task to
//!    its own worker (single-node tasks) or to every member's worker.
//! 3. **Tracking**: the coordinator polls each worker's `TaskProgress` every
//!    heartbeat interval, re-sends the task to nodes that lost it, drops nodes
//!    that stopped heartbeating and fails nodes it cannot reach.
//! 4. **Aggregation**: the per-node results are folded by the task, persisted
//!    and published to every node, which releases the waiters.
//!
//! ## Submodules
//! - **`types`**: task states, results, progress snapshots and run options.
//! - **`task`**: the `GridTask` trait, its run context and closure tasks.
//! - **`registry`**: maps task kinds (e.g. "crawl") to task factories.
//! - **`protocol`**: requests a coordinator sends to workers.
//! - **`task_store`**: task bookkeeping kept in grid storage.
//! - **`worker`**: executes tasks locally and keeps their heartbeats.
//! - **`dispatcher`**: fans requests out to the workers of the grid.
//! - **`coordinator`**: the dispatch/track/aggregate loop.
//! - **`pipeline`**: ordered, resumable chains of tasks.

pub mod compute;
pub mod coordinator;
pub mod dispatcher;
pub mod pipeline;
pub mod protocol;
pub mod registry;
pub mod task;
pub mod task_store;
pub mod types;
pub mod worker;

pub use compute::GridCompute;
pub use pipeline::{GridPipeline, PipelineStage};
pub use registry::TaskRegistry;
pub use task::{FnTask, GridTask, TaskContext};
pub use types::{ExecutionMode, RunOptions, TaskExecutionResult, TaskProgress, TaskState};

#[cfg(test)]
mod tests;
