//! Crawl Grid Library
//!
//! Coordination core shared by the crawler nodes of one grid: shared storage,
//! cluster-wide task execution and pipelines of tasks.
//! It serves as the foundation for the binary executable (`main.rs`).
//!
//! ## Architecture Modules
//! - **`storage`**: named maps, queues and sets shared by the grid, with
//!   transactions spanning them.
//! - **`compute`**: the task engine. A coordinator dispatches a task to the
//!   workers, tracks their heartbeats and aggregates their results.
//! - **`grid`**: what the compute layer needs from a cluster (identity,
//!   members, coordinator, transport), plus the in-process `LocalCluster`.
//! - **`membership`**: the member view used by `LocalCluster`: join-order
//!   coordinator election and suspect/dead failure detection.
//! - **`config`**: timeouts and intervals shared by every node.
//! - **`error`**: the `GridError` type returned across module seams.
//! - **`util`**: clock helper and the bounded polling primitive.

pub mod compute;
pub mod config;
pub mod error;
pub mod grid;
pub mod membership;
pub mod storage;
pub mod util;
