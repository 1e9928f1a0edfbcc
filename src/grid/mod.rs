//! Grid Abstraction
//!
//! What the compute layer needs from the cluster it runs on: who we are, who
//! else is there, who coordinates, where shared state lives and how to reach
//! another node's worker.
//!
//! ## Core Concepts
//! - **`Grid`**: one node's handle on the cluster. Coordinator identity is a
//!   point-in-time answer and may change between calls.
//! - **`GridTransport`**: unicast request/reply to a node's `NodeEndpoint`.
//!   Failures are reported as a `NodeResponse`, never as a panic.
//! - **`GridConnector`**: joins a node to a grid and wires its compute stack.
//! - **`LocalCluster`**: the bundled in-process connector.

pub mod local;

pub use local::{LocalCluster, LocalGrid, LocalTransport};

use crate::compute::GridCompute;
use crate::compute::protocol::{WorkerReply, WorkerRequest};
use crate::config::GridConfig;
use crate::error::GridResult;
use crate::membership::types::NodeAddress;
use crate::storage::GridStorage;

use async_trait::async_trait;
use std::sync::Arc;

/// Outcome of one RPC to one node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeResponse<T> {
    Received(T),
    /// The node answered with an error.
    Failed(String),
    /// The node is suspected or did not answer in time.
    Suspected,
    /// The node is gone or was never reachable.
    Unreachable,
}

impl<T> NodeResponse<T> {
    pub fn is_valid(&self) -> bool {
        matches!(self, NodeResponse::Received(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            NodeResponse::Received(value) => Some(value),
            _ => None,
        }
    }

    /// Describes why the response is not valid. `None` for a received value.
    pub fn error_message(&self) -> Option<String> {
        match self {
            NodeResponse::Received(_) => None,
            NodeResponse::Failed(message) => Some(message.clone()),
            NodeResponse::Suspected => Some("Node suspected".to_string()),
            NodeResponse::Unreachable => Some("Node unreachable".to_string()),
        }
    }

    pub fn and_then<U, F>(self, f: F) -> NodeResponse<U>
    where
        F: FnOnce(T) -> NodeResponse<U>,
    {
        match self {
            NodeResponse::Received(value) => f(value),
            NodeResponse::Failed(message) => NodeResponse::Failed(message),
            NodeResponse::Suspected => NodeResponse::Suspected,
            NodeResponse::Unreachable => NodeResponse::Unreachable,
        }
    }
}

/// Server side of the transport: a node's worker.
#[async_trait]
pub trait NodeEndpoint: Send + Sync {
    async fn handle(&self, from: &NodeAddress, request: WorkerRequest)
    -> anyhow::Result<WorkerReply>;
}

#[async_trait]
pub trait GridTransport: Send + Sync {
    fn bind(&self, address: &NodeAddress, endpoint: Arc<dyn NodeEndpoint>);

    fn unbind(&self, address: &NodeAddress);

    async fn send(
        &self,
        from: &NodeAddress,
        to: &NodeAddress,
        request: WorkerRequest,
    ) -> NodeResponse<WorkerReply>;
}

/// One node's view of the grid.
pub trait Grid: Send + Sync {
    fn node_address(&self) -> &NodeAddress;

    fn config(&self) -> &GridConfig;

    fn storage(&self) -> &GridStorage;

    fn transport(&self) -> Arc<dyn GridTransport>;

    /// Current members, in join order.
    fn grid_members(&self) -> Vec<NodeAddress>;

    fn coord_address(&self) -> Option<NodeAddress>;

    fn is_coordinator(&self) -> bool {
        self.coord_address().as_ref() == Some(self.node_address())
    }

    fn grid_name(&self) -> &str {
        &self.config().grid_name
    }

    /// Leaves the grid and stops answering requests.
    fn close(&self);
}

#[async_trait]
pub trait GridConnector: Send + Sync {
    async fn connect(&self, node_name: &str) -> GridResult<GridNode>;
}

/// A connected node: its grid handle and compute façade.
#[derive(Clone)]
pub struct GridNode {
    grid: Arc<dyn Grid>,
    compute: Arc<GridCompute>,
}

impl GridNode {
    pub fn new(grid: Arc<dyn Grid>, compute: Arc<GridCompute>) -> Self {
        Self { grid, compute }
    }

    pub fn grid(&self) -> &Arc<dyn Grid> {
        &self.grid
    }

    pub fn compute(&self) -> &Arc<GridCompute> {
        &self.compute
    }

    pub fn storage(&self) -> &GridStorage {
        self.grid.storage()
    }

    pub fn node_address(&self) -> &NodeAddress {
        self.grid.node_address()
    }

    pub fn is_coordinator(&self) -> bool {
        self.grid.is_coordinator()
    }

    pub fn disconnect(&self) {
        tracing::info!("Node {} disconnecting", self.grid.node_address());
        self.grid.close();
    }
}
