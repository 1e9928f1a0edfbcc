//! In-process grid.
//!
//! All nodes of a `LocalCluster` share one storage backend, one membership
//! view and one transport. Each connected node signals liveness every
//! heartbeat interval; a background sweep suspects and then expels nodes
//! that stop doing so.

use super::{Grid, GridConnector, GridNode, GridTransport, NodeEndpoint, NodeResponse};
use crate::compute::GridCompute;
use crate::compute::protocol::{WorkerReply, WorkerRequest};
use crate::compute::registry::TaskRegistry;
use crate::config::GridConfig;
use crate::error::{GridError, GridResult};
use crate::membership::service::MembershipService;
use crate::membership::types::{NodeAddress, NodeState};
use crate::storage::GridStorage;

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

// ============================================================
// TRANSPORT
// ============================================================

pub struct LocalTransport {
    endpoints: DashMap<NodeAddress, Arc<dyn NodeEndpoint>>,
    membership: Arc<MembershipService>,
}

impl LocalTransport {
    pub fn new(membership: Arc<MembershipService>) -> Arc<Self> {
        Arc::new(Self {
            endpoints: DashMap::new(),
            membership,
        })
    }

    pub fn is_bound(&self, address: &NodeAddress) -> bool {
        self.endpoints.contains_key(address)
    }
}

#[async_trait]
impl GridTransport for LocalTransport {
    fn bind(&self, address: &NodeAddress, endpoint: Arc<dyn NodeEndpoint>) {
        tracing::debug!("Binding endpoint for {}", address);
        self.endpoints.insert(address.clone(), endpoint);
    }

    fn unbind(&self, address: &NodeAddress) {
        if self.endpoints.remove(address).is_some() {
            tracing::debug!("Unbound endpoint for {}", address);
        }
    }

    async fn send(
        &self,
        from: &NodeAddress,
        to: &NodeAddress,
        request: WorkerRequest,
    ) -> NodeResponse<WorkerReply> {
        match self.membership.state_of(to) {
            None | Some(NodeState::Dead) => return NodeResponse::Unreachable,
            Some(NodeState::Suspect) => return NodeResponse::Suspected,
            Some(NodeState::Alive) => {}
        }

        let Some(endpoint) = self.endpoints.get(to).map(|e| e.value().clone()) else {
            return NodeResponse::Unreachable;
        };

        let name = request.name();
        match endpoint.handle(from, request).await {
            Ok(reply) => NodeResponse::Received(reply),
            Err(e) => {
                tracing::debug!("{} on {} failed: {:#}", name, to, e);
                NodeResponse::Failed(format!("{:#}", e))
            }
        }
    }
}

// ============================================================
// GRID
// ============================================================

struct ClusterShared {
    config: GridConfig,
    storage: GridStorage,
    membership: Arc<MembershipService>,
    transport: Arc<LocalTransport>,
    registry: Arc<TaskRegistry>,
}

/// One node of a [`LocalCluster`].
pub struct LocalGrid {
    address: NodeAddress,
    shared: Arc<ClusterShared>,
    liveness: Mutex<Option<JoinHandle<()>>>,
}

impl LocalGrid {
    fn start_liveness(&self) {
        let membership = self.shared.membership.clone();
        let address = self.address.clone();
        let interval = self.shared.config.heartbeat_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if !membership.touch(&address) {
                    tracing::info!("Node {} is no longer a grid member", address);
                    break;
                }
            }
        });

        if let Ok(mut slot) = self.liveness.lock()
            && let Some(previous) = slot.replace(handle)
        {
            previous.abort();
        }
    }

    /// Stops signalling and answering without leaving the view, the way a
    /// crashed process would look to its peers.
    fn halt(&self) {
        if let Ok(mut slot) = self.liveness.lock()
            && let Some(handle) = slot.take()
        {
            handle.abort();
        }
        self.shared.transport.unbind(&self.address);
    }
}

impl Grid for LocalGrid {
    fn node_address(&self) -> &NodeAddress {
        &self.address
    }

    fn config(&self) -> &GridConfig {
        &self.shared.config
    }

    fn storage(&self) -> &GridStorage {
        &self.shared.storage
    }

    fn transport(&self) -> Arc<dyn GridTransport> {
        self.shared.transport.clone()
    }

    fn grid_members(&self) -> Vec<NodeAddress> {
        self.shared.membership.view_addresses()
    }

    fn coord_address(&self) -> Option<NodeAddress> {
        self.shared.membership.coordinator()
    }

    fn close(&self) {
        self.halt();
        self.shared.membership.leave(&self.address);
    }
}

impl Drop for LocalGrid {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.liveness.lock()
            && let Some(handle) = slot.take()
        {
            handle.abort();
        }
    }
}

// ============================================================
// CLUSTER
// ============================================================

/// In-process grid connector. Must be created inside a tokio runtime.
pub struct LocalCluster {
    shared: Arc<ClusterShared>,
    nodes: DashMap<NodeAddress, Arc<LocalGrid>>,
    detector: JoinHandle<()>,
}

impl LocalCluster {
    pub fn new(config: GridConfig) -> Arc<Self> {
        Self::with_storage(config, GridStorage::in_memory())
    }

    pub fn with_storage(config: GridConfig, storage: GridStorage) -> Arc<Self> {
        let membership = MembershipService::new(config.node_timeout());
        let transport = LocalTransport::new(membership.clone());
        let detector = membership
            .clone()
            .start_failure_detection(config.heartbeat_interval());

        tracing::info!(
            "Local grid '{}' ready (node timeout {:?}, heartbeat {:?})",
            config.grid_name,
            config.node_timeout(),
            config.heartbeat_interval()
        );

        Arc::new(Self {
            shared: Arc::new(ClusterShared {
                config,
                storage,
                membership,
                transport,
                registry: TaskRegistry::new(),
            }),
            nodes: DashMap::new(),
            detector,
        })
    }

    pub fn config(&self) -> &GridConfig {
        &self.shared.config
    }

    pub fn storage(&self) -> &GridStorage {
        &self.shared.storage
    }

    pub fn membership(&self) -> &Arc<MembershipService> {
        &self.shared.membership
    }

    pub fn transport(&self) -> &Arc<LocalTransport> {
        &self.shared.transport
    }

    /// Task kinds shared by every node of this cluster.
    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.shared.registry
    }

    /// Simulates a crash: the node stops answering and signalling but stays
    /// in the view until the failure detector expels it.
    pub fn crash(&self, address: &NodeAddress) -> bool {
        match self.nodes.remove(address) {
            Some((_, grid)) => {
                tracing::warn!("Crashing node {}", address);
                grid.halt();
                true
            }
            None => false,
        }
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        self.detector.abort();
    }
}

#[async_trait]
impl GridConnector for LocalCluster {
    async fn connect(&self, node_name: &str) -> GridResult<GridNode> {
        let address = NodeAddress::new(node_name);
        if self.nodes.contains_key(&address) && self.shared.transport.is_bound(&address) {
            return Err(GridError::Internal(format!(
                "node {} is already connected",
                address
            )));
        }

        let grid = Arc::new(LocalGrid {
            address: address.clone(),
            shared: self.shared.clone(),
            liveness: Mutex::new(None),
        });
        let compute = GridCompute::new(grid.clone(), self.shared.registry.clone())?;

        self.shared.transport.bind(&address, compute.worker().clone());
        self.shared.membership.join(&address);
        grid.start_liveness();
        self.nodes.insert(address.clone(), grid.clone());

        tracing::info!("Node {} connected to grid '{}'", address, self.shared.config.grid_name);
        Ok(GridNode::new(grid, compute))
    }
}
