use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use super::types::{Node, NodeAddress, NodeId, NodeState};

pub struct MembershipService {
    members: DashMap<NodeAddress, Node>,
    next_incarnation: AtomicU64,
    suspect_timeout: Duration,
    dead_timeout: Duration,
    evict_timeout: Duration,
}

impl MembershipService {
    /// A member silent for `node_timeout` becomes `Suspect`, `Dead` after
    /// twice that, and is forgotten after ten times that.
    pub fn new(node_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            members: DashMap::new(),
            next_incarnation: AtomicU64::new(1),
            suspect_timeout: node_timeout,
            dead_timeout: node_timeout * 2,
            evict_timeout: node_timeout * 10,
        })
    }

    /// Adds (or re-adds) a member. A rejoining address gets a new id and goes
    /// to the end of the join order.
    pub fn join(&self, address: &NodeAddress) -> Node {
        let node = Node {
            id: NodeId::new(),
            address: address.clone(),
            state: NodeState::Alive,
            incarnation: self.next_incarnation.fetch_add(1, Ordering::SeqCst),
            last_seen: Some(Instant::now()),
        };

        if let Some(previous) = self.members.insert(address.clone(), node.clone()) {
            tracing::info!(
                "Node {} rejoined (was {:?}, inc {} -> {})",
                address, previous.state, previous.incarnation, node.incarnation
            );
        } else {
            tracing::info!("Node {} joined grid (inc={})", address, node.incarnation);
        }
        tracing::info!("Grid size now: {}", self.view().len());

        node
    }

    /// Removes a member gracefully.
    pub fn leave(&self, address: &NodeAddress) -> bool {
        let removed = self.members.remove(address).is_some();
        if removed {
            tracing::info!("Node {} left grid. Grid size now: {}", address, self.view().len());
        }
        removed
    }

    /// Records a liveness signal. A suspected member is restored to `Alive`;
    /// a dead member stays dead until it rejoins.
    pub fn touch(&self, address: &NodeAddress) -> bool {
        match self.members.get_mut(address) {
            Some(mut member) => {
                if member.state == NodeState::Dead {
                    return false;
                }
                if member.state == NodeState::Suspect {
                    tracing::info!("Node {} refuted suspicion", address);
                    member.state = NodeState::Alive;
                }
                member.last_seen = Some(Instant::now());
                true
            }
            None => false,
        }
    }

    pub fn state_of(&self, address: &NodeAddress) -> Option<NodeState> {
        self.members.get(address).map(|m| m.state)
    }

    /// Members that are not dead, in join order.
    pub fn view(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .members
            .iter()
            .filter(|entry| entry.value().state != NodeState::Dead)
            .map(|entry| entry.value().clone())
            .collect();
        nodes.sort_by_key(|n| n.incarnation);
        nodes
    }

    pub fn view_addresses(&self) -> Vec<NodeAddress> {
        self.view().into_iter().map(|n| n.address).collect()
    }

    pub fn get_alive_members(&self) -> Vec<Node> {
        self.view()
            .into_iter()
            .filter(|n| n.state == NodeState::Alive)
            .collect()
    }

    /// The oldest member of the current view.
    pub fn coordinator(&self) -> Option<NodeAddress> {
        self.view().into_iter().next().map(|n| n.address)
    }

    /// Applies the suspect/dead/evict timeouts as of `now`. Returns the
    /// members whose state changed; evicted members are not reported.
    pub fn sweep(&self, now: Instant) -> Vec<(NodeAddress, NodeState)> {
        let mut transitions = Vec::new();
        let mut evicted = Vec::new();

        for mut entry in self.members.iter_mut() {
            let member = entry.value_mut();

            let Some(last_seen) = member.last_seen else {
                member.last_seen = Some(now);
                continue;
            };
            let elapsed = now.saturating_duration_since(last_seen);

            match member.state {
                NodeState::Alive if elapsed > self.suspect_timeout => {
                    tracing::warn!(
                        "Node {} suspected (no contact for {:?})",
                        member.address,
                        elapsed
                    );
                    member.state = NodeState::Suspect;
                    transitions.push((member.address.clone(), NodeState::Suspect));
                }
                NodeState::Suspect if elapsed > self.dead_timeout => {
                    tracing::warn!(
                        "Node {} declared DEAD (no contact for {:?})",
                        member.address,
                        elapsed
                    );
                    member.state = NodeState::Dead;
                    transitions.push((member.address.clone(), NodeState::Dead));
                }
                NodeState::Dead if elapsed > self.evict_timeout => {
                    evicted.push(member.address.clone());
                }
                _ => {}
            }
        }

        for address in evicted {
            if self
                .members
                .remove_if(&address, |_, member| member.state == NodeState::Dead)
                .is_some()
            {
                tracing::info!("Forgot dead node {}", address);
            }
        }

        if transitions.iter().any(|(_, s)| *s == NodeState::Dead) {
            tracing::info!("Grid size now: {} alive nodes", self.get_alive_members().len());
        }
        transitions
    }

    /// Runs [`sweep`](Self::sweep) every `interval` until the handle is aborted.
    pub fn start_failure_detection(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.sweep(Instant::now());
            }
        })
    }
}
