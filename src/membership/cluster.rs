use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::config::PeerConfig;
use crate::error::{PoolError, Result};
use crate::membership::node_monitor::PeerTransport;
use crate::membership::{Membership, NodeId, Registry};

#[derive(Debug, Default)]
struct Topology {
    alive: HashSet<NodeId>,
    severed: HashSet<(NodeId, NodeId)>,
}

impl Topology {
    fn link(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
        (a.min(b), a.max(b))
    }
}

/// Several nodes sharing one registry inside a single process.
///
/// Links between nodes can be severed and healed to exercise partition
/// handling; node monitors observe the topology through [`LocalTransport`].
#[derive(Debug, Default)]
pub struct Cluster {
    registry: Arc<Registry>,
    topology: RwLock<Topology>,
}

impl Cluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Bring a node up and return its membership view
    pub async fn join(&self, node: NodeId) -> Membership {
        self.topology.write().await.alive.insert(node);
        tracing::info!(node_id = node, "Node joined cluster");
        Membership::new(node, self.registry.clone())
    }

    /// Take a node down; peers stop reaching it
    pub async fn leave(&self, node: NodeId) {
        self.topology.write().await.alive.remove(&node);
        tracing::info!(node_id = node, "Node left cluster");
    }

    /// Sever every link between the two sides
    pub async fn partition(&self, side_a: &[NodeId], side_b: &[NodeId]) {
        let mut topology = self.topology.write().await;
        for &a in side_a {
            for &b in side_b {
                if a != b {
                    topology.severed.insert(Topology::link(a, b));
                }
            }
        }
        tracing::info!(?side_a, ?side_b, "Cluster partitioned");
    }

    /// Restore every severed link
    pub async fn heal(&self) {
        self.topology.write().await.severed.clear();
        tracing::info!("Cluster partition healed");
    }

    pub async fn can_reach(&self, from: NodeId, to: NodeId) -> bool {
        let topology = self.topology.read().await;
        topology.alive.contains(&from)
            && topology.alive.contains(&to)
            && !topology.severed.contains(&Topology::link(from, to))
    }

    pub fn transport(self: &Arc<Self>, node: NodeId) -> LocalTransport {
        LocalTransport {
            cluster: self.clone(),
            node,
        }
    }
}

/// Peer transport backed by an in-process [`Cluster`].
#[derive(Debug, Clone)]
pub struct LocalTransport {
    cluster: Arc<Cluster>,
    node: NodeId,
}

#[async_trait]
impl PeerTransport for LocalTransport {
    async fn connect(&self, peer: &PeerConfig) -> Result<()> {
        if self.cluster.can_reach(self.node, peer.node_id).await {
            Ok(())
        } else {
            Err(PoolError::PeerUnreachable(peer.node_id))
        }
    }
}
