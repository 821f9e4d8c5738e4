use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

use crate::config::PeerConfig;
use crate::error::Result;
use crate::membership::Membership;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(100);

/// Connectivity to peer nodes.
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    /// Establish (or confirm) a connection to `peer`.
    async fn connect(&self, peer: &PeerConfig) -> Result<()>;
}

/// Tracks reachability of configured peers for one node.
///
/// A peer that stops answering is marked down in the node's membership view,
/// which hides its processes from global groups. When it answers again it is
/// marked up, and the resulting [`NodeEvent::Up`](crate::membership::NodeEvent)
/// makes local queue owners and workers re-register so dispatch sees the whole
/// cluster again.
pub struct NodeMonitor<T: PeerTransport + ?Sized> {
    membership: Membership,
    peers: Vec<PeerConfig>,
    transport: Arc<T>,
    interval: Duration,
}

impl<T: PeerTransport + ?Sized> NodeMonitor<T> {
    pub fn new(
        membership: Membership,
        peers: Vec<PeerConfig>,
        transport: Arc<T>,
        interval_ms: u64,
    ) -> Self {
        Self {
            membership,
            peers,
            transport,
            interval: Duration::from_millis(interval_ms),
        }
    }

    /// Probe every peer once, updating the membership view
    pub async fn connect_to_peers(&self) {
        let node_id = self.membership.node_id();
        for peer in &self.peers {
            if peer.node_id == node_id {
                continue;
            }
            let reachable = matches!(
                timeout(CONNECT_TIMEOUT, self.transport.connect(peer)).await,
                Ok(Ok(()))
            );

            if reachable {
                if self.membership.node_up(peer.node_id).await {
                    tracing::info!(node_id, peer_id = peer.node_id, addr = %peer.addr, "Connected to peer");
                }
            } else if self.membership.node_down(peer.node_id).await {
                tracing::warn!(node_id, peer_id = peer.node_id, addr = %peer.addr, "Lost connection to peer");
            } else {
                tracing::trace!(peer_id = peer.node_id, "Peer still unreachable");
            }
        }
    }

    /// Run until `shutdown` is cancelled, reconnecting on every tick
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => self.connect_to_peers().await,
            }
        }

        tracing::debug!(node_id = self.membership.node_id(), "Node monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::{Cluster, NodeEvent};

    fn peer(node_id: u64) -> PeerConfig {
        PeerConfig {
            node_id,
            addr: format!("node-{}", node_id),
        }
    }

    #[tokio::test]
    async fn marks_peers_down_and_up() {
        let cluster = Cluster::new();
        let membership = cluster.join(1).await;
        cluster.join(2).await;
        let mut events = membership.subscribe();

        let monitor = NodeMonitor::new(
            membership.clone(),
            vec![peer(1), peer(2)],
            Arc::new(cluster.transport(1)),
            50,
        );

        monitor.connect_to_peers().await;
        assert!(membership.is_visible(2).await);
        assert_eq!(events.recv().await.unwrap(), NodeEvent::Up(2));

        cluster.partition(&[1], &[2]).await;
        monitor.connect_to_peers().await;
        assert!(!membership.is_visible(2).await);
        assert_eq!(events.recv().await.unwrap(), NodeEvent::Down(2));

        cluster.heal().await;
        monitor.connect_to_peers().await;
        assert_eq!(events.recv().await.unwrap(), NodeEvent::Up(2));
    }
}
