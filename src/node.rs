use std::collections::HashSet;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::config::{NodeConfig, PeerConfig, PoolConfig, QueueConfig};
use crate::error::{PoolError, Result};
use crate::membership::{Cluster, Membership, NodeId, NodeMonitor, PeerTransport, QueueName};
use crate::scheduler::queue::{QueueEngine, QueueHandle};
use crate::worker::{TaskHandler, WorkerPool};

/// One node of the runtime: its queue owners, worker pools and node monitor.
pub struct Node {
    config: NodeConfig,
    membership: Membership,
    transport: Option<Arc<dyn PeerTransport>>,
    monitored: HashSet<NodeId>,
    queues: Vec<(QueueHandle, JoinHandle<()>)>,
    pools: Vec<WorkerPool>,
    background: Vec<JoinHandle<()>>,
    queues_shutdown: CancellationToken,
    workers_shutdown: CancellationToken,
    monitor_shutdown: CancellationToken,
}

impl Node {
    /// A single node with its own registry and no peers
    pub fn standalone(config: NodeConfig) -> Result<Self> {
        config.validate()?;
        if !config.peers.is_empty() {
            return Err(PoolError::InvalidConfig(
                "a standalone node cannot have peers".to_string(),
            ));
        }
        let membership = Membership::standalone(config.node_id);
        Ok(Self::build(config, membership, None))
    }

    /// A node connected to its peers through `transport`. Starts the node
    /// monitor when peers are configured; must run inside a tokio runtime.
    pub fn with_transport(
        config: NodeConfig,
        membership: Membership,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Self> {
        config.validate()?;
        if membership.node_id() != config.node_id {
            return Err(PoolError::InvalidConfig(format!(
                "membership view belongs to node {}, config to node {}",
                membership.node_id(),
                config.node_id
            )));
        }
        let peers = config.peers.clone();
        let mut node = Self::build(config, membership, Some(transport));
        node.monitor_peers(&peers)?;
        Ok(node)
    }

    /// Join an in-process cluster as `config.node_id`
    pub async fn join(cluster: &Arc<Cluster>, config: NodeConfig) -> Result<Self> {
        let membership = cluster.join(config.node_id).await;
        let transport = Arc::new(cluster.transport(config.node_id));
        Self::with_transport(config, membership, transport)
    }

    fn build(config: NodeConfig, membership: Membership, transport: Option<Arc<dyn PeerTransport>>) -> Self {
        tracing::info!(node_id = config.node_id, peers = config.peers.len(), "Node starting");
        Self {
            config,
            membership,
            transport,
            monitored: HashSet::new(),
            queues: Vec::new(),
            pools: Vec::new(),
            background: Vec::new(),
            queues_shutdown: CancellationToken::new(),
            workers_shutdown: CancellationToken::new(),
            monitor_shutdown: CancellationToken::new(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    /// Start a node monitor for peers not watched yet
    fn monitor_peers(&mut self, peers: &[PeerConfig]) -> Result<()> {
        let new_peers: Vec<PeerConfig> = peers
            .iter()
            .filter(|p| p.node_id != self.config.node_id && !self.monitored.contains(&p.node_id))
            .cloned()
            .collect();
        if new_peers.is_empty() {
            return Ok(());
        }
        let transport = self.transport.clone().ok_or_else(|| {
            PoolError::InvalidConfig("peers configured on a node without a transport".to_string())
        })?;

        self.monitored.extend(new_peers.iter().map(|p| p.node_id));
        let monitor = NodeMonitor::new(
            self.membership.clone(),
            new_peers,
            transport,
            self.config.reconnect_interval_ms,
        );
        self.background
            .push(tokio::spawn(monitor.run(self.monitor_shutdown.clone())));
        Ok(())
    }

    /// Start `config.replicas` queue owners for a queue.
    ///
    /// # Errors
    ///
    /// Invalid configuration (including hook arguments) is reported before
    /// any owner starts.
    pub async fn start_queue(&mut self, config: QueueConfig) -> Result<Vec<QueueHandle>> {
        config.validate()?;
        config.failure_hook.build(&config.queue)?;
        config.success_hook.build()?;

        let mut handles = Vec::with_capacity(config.replicas);
        for _ in 0..config.replicas {
            let (handle, task) = QueueEngine::start(
                &config,
                self.membership.clone(),
                self.config.mailbox_capacity,
                self.queues_shutdown.clone(),
            )
            .await?;
            handles.push(handle.clone());
            self.queues.push((handle, task));
        }
        Ok(handles)
    }

    /// Start a worker pool. Peers of a global pool are monitored like the
    /// node's own peers.
    pub fn start_workers<H: TaskHandler>(&mut self, config: PoolConfig, handler: Arc<H>) -> Result<&WorkerPool> {
        config.validate()?;
        let peers = config.peers.clone();
        self.monitor_peers(&peers)?;

        let pool = WorkerPool::start(
            config,
            handler,
            self.membership.clone(),
            self.config.mailbox_capacity,
            self.workers_shutdown.clone(),
        )?;
        self.pools.push(pool);
        let index = self.pools.len() - 1;
        Ok(&self.pools[index])
    }

    pub fn pool(&self, queue: &QueueName) -> Option<&WorkerPool> {
        self.pools.iter().find(|p| p.queue() == queue)
    }

    /// A new submitter on this node
    pub async fn client(&self) -> Client {
        Client::new(self.membership.clone()).await
    }

    /// Stop workers first so running jobs can report, then queue owners,
    /// then the node monitor.
    pub async fn shutdown(self) {
        tracing::info!(node_id = self.config.node_id, "Node shutting down");
        self.workers_shutdown.cancel();
        for pool in self.pools {
            pool.stop().await;
        }

        self.queues_shutdown.cancel();
        for (_, task) in self.queues {
            let _ = task.await;
        }

        self.monitor_shutdown.cancel();
        for task in self.background {
            let _ = task.await;
        }
        tracing::info!(node_id = self.config.node_id, "Node stopped");
    }
}
