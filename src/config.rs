use serde_json::Value;

use crate::error::{PoolError, Result};
use crate::membership::QueueName;
use crate::scheduler::hooks::{FailureHookSpec, SuccessHookSpec};
use crate::scheduler::store::StoreSpec;
use crate::scheduler::strategy::StrategySpec;

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub node_id: u64,
    pub addr: String, // host:port or any transport-specific address
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: u64,
    pub peers: Vec<PeerConfig>,
    /// How often the node monitor probes its peers
    pub reconnect_interval_ms: u64,
    /// Inbox capacity of every queue owner, worker and monitor
    pub mailbox_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            peers: Vec::new(),
            reconnect_interval_ms: 500,
            mailbox_capacity: 100,
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: u64) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, node_id: u64, addr: String) -> Self {
        self.peers.push(PeerConfig { node_id, addr });
        self
    }

    pub fn with_reconnect_interval_ms(mut self, interval_ms: u64) -> Self {
        self.reconnect_interval_ms = interval_ms;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.mailbox_capacity == 0 {
            return Err(PoolError::InvalidConfig(
                "mailbox_capacity must be at least 1".to_string(),
            ));
        }
        if self.reconnect_interval_ms == 0 {
            return Err(PoolError::InvalidConfig(
                "reconnect_interval_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Construction parameters for a queue.
///
/// Hook specs are validated when the queue starts, before any queue-owner
/// process exists.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub queue: QueueName,
    pub store: StoreSpec,
    pub strategy: StrategySpec,
    pub failure_hook: FailureHookSpec,
    pub success_hook: SuccessHookSpec,
    /// Start with dispatch suspended
    pub suspended: bool,
    /// Number of queue-owner processes this node contributes
    pub replicas: usize,
}

impl QueueConfig {
    pub fn new(queue: QueueName) -> Self {
        Self {
            strategy: StrategySpec::default_for(&queue),
            queue,
            store: StoreSpec::Fifo,
            failure_hook: FailureHookSpec::Abandon,
            success_hook: SuccessHookSpec::Noop,
            suspended: false,
            replicas: 1,
        }
    }

    pub fn with_store(mut self, store: StoreSpec) -> Self {
        self.store = store;
        self
    }

    pub fn with_strategy(mut self, strategy: StrategySpec) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_failure_hook(mut self, hook: FailureHookSpec) -> Self {
        self.failure_hook = hook;
        self
    }

    pub fn with_success_hook(mut self, hook: SuccessHookSpec) -> Self {
        self.success_hook = hook;
        self
    }

    pub fn suspended(mut self, suspended: bool) -> Self {
        self.suspended = suspended;
        self
    }

    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue.name().is_empty() {
            return Err(PoolError::InvalidConfig("queue name is empty".to_string()));
        }
        if self.replicas == 0 {
            return Err(PoolError::InvalidConfig(
                "replicas must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Construction parameters for a worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub queue: QueueName,
    /// Passed to the handler's `init` for every worker
    pub init_args: Vec<Value>,
    pub workers: usize,
    /// Delay before retrying a failed worker `init`
    pub init_retry_ms: u64,
    /// Time a busy worker gets to finish during shutdown
    pub shutdown_grace_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// A worker silent for this long is treated as crashed
    pub heartbeat_timeout_ms: u64,
    /// Peers to keep connected to (global pools only)
    pub peers: Vec<PeerConfig>,
}

impl PoolConfig {
    pub fn new(queue: QueueName) -> Self {
        Self {
            queue,
            init_args: Vec::new(),
            workers: 10,
            init_retry_ms: 5_000,
            shutdown_grace_ms: 10_000,
            heartbeat_interval_ms: 500,
            heartbeat_timeout_ms: 5_000,
            peers: Vec::new(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_init_args(mut self, args: Vec<Value>) -> Self {
        self.init_args = args;
        self
    }

    pub fn with_init_retry_ms(mut self, delay_ms: u64) -> Self {
        self.init_retry_ms = delay_ms;
        self
    }

    pub fn with_shutdown_grace_ms(mut self, grace_ms: u64) -> Self {
        self.shutdown_grace_ms = grace_ms;
        self
    }

    pub fn with_heartbeat(mut self, interval_ms: u64, timeout_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self.heartbeat_timeout_ms = timeout_ms;
        self
    }

    pub fn with_peer(mut self, node_id: u64, addr: String) -> Self {
        self.peers.push(PeerConfig { node_id, addr });
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(PoolError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(PoolError::InvalidConfig(
                "heartbeat_interval_ms must be at least 1".to_string(),
            ));
        }
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(PoolError::InvalidConfig(
                "heartbeat_timeout_ms must exceed heartbeat_interval_ms".to_string(),
            ));
        }
        if !self.peers.is_empty() && !self.queue.is_global() {
            return Err(PoolError::InvalidConfig(format!(
                "peer nodes given for local queue {}",
                self.queue
            )));
        }
        Ok(())
    }
}
