//! Process groups and cluster topology.
//!
//! Every queue name has three groups of live processes: the queue owners
//! holding its pending jobs, the workers executing them, and the monitors
//! observing those workers. Local queues are scoped to one node; global
//! queues span every node visible from the caller.
//!
//! # Components
//!
//! - [`Registry`]: the cluster-wide table of groups and reply mailboxes
//! - [`Membership`]: one node's view of the registry, filtered by which peers
//!   are currently reachable
//! - [`NodeMonitor`]: probes configured peers and publishes [`NodeEvent`]s
//! - [`Cluster`]: an in-process cluster with partition injection

pub mod cluster;
pub mod groups;
pub mod node_monitor;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

pub use cluster::{Cluster, LocalTransport};
pub use groups::{Membership, Registry};
pub use node_monitor::{NodeMonitor, PeerTransport};

pub type NodeId = u64;

static NEXT_PROCESS_SEQ: AtomicU64 = AtomicU64::new(1);

/// Identity of a queue owner, worker, monitor or client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessId {
    pub node: NodeId,
    pub seq: u64,
}

impl ProcessId {
    /// Allocate a fresh identity on `node`.
    pub fn spawn(node: NodeId) -> Self {
        Self {
            node,
            seq: NEXT_PROCESS_SEQ.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}.{}>", self.node, self.seq)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QueueName {
    /// Visible only to processes on the same node
    Local(String),
    /// Visible to every connected node
    Global(String),
}

impl QueueName {
    pub fn local(name: impl Into<String>) -> Self {
        QueueName::Local(name.into())
    }

    pub fn global(name: impl Into<String>) -> Self {
        QueueName::Global(name.into())
    }

    pub fn name(&self) -> &str {
        match self {
            QueueName::Local(name) | QueueName::Global(name) => name,
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(self, QueueName::Global(_))
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueName::Local(name) => write!(f, "{}", name),
            QueueName::Global(name) => write!(f, "global:{}", name),
        }
    }
}

/// Topology change observed by a node's monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    Up(NodeId),
    Down(NodeId),
}
