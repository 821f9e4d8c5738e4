use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};

use crate::membership::{NodeEvent, NodeId, ProcessId, QueueName};
use crate::scheduler::job::Reply;
use crate::scheduler::queue::QueueMessage;
use crate::worker::monitor::MonitorMessage;
use crate::worker::runner::WorkerMessage;

const NODE_EVENT_CAPACITY: usize = 64;

/// Group key: the queue name plus the owning node for local queues.
type GroupKey = (QueueName, Option<NodeId>);

fn group_key(queue: &QueueName, node: NodeId) -> GroupKey {
    match queue {
        QueueName::Local(_) => (queue.clone(), Some(node)),
        QueueName::Global(_) => (queue.clone(), None),
    }
}

/// One category of groups (queue owners, workers or monitors).
struct GroupTable<M> {
    groups: HashMap<GroupKey, BTreeMap<ProcessId, mpsc::Sender<M>>>,
}

impl<M> std::fmt::Debug for GroupTable<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.groups.iter().map(|(key, group)| (key, group.keys().collect::<Vec<_>>())))
            .finish()
    }
}

impl<M> Default for GroupTable<M> {
    fn default() -> Self {
        Self {
            groups: HashMap::new(),
        }
    }
}

impl<M> GroupTable<M> {
    fn join(&mut self, key: GroupKey, pid: ProcessId, tx: mpsc::Sender<M>) {
        let group = self.groups.entry(key).or_default();
        group.retain(|_, tx| !tx.is_closed());
        group.insert(pid, tx);
    }

    fn leave(&mut self, key: &GroupKey, pid: &ProcessId) -> bool {
        let Some(group) = self.groups.get_mut(key) else {
            return false;
        };
        let removed = group.remove(pid).is_some();
        if group.is_empty() {
            self.groups.remove(key);
        }
        removed
    }

    /// Live members, in process-id order.
    fn members(&self, key: &GroupKey) -> Vec<(ProcessId, mpsc::Sender<M>)> {
        self.groups
            .get(key)
            .map(|group| {
                group
                    .iter()
                    .filter(|(_, tx)| !tx.is_closed())
                    .map(|(pid, tx)| (*pid, tx.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Cluster-wide process registry.
///
/// Membership is owned here rather than by any queue or pool. Entries whose
/// inbox has been dropped are never returned, so a crashed process leaves its
/// groups as soon as its task ends.
#[derive(Debug, Default)]
pub struct Registry {
    queues: RwLock<GroupTable<QueueMessage>>,
    workers: RwLock<GroupTable<WorkerMessage>>,
    monitors: RwLock<GroupTable<MonitorMessage>>,
    mailboxes: RwLock<HashMap<ProcessId, mpsc::UnboundedSender<Reply>>>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// A node's view of the registry.
///
/// Global groups only list members on this node or on peers the node monitor
/// currently considers reachable, so dispatch during a partition only sees
/// locally visible workers.
#[derive(Debug, Clone)]
pub struct Membership {
    node: NodeId,
    registry: Arc<Registry>,
    visible: Arc<RwLock<HashSet<NodeId>>>,
    events: broadcast::Sender<NodeEvent>,
}

impl Membership {
    pub fn new(node: NodeId, registry: Arc<Registry>) -> Self {
        let (events, _) = broadcast::channel(NODE_EVENT_CAPACITY);
        Self {
            node,
            registry,
            visible: Arc::new(RwLock::new(HashSet::new())),
            events,
        }
    }

    /// A standalone single-node view with its own registry
    pub fn standalone(node: NodeId) -> Self {
        Self::new(node, Registry::new())
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    async fn visible_filter<M>(
        &self,
        members: Vec<(ProcessId, mpsc::Sender<M>)>,
    ) -> Vec<(ProcessId, mpsc::Sender<M>)> {
        let visible = self.visible.read().await;
        members
            .into_iter()
            .filter(|(pid, _)| pid.node == self.node || visible.contains(&pid.node))
            .collect()
    }

    pub async fn join_queue(&self, queue: &QueueName, pid: ProcessId, tx: mpsc::Sender<QueueMessage>) {
        self.registry
            .queues
            .write()
            .await
            .join(group_key(queue, self.node), pid, tx);
        tracing::debug!(queue = %queue, pid = %pid, "Joined queue-owner group");
    }

    pub async fn leave_queue(&self, queue: &QueueName, pid: ProcessId) -> bool {
        self.registry
            .queues
            .write()
            .await
            .leave(&group_key(queue, self.node), &pid)
    }

    pub async fn queue_owners(&self, queue: &QueueName) -> Vec<(ProcessId, mpsc::Sender<QueueMessage>)> {
        let members = self
            .registry
            .queues
            .read()
            .await
            .members(&group_key(queue, self.node));
        self.visible_filter(members).await
    }

    pub async fn join_worker(&self, queue: &QueueName, pid: ProcessId, tx: mpsc::Sender<WorkerMessage>) {
        self.registry
            .workers
            .write()
            .await
            .join(group_key(queue, self.node), pid, tx);
    }

    pub async fn leave_worker(&self, queue: &QueueName, pid: ProcessId) -> bool {
        self.registry
            .workers
            .write()
            .await
            .leave(&group_key(queue, self.node), &pid)
    }

    pub async fn workers(&self, queue: &QueueName) -> Vec<(ProcessId, mpsc::Sender<WorkerMessage>)> {
        let members = self
            .registry
            .workers
            .read()
            .await
            .members(&group_key(queue, self.node));
        self.visible_filter(members).await
    }

    pub async fn join_monitor(&self, queue: &QueueName, pid: ProcessId, tx: mpsc::Sender<MonitorMessage>) {
        self.registry
            .monitors
            .write()
            .await
            .join(group_key(queue, self.node), pid, tx);
    }

    pub async fn leave_monitor(&self, queue: &QueueName, pid: ProcessId) -> bool {
        self.registry
            .monitors
            .write()
            .await
            .leave(&group_key(queue, self.node), &pid)
    }

    pub async fn monitors(&self, queue: &QueueName) -> Vec<(ProcessId, mpsc::Sender<MonitorMessage>)> {
        let members = self
            .registry
            .monitors
            .read()
            .await
            .members(&group_key(queue, self.node));
        self.visible_filter(members).await
    }

    /// Register a reply mailbox for a submitter
    pub async fn register_mailbox(&self, pid: ProcessId) -> mpsc::UnboundedReceiver<Reply> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry.mailboxes.write().await.insert(pid, tx);
        rx
    }

    pub async fn unregister_mailbox(&self, pid: ProcessId) {
        self.registry.mailboxes.write().await.remove(&pid);
    }

    /// Deliver a completion message to the submitter. Returns false if the
    /// submitter is gone.
    pub async fn deliver_reply(&self, owner: ProcessId, reply: Reply) -> bool {
        let mailboxes = self.registry.mailboxes.read().await;
        match mailboxes.get(&owner) {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    pub async fn is_visible(&self, node: NodeId) -> bool {
        node == self.node || self.visible.read().await.contains(&node)
    }

    /// This node plus every reachable peer, sorted
    pub async fn visible_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.visible.read().await.iter().copied().collect();
        nodes.push(self.node);
        nodes.sort_unstable();
        nodes.dedup();
        nodes
    }

    /// Mark a peer reachable. Returns true if it was not before.
    pub async fn node_up(&self, node: NodeId) -> bool {
        if node == self.node {
            return false;
        }
        let inserted = self.visible.write().await.insert(node);
        if inserted {
            let _ = self.events.send(NodeEvent::Up(node));
        }
        inserted
    }

    /// Mark a peer unreachable. Returns true if it was reachable before.
    pub async fn node_down(&self, node: NodeId) -> bool {
        let removed = self.visible.write().await.remove(&node);
        if removed {
            let _ = self.events.send(NodeEvent::Down(node));
        }
        removed
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }
}
