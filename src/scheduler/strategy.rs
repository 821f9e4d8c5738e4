use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::membership::{NodeId, ProcessId, QueueName};
use crate::scheduler::job::Job;

/// An idle worker as seen by a queue owner.
///
/// `idle_since` and `last_dispatched` are ticks of the owner's logical clock,
/// so choices are reproducible from the same state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleWorker {
    pub pid: ProcessId,
    pub node: NodeId,
    pub idle_since: u64,
    pub last_dispatched: Option<u64>,
}

/// Policy picking which idle worker receives a job.
///
/// `idle` only contains workers that are idle, alive and on a reachable node.
/// A strategy must pick from that list or return `None`.
pub trait DispatchStrategy: Send + fmt::Debug {
    fn choose(&mut self, job: &Job, idle: &[IdleWorker]) -> Option<ProcessId>;

    fn name(&self) -> &'static str;
}

/// The worker idle the longest, however long ago it was last dispatched
fn least_recently_used<'a>(idle: impl Iterator<Item = &'a IdleWorker>) -> Option<ProcessId> {
    idle.min_by_key(|w| (w.idle_since, w.pid)).map(|w| w.pid)
}

/// Longest-idle worker first
#[derive(Debug, Default)]
pub struct Lru;

impl DispatchStrategy for Lru {
    fn choose(&mut self, _job: &Job, idle: &[IdleWorker]) -> Option<ProcessId> {
        least_recently_used(idle.iter())
    }

    fn name(&self) -> &'static str {
        "lru"
    }
}

/// Most recently active worker first, favouring warm workers over fairness
#[derive(Debug, Default)]
pub struct Mru;

impl DispatchStrategy for Mru {
    fn choose(&mut self, _job: &Job, idle: &[IdleWorker]) -> Option<ProcessId> {
        idle.iter()
            .max_by(|a, b| {
                a.idle_since
                    .cmp(&b.idle_since)
                    .then(a.last_dispatched.cmp(&b.last_dispatched))
                    .then(b.pid.cmp(&a.pid))
            })
            .map(|w| w.pid)
    }

    fn name(&self) -> &'static str {
        "mru"
    }
}

/// Spreads work across nodes before saturating any one node, then picks the
/// least recently used worker on the chosen node.
#[derive(Debug, Default)]
pub struct LruNode {
    tick: u64,
    node_last_used: HashMap<NodeId, u64>,
}

impl DispatchStrategy for LruNode {
    fn choose(&mut self, _job: &Job, idle: &[IdleWorker]) -> Option<ProcessId> {
        let node = idle
            .iter()
            .map(|w| w.node)
            .min_by_key(|node| (self.node_last_used.get(node).copied(), *node))?;

        let pid = least_recently_used(idle.iter().filter(|w| w.node == node))?;
        self.tick += 1;
        self.node_last_used.insert(node, self.tick);
        Some(pid)
    }

    fn name(&self) -> &'static str {
        "lru_node"
    }
}

pub type StrategyFactory = Arc<dyn Fn() -> Box<dyn DispatchStrategy> + Send + Sync>;

/// Dispatch strategy selection.
#[derive(Clone)]
pub enum StrategySpec {
    Lru,
    LruNode,
    Mru,
    Custom(StrategyFactory),
}

impl StrategySpec {
    /// `Lru` for local queues, `LruNode` for global ones
    pub fn default_for(queue: &QueueName) -> Self {
        if queue.is_global() {
            StrategySpec::LruNode
        } else {
            StrategySpec::Lru
        }
    }

    pub fn build(&self) -> Box<dyn DispatchStrategy> {
        match self {
            StrategySpec::Lru => Box::new(Lru),
            StrategySpec::LruNode => Box::new(LruNode::default()),
            StrategySpec::Mru => Box::new(Mru),
            StrategySpec::Custom(factory) => factory(),
        }
    }
}

impl fmt::Debug for StrategySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategySpec::Lru => write!(f, "Lru"),
            StrategySpec::LruNode => write!(f, "LruNode"),
            StrategySpec::Mru => write!(f, "Mru"),
            StrategySpec::Custom(_) => write!(f, "Custom"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::Task;
    use proptest::prelude::*;

    fn job() -> Job {
        Job::new(Task::new("noop", vec![]), QueueName::local("q"))
    }

    fn worker(node: NodeId, seq: u64, idle_since: u64, last: Option<u64>) -> IdleWorker {
        IdleWorker {
            pid: ProcessId { node, seq },
            node,
            idle_since,
            last_dispatched: last,
        }
    }

    #[test]
    fn no_idle_workers_means_no_choice() {
        assert!(Lru.choose(&job(), &[]).is_none());
        assert!(Mru.choose(&job(), &[]).is_none());
        assert!(LruNode::default().choose(&job(), &[]).is_none());
    }

    #[test]
    fn lru_prefers_longest_idle() {
        let idle = [
            worker(1, 1, 5, Some(4)),
            worker(1, 2, 9, None),
            worker(1, 3, 2, Some(1)),
        ];
        assert_eq!(Lru.choose(&job(), &idle), Some(ProcessId { node: 1, seq: 3 }));

        let idle = [worker(1, 1, 5, Some(4)), worker(1, 2, 9, None)];
        assert_eq!(Lru.choose(&job(), &idle), Some(ProcessId { node: 1, seq: 1 }));
    }

    #[test]
    fn lru_ignores_when_a_long_job_was_dispatched() {
        // Worker 1 got a long job first and only just came back; worker 2
        // got a short job later but has been idle since tick 6.
        let idle = [worker(1, 1, 10, Some(1)), worker(1, 2, 6, Some(2))];
        assert_eq!(Lru.choose(&job(), &idle), Some(ProcessId { node: 1, seq: 2 }));
    }

    #[test]
    fn lru_ties_break_on_pid() {
        let idle = [worker(1, 7, 0, None), worker(1, 3, 0, None)];
        assert_eq!(Lru.choose(&job(), &idle), Some(ProcessId { node: 1, seq: 3 }));
    }

    #[test]
    fn mru_prefers_most_recently_idle() {
        let idle = [
            worker(1, 1, 5, Some(4)),
            worker(1, 2, 9, Some(8)),
            worker(1, 3, 2, None),
        ];
        assert_eq!(Mru.choose(&job(), &idle), Some(ProcessId { node: 1, seq: 2 }));
    }

    #[test]
    fn lru_node_spreads_across_nodes() {
        let mut strategy = LruNode::default();
        let idle = [
            worker(1, 1, 0, None),
            worker(1, 2, 0, None),
            worker(2, 3, 0, None),
        ];

        let first = strategy.choose(&job(), &idle).unwrap();
        assert_eq!(first.node, 1);

        // Node 2 has not been used yet, so it goes next even though node 1
        // still has an idle worker.
        let remaining: Vec<_> = idle.iter().copied().filter(|w| w.pid != first).collect();
        let second = strategy.choose(&job(), &remaining).unwrap();
        assert_eq!(second.node, 2);

        let remaining: Vec<_> = remaining.into_iter().filter(|w| w.pid != second).collect();
        let third = strategy.choose(&job(), &remaining).unwrap();
        assert_eq!(third, ProcessId { node: 1, seq: 2 });
    }

    #[test]
    fn strategies_are_deterministic() {
        let idle = [
            worker(1, 1, 3, Some(2)),
            worker(2, 2, 3, Some(2)),
            worker(3, 3, 1, None),
        ];
        for spec in [StrategySpec::Lru, StrategySpec::LruNode, StrategySpec::Mru] {
            let a = spec.build().choose(&job(), &idle);
            let b = spec.build().choose(&job(), &idle);
            assert_eq!(a, b, "{:?} not deterministic", spec);
        }
    }

    #[test]
    fn spec_names() {
        assert_eq!(StrategySpec::Lru.build().name(), "lru");
        assert_eq!(StrategySpec::LruNode.build().name(), "lru_node");
        assert_eq!(StrategySpec::Mru.build().name(), "mru");
    }

    proptest! {
        /// With K idle workers and a stream of jobs, LRU never hands a worker
        /// a job while another eligible worker has waited longer.
        #[test]
        fn lru_is_fair(workers in 1usize..8, finishes in proptest::collection::vec(any::<prop::sample::Index>(), 1..60)) {
            let mut strategy = Lru;
            let mut clock = 0u64;
            let mut idle: Vec<IdleWorker> = (0..workers as u64)
                .map(|seq| worker(1, seq, 0, None))
                .collect();
            let mut busy: Vec<IdleWorker> = Vec::new();

            for finish in finishes {
                if let Some(pid) = strategy.choose(&job(), &idle) {
                    let chosen = *idle.iter().find(|w| w.pid == pid).unwrap();
                    for other in &idle {
                        prop_assert!(chosen.idle_since <= other.idle_since);
                    }
                    clock += 1;
                    idle.retain(|w| w.pid != pid);
                    busy.push(IdleWorker { last_dispatched: Some(clock), ..chosen });
                }

                // Any busy worker may finish next, whatever order they started in
                if !busy.is_empty() {
                    let done = busy.remove(finish.index(busy.len()));
                    clock += 1;
                    idle.push(IdleWorker { idle_since: clock, ..done });
                }
            }
        }
    }
}
