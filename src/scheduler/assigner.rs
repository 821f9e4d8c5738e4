use std::collections::BTreeMap;
use tokio::sync::mpsc;

use crate::membership::{NodeId, ProcessId};
use crate::scheduler::job::JobId;
use crate::scheduler::strategy::IdleWorker;
use crate::worker::runner::WorkerMessage;

/// Worker status as mirrored by a queue owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle,
    /// Running a job dispatched by this queue owner
    Busy(JobId),
    /// Not available to this queue owner until it reports ready again
    Claimed,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Idle => write!(f, "idle"),
            WorkerStatus::Busy(job_id) => write!(f, "busy({})", job_id),
            WorkerStatus::Claimed => write!(f, "claimed"),
        }
    }
}

/// Worker state tracking
#[derive(Debug, Clone)]
pub struct WorkerState {
    pub pid: ProcessId,
    pub status: WorkerStatus,
    pub idle_since: u64,
    pub last_dispatched: Option<u64>,
    inbox: mpsc::Sender<WorkerMessage>,
}

impl WorkerState {
    pub fn node(&self) -> NodeId {
        self.pid.node
    }

    pub fn is_alive(&self) -> bool {
        !self.inbox.is_closed()
    }
}

/// Tracks the workers known to one queue owner and their dispatch history.
///
/// Times are ticks of a logical clock advanced on every readiness report and
/// every dispatch.
#[derive(Debug, Default)]
pub struct JobAssigner {
    workers: BTreeMap<ProcessId, WorkerState>,
    clock: u64,
}

impl JobAssigner {
    pub fn new() -> Self {
        Self::default()
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Register a worker or mark a known one idle
    pub fn worker_ready(&mut self, pid: ProcessId, inbox: mpsc::Sender<WorkerMessage>) {
        let now = self.tick();
        match self.workers.get_mut(&pid) {
            Some(worker) => {
                worker.status = WorkerStatus::Idle;
                worker.idle_since = now;
                worker.inbox = inbox;
            }
            None => {
                self.workers.insert(
                    pid,
                    WorkerState {
                        pid,
                        status: WorkerStatus::Idle,
                        idle_since: now,
                        last_dispatched: None,
                        inbox,
                    },
                );
                tracing::debug!(worker = %pid, "Worker registered");
            }
        }
    }

    /// Idle, live workers on one of the `visible` nodes
    pub fn idle_workers(&self, visible: &[NodeId]) -> Vec<IdleWorker> {
        self.workers
            .values()
            .filter(|w| w.status == WorkerStatus::Idle)
            .filter(|w| w.is_alive())
            .filter(|w| visible.contains(&w.node()))
            .map(|w| IdleWorker {
                pid: w.pid,
                node: w.node(),
                idle_since: w.idle_since,
                last_dispatched: w.last_dispatched,
            })
            .collect()
    }

    /// Mark `pid` busy with `job_id`, returning its inbox
    pub fn assign(&mut self, pid: ProcessId, job_id: JobId) -> Option<mpsc::Sender<WorkerMessage>> {
        let now = self.tick();
        let worker = self.workers.get_mut(&pid)?;
        if worker.status != WorkerStatus::Idle {
            return None;
        }
        worker.status = WorkerStatus::Busy(job_id);
        worker.last_dispatched = Some(now);
        Some(worker.inbox.clone())
    }

    /// The worker finished `job_id`; it stays unavailable until it reports ready
    pub fn job_completed(&mut self, pid: ProcessId, job_id: &JobId) {
        if let Some(worker) = self.workers.get_mut(&pid) {
            if worker.status == WorkerStatus::Busy(*job_id) {
                worker.status = WorkerStatus::Claimed;
            }
        }
    }

    /// The worker is busy for someone else
    pub fn mark_claimed(&mut self, pid: ProcessId) {
        if let Some(worker) = self.workers.get_mut(&pid) {
            worker.status = WorkerStatus::Claimed;
        }
    }

    pub fn remove_worker(&mut self, pid: &ProcessId) -> Option<WorkerState> {
        let removed = self.workers.remove(pid);
        if removed.is_some() {
            tracing::debug!(worker = %pid, "Worker removed");
        }
        removed
    }

    /// Workers running on `node`
    pub fn workers_on(&self, node: NodeId) -> Vec<ProcessId> {
        self.workers
            .values()
            .filter(|w| w.node() == node)
            .map(|w| w.pid)
            .collect()
    }

    /// Status of every known worker
    pub fn snapshot(&self) -> BTreeMap<ProcessId, WorkerStatus> {
        self.workers
            .values()
            .map(|w| (w.pid, w.status))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn pid(node: NodeId, seq: u64) -> ProcessId {
        ProcessId { node, seq }
    }

    #[test]
    fn ready_workers_are_idle() {
        let (tx, _rx) = mpsc::channel(1);
        let mut assigner = JobAssigner::new();
        assigner.worker_ready(pid(1, 1), tx.clone());
        assigner.worker_ready(pid(2, 2), tx);

        assert_eq!(assigner.idle_workers(&[1, 2]).len(), 2);
        // Node 2 not visible
        assert_eq!(assigner.idle_workers(&[1]).len(), 1);
    }

    #[test]
    fn assign_marks_busy_and_records_dispatch() {
        let (tx, _rx) = mpsc::channel(1);
        let mut assigner = JobAssigner::new();
        assigner.worker_ready(pid(1, 1), tx);
        let job_id = Uuid::new_v4();

        assert!(assigner.assign(pid(1, 1), job_id).is_some());
        assert!(assigner.idle_workers(&[1]).is_empty());
        // Already busy
        assert!(assigner.assign(pid(1, 1), Uuid::new_v4()).is_none());
        assert_eq!(assigner.snapshot()[&pid(1, 1)], WorkerStatus::Busy(job_id));

        assigner.job_completed(pid(1, 1), &job_id);
        assert_eq!(assigner.snapshot()[&pid(1, 1)], WorkerStatus::Claimed);

        let (tx, _rx2) = mpsc::channel(1);
        assigner.worker_ready(pid(1, 1), tx);
        let idle = assigner.idle_workers(&[1]);
        assert_eq!(idle.len(), 1);
        assert!(idle[0].last_dispatched.is_some());
    }

    #[test]
    fn completion_of_stale_job_keeps_status() {
        let (tx, _rx) = mpsc::channel(1);
        let mut assigner = JobAssigner::new();
        assigner.worker_ready(pid(1, 1), tx);
        let current = Uuid::new_v4();
        assigner.assign(pid(1, 1), current);

        assigner.job_completed(pid(1, 1), &Uuid::new_v4());
        assert_eq!(assigner.snapshot()[&pid(1, 1)], WorkerStatus::Busy(current));
    }

    #[test]
    fn dead_workers_are_not_idle() {
        let (tx, rx) = mpsc::channel(1);
        let mut assigner = JobAssigner::new();
        assigner.worker_ready(pid(1, 1), tx);
        drop(rx);
        assert!(assigner.idle_workers(&[1]).is_empty());
    }

    #[test]
    fn workers_on_node() {
        let (tx, _rx) = mpsc::channel(1);
        let mut assigner = JobAssigner::new();
        assigner.worker_ready(pid(1, 1), tx.clone());
        assigner.worker_ready(pid(2, 2), tx.clone());
        assigner.worker_ready(pid(2, 3), tx);

        assert_eq!(assigner.workers_on(2), vec![pid(2, 2), pid(2, 3)]);
        assigner.remove_worker(&pid(2, 2));
        assert_eq!(assigner.workers_on(2), vec![pid(2, 3)]);
        assert_eq!(assigner.len(), 2);
    }
}
