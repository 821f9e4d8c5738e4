use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::scheduler::job::{Job, JobId};

/// Backend holding a queue's pending jobs.
///
/// A store is owned and mutated by exactly one queue-owner process.
pub trait PendingStore: Send + fmt::Debug {
    /// Append a newly enqueued job
    fn push(&mut self, job: Job);

    /// Return a job to the head of the store (crash recovery, rejection, retry)
    fn requeue(&mut self, job: Job) {
        self.push(job);
    }

    /// Take the next job to offer to the dispatch strategy
    fn pop_candidate(&mut self) -> Option<Job>;

    /// Remove a pending job by ID
    fn remove(&mut self, id: &JobId) -> Option<Job>;

    /// Snapshot of pending jobs matching `predicate`
    fn scan(&self, predicate: &dyn Fn(&Job) -> bool) -> Vec<Job>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory FIFO store. Requeued jobs go back to the front.
#[derive(Debug, Default)]
pub struct FifoStore {
    jobs: VecDeque<Job>,
}

impl FifoStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PendingStore for FifoStore {
    fn push(&mut self, job: Job) {
        self.jobs.push_back(job);
    }

    fn requeue(&mut self, job: Job) {
        self.jobs.push_front(job);
    }

    fn pop_candidate(&mut self) -> Option<Job> {
        self.jobs.pop_front()
    }

    fn remove(&mut self, id: &JobId) -> Option<Job> {
        let index = self.jobs.iter().position(|j| &j.id == id)?;
        self.jobs.remove(index)
    }

    fn scan(&self, predicate: &dyn Fn(&Job) -> bool) -> Vec<Job> {
        self.jobs.iter().filter(|j| predicate(j)).cloned().collect()
    }

    fn len(&self) -> usize {
        self.jobs.len()
    }
}

pub type StoreFactory = Arc<dyn Fn() -> Box<dyn PendingStore> + Send + Sync>;

/// Pending-store backend selection.
#[derive(Clone, Default)]
pub enum StoreSpec {
    #[default]
    Fifo,
    /// Builds one store per queue-owner replica
    Custom(StoreFactory),
}

impl StoreSpec {
    pub fn build(&self) -> Box<dyn PendingStore> {
        match self {
            StoreSpec::Fifo => Box::new(FifoStore::new()),
            StoreSpec::Custom(factory) => factory(),
        }
    }
}

impl fmt::Debug for StoreSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreSpec::Fifo => write!(f, "Fifo"),
            StoreSpec::Custom(_) => write!(f, "Custom"),
        }
    }
}
