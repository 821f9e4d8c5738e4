use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{PoolError, Result};
use crate::membership::{Membership, ProcessId, QueueName};
use crate::scheduler::job::{Job, JobResult, Reply, Task};
use crate::scheduler::queue::{route, CancelOutcome, QueueHandle, QueueStatus};
use crate::worker::monitor::{MonitorMessage, WorkerSnapshot};

const STATUS_TIMEOUT: Duration = Duration::from_secs(1);
/// Unclaimed replies are dropped after this long
const STASH_TTL: Duration = Duration::from_secs(600);
const STASH_CAPACITY: usize = 1024;

/// Status of a queue across all of its owners and workers
#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub queues: Vec<QueueStatus>,
    pub workers: Vec<WorkerSnapshot>,
}

impl PoolStatus {
    pub fn pending(&self) -> usize {
        self.queues.iter().map(|q| q.pending).sum()
    }

    pub fn in_flight(&self) -> usize {
        self.queues.iter().map(|q| q.in_flight).sum()
    }

    /// Failed jobs waiting for a retry delay, counted in `pending` too
    pub fn delayed(&self) -> usize {
        self.queues.iter().map(|q| q.delayed).sum()
    }
}

/// Replies that arrived while waiting for another job.
///
/// Some replies are never awaited, such as the second outcome of a job that
/// ran twice after a move, so entries expire and the oldest are evicted
/// once the stash is full.
#[derive(Default)]
struct Stash {
    entries: HashMap<Uuid, (Instant, JobResult)>,
}

impl Stash {
    fn insert(&mut self, token: Uuid, result: JobResult, now: Instant) {
        self.entries
            .retain(|_, (stashed_at, _)| now.saturating_duration_since(*stashed_at) < STASH_TTL);
        if self.entries.len() >= STASH_CAPACITY {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, (stashed_at, _))| *stashed_at)
                .map(|(token, _)| *token);
            if let Some(oldest) = oldest {
                tracing::debug!(token = %oldest, "Reply stash full, dropping oldest reply");
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(token, (now, result));
    }

    fn take(&mut self, token: &Uuid) -> Option<JobResult> {
        self.entries.remove(token).map(|(_, result)| result)
    }
}

struct Mailbox {
    rx: mpsc::UnboundedReceiver<Reply>,
    stash: Stash,
}

/// A submitter identity.
///
/// Jobs submitted with `reply = true` report their outcome to this client's
/// mailbox, and only this client may wait for them.
pub struct Client {
    pid: ProcessId,
    membership: Membership,
    mailbox: Mutex<Mailbox>,
}

impl Client {
    pub async fn new(membership: Membership) -> Self {
        let pid = ProcessId::spawn(membership.node_id());
        let rx = membership.register_mailbox(pid).await;
        Self {
            pid,
            membership,
            mailbox: Mutex::new(Mailbox {
                rx,
                stash: Stash::default(),
            }),
        }
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Submit `task` to `queue`. With `reply`, the outcome can be collected
    /// with [`Client::await_result`].
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::NoQueueOwner`] if no owner of `queue` is visible.
    pub async fn submit(&self, task: Task, queue: &QueueName, reply: bool) -> Result<Job> {
        let mut job = Job::new(task, queue.clone());
        if reply {
            job = job.with_reply(self.pid);
        }
        let owner = route(&self.membership, queue).await?;
        let job = owner.enqueue(job).await?;
        tracing::debug!(job_id = %job.id, queue = %queue, owner = %owner.pid, "Job submitted");
        Ok(job)
    }

    /// Wait up to `timeout` for the outcome of `job`. Returns `Ok(None)` on
    /// timeout; the reply is kept if it arrives later.
    ///
    /// # Errors
    ///
    /// Fails if `job` was not submitted by this client or without a reply.
    pub async fn await_result(&self, job: &Job, timeout: Duration) -> Result<Option<JobResult>> {
        let from = job.from.ok_or(PoolError::NoReplyRequested(job.id))?;
        if from.owner != self.pid {
            return Err(PoolError::NotOwner(job.id));
        }

        let mut mailbox = self.mailbox.lock().await;
        if let Some(result) = mailbox.stash.take(&from.token) {
            return Ok(Some(result));
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, mailbox.rx.recv()).await {
                Err(_) => return Ok(None),
                Ok(None) => return Err(PoolError::ProcessDown(self.pid)),
                Ok(Some(reply)) if reply.token == from.token => return Ok(Some(reply.result)),
                Ok(Some(reply)) => {
                    mailbox.stash.insert(reply.token, reply.result, Instant::now());
                }
            }
        }
    }

    async fn owners(&self, queue: &QueueName) -> Result<Vec<QueueHandle>> {
        let owners: Vec<QueueHandle> = self
            .membership
            .queue_owners(queue)
            .await
            .into_iter()
            .map(|(pid, tx)| QueueHandle::new(pid, tx))
            .collect();
        if owners.is_empty() {
            return Err(PoolError::NoQueueOwner(queue.clone()));
        }
        Ok(owners)
    }

    /// Stop dispatch on every owner of `queue`
    pub async fn suspend(&self, queue: &QueueName) -> Result<()> {
        for owner in self.owners(queue).await? {
            if let Err(e) = owner.suspend().await {
                tracing::debug!(owner = %owner.pid, error = %e, "Owner gone during suspend");
            }
        }
        Ok(())
    }

    pub async fn resume(&self, queue: &QueueName) -> Result<()> {
        for owner in self.owners(queue).await? {
            if let Err(e) = owner.resume().await {
                tracing::debug!(owner = %owner.pid, error = %e, "Owner gone during resume");
            }
        }
        Ok(())
    }

    pub async fn status(&self, queue: &QueueName) -> Result<PoolStatus> {
        let mut queues = Vec::new();
        for owner in self.owners(queue).await? {
            queues.push(owner.status().await?);
        }

        let mut workers = Vec::new();
        for (pid, tx) in self.membership.monitors(queue).await {
            let (reply, rx) = oneshot::channel();
            if tx.send(MonitorMessage::Status { reply }).await.is_err() {
                continue;
            }
            match tokio::time::timeout(STATUS_TIMEOUT, rx).await {
                Ok(Ok(snapshot)) => workers.push(snapshot),
                _ => tracing::debug!(monitor = %pid, "No status from monitor"),
            }
        }

        Ok(PoolStatus { queues, workers })
    }

    /// Pending jobs of `queue` matching `predicate`, across all owners
    pub async fn filter<F>(&self, queue: &QueueName, predicate: F) -> Result<Vec<Job>>
    where
        F: Fn(&Job) -> bool + Clone + Send + 'static,
    {
        let mut jobs = Vec::new();
        for owner in self.owners(queue).await? {
            jobs.extend(owner.filter(Box::new(predicate.clone())).await?);
        }
        Ok(jobs)
    }

    /// Cancel a pending job. Running jobs are never interrupted.
    pub async fn cancel(&self, job: &Job) -> Result<CancelOutcome> {
        let mut outcome = CancelOutcome::NotFound;
        for owner in self.owners(&job.queue).await? {
            match owner.cancel(job.id).await {
                Ok(answer) => outcome = outcome.merge(answer),
                Err(e) => tracing::debug!(owner = %owner.pid, error = %e, "Owner gone during cancel"),
            }
        }
        Ok(outcome)
    }

    /// Enqueue a copy of `job` on `to`, then try to cancel the original.
    ///
    /// The copy is enqueued first: if the original is already running, both
    /// may execute.
    pub async fn move_job(&self, job: &Job, to: &QueueName) -> Result<Job> {
        let owner = route(&self.membership, to).await?;
        let moved = owner.enqueue(job.copy_to(to.clone())).await?;

        match self.cancel(job).await {
            Ok(outcome) => {
                tracing::info!(job_id = %job.id, moved_id = %moved.id, to = %to, ?outcome, "Job moved");
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, moved_id = %moved.id, error = %e, "Moved job, original not cancelled");
            }
        }
        Ok(moved)
    }

    /// Release the reply mailbox
    pub async fn close(self) {
        self.membership.unregister_mailbox(self.pid).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::queue::QueueMessage;
    use serde_json::json;

    #[tokio::test]
    async fn suspend_reaches_live_owners_past_a_dead_one() {
        let membership = Membership::standalone(1);
        let queue = QueueName::local("mixed");

        // Full inbox whose owner stops while the client waits on it
        let (dead_tx, dead_rx) = mpsc::channel(1);
        assert!(dead_tx.try_send(QueueMessage::Resume).is_ok());
        membership
            .join_queue(&queue, ProcessId { node: 1, seq: 1 }, dead_tx)
            .await;
        let (live_tx, mut live_rx) = mpsc::channel(8);
        membership
            .join_queue(&queue, ProcessId { node: 1, seq: 2 }, live_tx)
            .await;

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(dead_rx);
        });

        let client = Client::new(membership).await;
        client.suspend(&queue).await.unwrap();
        assert!(matches!(live_rx.try_recv(), Ok(QueueMessage::Suspend)));
    }

    #[tokio::test]
    async fn stashed_replies_are_taken_once() {
        let mut stash = Stash::default();
        let token = Uuid::new_v4();
        stash.insert(token, Ok(json!(1)), Instant::now());

        assert_eq!(stash.take(&token), Some(Ok(json!(1))));
        assert_eq!(stash.take(&token), None);
    }

    #[tokio::test]
    async fn stale_replies_expire() {
        let mut stash = Stash::default();
        let start = Instant::now();
        let stale = Uuid::new_v4();
        stash.insert(stale, Ok(json!("old")), start);

        let fresh = Uuid::new_v4();
        stash.insert(fresh, Ok(json!("new")), start + STASH_TTL);

        assert_eq!(stash.entries.len(), 1);
        assert_eq!(stash.take(&stale), None);
        assert_eq!(stash.take(&fresh), Some(Ok(json!("new"))));
    }

    #[tokio::test]
    async fn full_stash_drops_oldest_reply() {
        let mut stash = Stash::default();
        let start = Instant::now();
        let tokens: Vec<Uuid> = (0..STASH_CAPACITY).map(|_| Uuid::new_v4()).collect();
        for (i, token) in tokens.iter().enumerate() {
            stash.insert(*token, Ok(json!(i)), start + Duration::from_millis(i as u64));
        }

        let extra = Uuid::new_v4();
        stash.insert(extra, Ok(json!("extra")), start + Duration::from_secs(1));

        assert_eq!(stash.entries.len(), STASH_CAPACITY);
        assert_eq!(stash.take(&tokens[0]), None);
        assert!(stash.take(&tokens[1]).is_some());
        assert!(stash.take(&extra).is_some());
    }
}
