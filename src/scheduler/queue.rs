use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use rand::seq::SliceRandom;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::QueueConfig;
use crate::error::{PoolError, Result};
use crate::membership::{Membership, NodeEvent, NodeId, ProcessId, QueueName};
use crate::scheduler::assigner::{JobAssigner, WorkerStatus};
use crate::scheduler::hooks::{FailureAction, FailureHook, SuccessHook};
use crate::scheduler::job::{Failure, Job, JobId, JobResult, Reply};
use crate::scheduler::store::PendingStore;
use crate::scheduler::strategy::DispatchStrategy;
use crate::worker::runner::WorkerMessage;

pub type JobPredicate = Box<dyn Fn(&Job) -> bool + Send>;

/// Result of a cancellation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was pending or waiting for a retry and has been removed
    Cancelled,
    /// The job is running on a worker and cannot be aborted
    InProgress,
    /// The job is neither pending nor running here
    NotFound,
}

impl CancelOutcome {
    /// Combine the answers of several queue owners
    pub fn merge(self, other: CancelOutcome) -> CancelOutcome {
        use CancelOutcome::*;
        match (self, other) {
            (Cancelled, _) | (_, Cancelled) => Cancelled,
            (InProgress, _) | (_, InProgress) => InProgress,
            _ => NotFound,
        }
    }
}

/// Introspection snapshot of one queue owner
#[derive(Debug, Clone)]
pub struct QueueStatus {
    pub pid: ProcessId,
    pub queue: QueueName,
    /// Jobs not dispatched yet, including those waiting for a retry
    pub pending: usize,
    pub delayed: usize,
    pub in_flight: usize,
    pub suspended: bool,
    pub strategy: &'static str,
    pub workers: BTreeMap<ProcessId, WorkerStatus>,
}

/// Inbox of a queue-owner process
pub enum QueueMessage {
    Enqueue {
        job: Job,
        reply: oneshot::Sender<Job>,
    },
    Cancel {
        job_id: JobId,
        reply: oneshot::Sender<CancelOutcome>,
    },
    Filter {
        predicate: JobPredicate,
        reply: oneshot::Sender<Vec<Job>>,
    },
    Suspend,
    Resume,
    Status {
        reply: oneshot::Sender<QueueStatus>,
    },
    /// A worker is idle and can take a job
    WorkerReady {
        worker: ProcessId,
        inbox: mpsc::Sender<WorkerMessage>,
    },
    /// A worker was already busy and refused a job
    JobRejected { worker: ProcessId, job: Job },
    /// Outcome of an attempt, forwarded by the worker's monitor
    JobFinished { worker: ProcessId, job: Job },
    /// A worker terminated abnormally
    WorkerCrashed {
        worker: ProcessId,
        job_id: Option<JobId>,
        reason: String,
    },
    /// A worker stopped on request
    WorkerLeft { worker: ProcessId },
    /// A delayed retry is due
    Requeue { job_id: JobId },
}

/// Address of a queue-owner process.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    pub pid: ProcessId,
    tx: mpsc::Sender<QueueMessage>,
}

impl QueueHandle {
    pub fn new(pid: ProcessId, tx: mpsc::Sender<QueueMessage>) -> Self {
        Self { pid, tx }
    }

    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    pub(crate) async fn send(&self, msg: QueueMessage) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| PoolError::ProcessDown(self.pid))
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> QueueMessage) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await.map_err(|_| PoolError::ProcessDown(self.pid))
    }

    pub async fn enqueue(&self, job: Job) -> Result<Job> {
        self.call(|reply| QueueMessage::Enqueue { job, reply }).await
    }

    pub async fn cancel(&self, job_id: JobId) -> Result<CancelOutcome> {
        self.call(|reply| QueueMessage::Cancel { job_id, reply })
            .await
    }

    pub async fn filter(&self, predicate: JobPredicate) -> Result<Vec<Job>> {
        self.call(|reply| QueueMessage::Filter { predicate, reply })
            .await
    }

    pub async fn status(&self) -> Result<QueueStatus> {
        self.call(|reply| QueueMessage::Status { reply }).await
    }

    pub async fn suspend(&self) -> Result<()> {
        self.send(QueueMessage::Suspend).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.send(QueueMessage::Resume).await
    }
}

/// Pick the queue owner that should receive a new job: one on this node if
/// there is one, otherwise any visible owner.
pub async fn route(membership: &Membership, queue: &QueueName) -> Result<QueueHandle> {
    let owners = membership.queue_owners(queue).await;
    let node = membership.node_id();
    let local: Vec<_> = owners.iter().filter(|(pid, _)| pid.node == node).collect();

    let chosen = if local.is_empty() {
        owners.choose(&mut rand::thread_rng())
    } else {
        local.choose(&mut rand::thread_rng()).copied()
    };

    chosen
        .map(|(pid, tx)| QueueHandle::new(*pid, tx.clone()))
        .ok_or_else(|| PoolError::NoQueueOwner(queue.clone()))
}

/// Deliver `result` to the job's submitter, if it asked for a reply
pub async fn reply_to_submitter(membership: &Membership, job: &Job, result: JobResult) {
    let Some(from) = job.from else {
        return;
    };
    let reply = Reply {
        token: from.token,
        job_id: job.id,
        result,
    };
    if !membership.deliver_reply(from.owner, reply).await {
        tracing::debug!(job_id = %job.id, owner = %from.owner, "Submitter gone, reply dropped");
    }
}

/// Queue-owner process.
///
/// Owns the pending store exclusively and processes one message at a time, so
/// control requests and dispatch decisions apply in receipt order.
pub struct QueueEngine {
    pid: ProcessId,
    queue: QueueName,
    membership: Membership,
    store: Box<dyn PendingStore>,
    strategy: Box<dyn DispatchStrategy>,
    failure_hook: Arc<dyn FailureHook>,
    success_hook: Arc<dyn SuccessHook>,
    suspended: bool,
    assigner: JobAssigner,
    in_flight: HashMap<JobId, Job>,
    /// Failed jobs waiting out a retry delay
    delayed: HashMap<JobId, Job>,
    inbox: mpsc::Receiver<QueueMessage>,
    self_tx: mpsc::Sender<QueueMessage>,
}

impl QueueEngine {
    /// Validate `config`, register a new queue owner and start it.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a hook is misconfigured; nothing is
    /// started in that case.
    pub async fn start(
        config: &QueueConfig,
        membership: Membership,
        mailbox_capacity: usize,
        shutdown: CancellationToken,
    ) -> Result<(QueueHandle, JoinHandle<()>)> {
        config.validate()?;
        let failure_hook = config.failure_hook.build(&config.queue)?;
        let success_hook = config.success_hook.build()?;

        let pid = ProcessId::spawn(membership.node_id());
        let (tx, inbox) = mpsc::channel(mailbox_capacity);

        let engine = Self {
            pid,
            queue: config.queue.clone(),
            membership: membership.clone(),
            store: config.store.build(),
            strategy: config.strategy.build(),
            failure_hook,
            success_hook,
            suspended: config.suspended,
            assigner: JobAssigner::new(),
            in_flight: HashMap::new(),
            delayed: HashMap::new(),
            inbox,
            self_tx: tx.clone(),
        };

        membership.join_queue(&config.queue, pid, tx.clone()).await;
        tracing::info!(
            queue = %config.queue,
            pid = %pid,
            strategy = engine.strategy.name(),
            suspended = config.suspended,
            "Queue owner started"
        );

        let node_events = membership.subscribe();
        let handle = tokio::spawn(engine.run(node_events, shutdown));
        Ok((QueueHandle::new(pid, tx), handle))
    }

    async fn run(mut self, mut node_events: broadcast::Receiver<NodeEvent>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = self.inbox.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
                event = node_events.recv() => match event {
                    Ok(event) => self.handle_node_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(queue = %self.queue, skipped, "Missed node events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        // Outcomes reported by workers that stopped before this owner
        while let Ok(msg) = self.inbox.try_recv() {
            self.handle(msg).await;
        }

        self.membership.leave_queue(&self.queue, self.pid).await;
        let dropped = self.store.len() + self.delayed.len() + self.in_flight.len();
        if dropped > 0 {
            tracing::warn!(
                queue = %self.queue,
                pid = %self.pid,
                pending = self.store.len(),
                delayed = self.delayed.len(),
                in_flight = self.in_flight.len(),
                "Queue owner stopped with unfinished jobs"
            );
        } else {
            tracing::info!(queue = %self.queue, pid = %self.pid, "Queue owner stopped");
        }
    }

    async fn handle(&mut self, msg: QueueMessage) {
        match msg {
            QueueMessage::Enqueue { mut job, reply } => {
                job.reset_attempt();
                job.enqueued_at = Some(Utc::now());
                tracing::debug!(job_id = %job.id, queue = %self.queue, function = %job.task.function, "Job enqueued");
                self.store.push(job.clone());
                let _ = reply.send(job);
                self.dispatch().await;
            }
            QueueMessage::Cancel { job_id, reply } => {
                let outcome = self.cancel(&job_id);
                let _ = reply.send(outcome);
            }
            QueueMessage::Filter { predicate, reply } => {
                let mut jobs = self.store.scan(&*predicate);
                jobs.extend(self.delayed.values().filter(|j| predicate(*j)).cloned());
                let _ = reply.send(jobs);
            }
            QueueMessage::Suspend => {
                if !self.suspended {
                    self.suspended = true;
                    tracing::info!(queue = %self.queue, pid = %self.pid, "Queue suspended");
                }
            }
            QueueMessage::Resume => {
                if self.suspended {
                    self.suspended = false;
                    tracing::info!(queue = %self.queue, pid = %self.pid, "Queue resumed");
                }
                self.dispatch().await;
            }
            QueueMessage::Status { reply } => {
                let _ = reply.send(self.status());
            }
            QueueMessage::WorkerReady { worker, inbox } => {
                self.assigner.worker_ready(worker, inbox);
                self.dispatch().await;
            }
            QueueMessage::JobRejected { worker, job } => {
                self.assigner.mark_claimed(worker);
                if let Some(mut job) = self.in_flight.remove(&job.id) {
                    tracing::debug!(job_id = %job.id, worker = %worker, "Worker busy, job returned");
                    job.reset_attempt();
                    self.store.requeue(job);
                }
                self.dispatch().await;
            }
            QueueMessage::JobFinished { worker, job } => {
                if self.in_flight.remove(&job.id).is_none() {
                    // Already requeued after a crash or node loss
                    tracing::debug!(job_id = %job.id, worker = %worker, "Outcome for job no longer in flight");
                    return;
                }
                self.assigner.job_completed(worker, &job.id);
                self.complete(job).await;
                self.dispatch().await;
            }
            QueueMessage::WorkerCrashed {
                worker,
                job_id,
                reason,
            } => {
                tracing::warn!(queue = %self.queue, worker = %worker, job_id = ?job_id, reason = %reason, "Worker crashed");
                self.assigner.remove_worker(&worker);
                self.worker_crashed(worker, reason).await;
                self.dispatch().await;
            }
            QueueMessage::WorkerLeft { worker } => {
                self.assigner.remove_worker(&worker);
            }
            QueueMessage::Requeue { job_id } => {
                // Gone if cancelled while waiting
                if let Some(job) = self.delayed.remove(&job_id) {
                    tracing::debug!(job_id = %job_id, "Retry due");
                    self.store.requeue(job);
                    self.dispatch().await;
                }
            }
        }
    }

    async fn handle_node_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::Down(node) => self.node_lost(node).await,
            NodeEvent::Up(node) => {
                tracing::debug!(queue = %self.queue, peer_id = node, "Peer up, re-registering");
                self.membership
                    .join_queue(&self.queue, self.pid, self.self_tx.clone())
                    .await;
                // Known workers on that node are eligible again
                self.dispatch().await;
            }
        }
    }

    /// Workers on an unreachable node are forgotten and their jobs redispatched
    async fn node_lost(&mut self, node: NodeId) {
        let workers = self.assigner.workers_on(node);
        if workers.is_empty() {
            return;
        }
        for worker in &workers {
            self.assigner.remove_worker(worker);
        }
        let requeued = self.requeue_jobs_of(&workers);
        tracing::warn!(queue = %self.queue, peer_id = node, workers = workers.len(), requeued, "Lost workers on unreachable node");
        self.dispatch().await;
    }

    /// Take every in-flight job of `workers` out of the in-flight set
    fn take_jobs_of(&mut self, workers: &[ProcessId]) -> Vec<Job> {
        let ids: Vec<JobId> = self
            .in_flight
            .values()
            .filter(|j| j.by.map(|by| workers.contains(&by)).unwrap_or(false))
            .map(|j| j.id)
            .collect();
        ids.iter().filter_map(|id| self.in_flight.remove(id)).collect()
    }

    /// Return every in-flight job of `workers` to the pending store without
    /// counting a failure
    fn requeue_jobs_of(&mut self, workers: &[ProcessId]) -> usize {
        let jobs = self.take_jobs_of(workers);
        let count = jobs.len();
        for mut job in jobs {
            tracing::info!(job_id = %job.id, worker = ?job.by, "Requeueing interrupted job");
            job.reset_attempt();
            self.store.requeue(job);
        }
        count
    }

    /// A worker died mid-job: count the failure and let the hook decide
    async fn worker_crashed(&mut self, worker: ProcessId, reason: String) {
        for mut job in self.take_jobs_of(&[worker]) {
            job.reset_attempt();
            job.failure_count += 1;
            let failure = Failure::Crashed(reason.clone());
            let action = self.failure_hook.on_crash(&job, &failure);
            self.apply_failure(job, failure, action).await;
        }
    }

    fn cancel(&mut self, job_id: &JobId) -> CancelOutcome {
        if self.store.remove(job_id).is_some() || self.delayed.remove(job_id).is_some() {
            tracing::debug!(job_id = %job_id, "Job cancelled");
            CancelOutcome::Cancelled
        } else if self.in_flight.contains_key(job_id) {
            CancelOutcome::InProgress
        } else {
            CancelOutcome::NotFound
        }
    }

    fn status(&self) -> QueueStatus {
        QueueStatus {
            pid: self.pid,
            queue: self.queue.clone(),
            pending: self.store.len() + self.delayed.len(),
            delayed: self.delayed.len(),
            in_flight: self.in_flight.len(),
            suspended: self.suspended,
            strategy: self.strategy.name(),
            workers: self.assigner.snapshot(),
        }
    }

    /// Hand pending jobs to idle workers until one of them runs out
    async fn dispatch(&mut self) {
        if self.suspended {
            return;
        }

        while !self.store.is_empty() {
            let visible = self.membership.visible_nodes().await;
            let idle = self.assigner.idle_workers(&visible);
            if idle.is_empty() {
                break;
            }

            let Some(mut job) = self.store.pop_candidate() else {
                break;
            };
            let chosen = self
                .strategy
                .choose(&job, &idle)
                .filter(|pid| idle.iter().any(|w| &w.pid == pid));
            let Some(worker) = chosen else {
                self.store.requeue(job);
                break;
            };
            let Some(inbox) = self.assigner.assign(worker, job.id) else {
                self.store.requeue(job);
                break;
            };

            job.dispatch_to(worker);
            self.in_flight.insert(job.id, job.clone());
            let job_id = job.id;
            let run = WorkerMessage::Run {
                job,
                origin: QueueHandle::new(self.pid, self.self_tx.clone()),
            };

            if inbox.try_send(run).is_err() {
                tracing::warn!(job_id = %job_id, worker = %worker, "Worker unreachable, job returned");
                self.assigner.remove_worker(&worker);
                if let Some(mut job) = self.in_flight.remove(&job_id) {
                    job.reset_attempt();
                    self.store.requeue(job);
                }
                continue;
            }
            tracing::debug!(job_id = %job_id, worker = %worker, queue = %self.queue, "Job dispatched");
        }
    }

    /// Apply hooks and reply for a finished attempt
    async fn complete(&mut self, mut job: Job) {
        let Some(result) = job.result.clone() else {
            tracing::warn!(job_id = %job.id, "Finished job carries no result, requeueing");
            job.reset_attempt();
            self.store.requeue(job);
            return;
        };

        match result {
            Ok(value) => {
                self.success_hook.on_success(&job, &value);
                reply_to_submitter(&self.membership, &job, Ok(value)).await;
            }
            Err(failure) => {
                job.failure_count += 1;
                let action = self.failure_hook.on_failure(&job, &failure);
                self.apply_failure(job, failure, action).await;
            }
        }
    }

    async fn apply_failure(&mut self, mut job: Job, failure: Failure, action: FailureAction) {
        match action {
            FailureAction::Abandon => {
                reply_to_submitter(&self.membership, &job, Err(failure)).await;
            }
            FailureAction::Requeue { delay: None } => {
                job.reset_attempt();
                self.store.requeue(job);
            }
            FailureAction::Requeue { delay: Some(delay) } => {
                job.reset_attempt();
                let job_id = job.id;
                self.delayed.insert(job_id, job);
                let tx = self.self_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if tx.send(QueueMessage::Requeue { job_id }).await.is_err() {
                        tracing::debug!(job_id = %job_id, "Queue owner stopped before retry");
                    }
                });
            }
            FailureAction::Move(to) => {
                let membership = self.membership.clone();
                tokio::spawn(async move {
                    move_failed_job(membership, job, to, failure).await;
                });
            }
        }
    }
}

async fn move_failed_job(membership: Membership, job: Job, to: QueueName, failure: Failure) {
    let copy = job.copy_to(to.clone());
    let result = match route(&membership, &to).await {
        Ok(owner) => owner.enqueue(copy).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(moved) => {
            tracing::info!(job_id = %job.id, moved_id = %moved.id, to = %to, "Failed job moved");
        }
        Err(e) => {
            tracing::error!(job_id = %job.id, to = %to, error = %e, "Could not move failed job, abandoning");
            reply_to_submitter(&membership, &job, Err(failure)).await;
        }
    }
}
