use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::membership::{Membership, NodeEvent, ProcessId, QueueName};
use crate::scheduler::job::{Job, JobResult};
use crate::scheduler::queue::{QueueHandle, QueueMessage};
use crate::worker::executor::{JobExecutor, TaskHandler};
use crate::worker::heartbeat::HeartbeatSender;
use crate::worker::monitor::MonitorMessage;

/// Inbox of a worker process
pub enum WorkerMessage {
    /// Execute `job` and report the outcome on behalf of `origin`
    Run { job: Job, origin: QueueHandle },
}

/// A worker process: takes one job at a time from any queue owner of its
/// queue and reports each outcome through its monitor.
pub(crate) struct Worker<H: TaskHandler> {
    pid: ProcessId,
    queue: QueueName,
    membership: Membership,
    executor: JobExecutor<H>,
    inbox: mpsc::Receiver<WorkerMessage>,
    self_tx: mpsc::Sender<WorkerMessage>,
    monitor: mpsc::Sender<MonitorMessage>,
    heartbeat: HeartbeatSender,
    current: Option<(Job, QueueHandle)>,
}

impl<H: TaskHandler> Worker<H> {
    pub(crate) fn new(
        pid: ProcessId,
        queue: QueueName,
        membership: Membership,
        executor: JobExecutor<H>,
        mailbox_capacity: usize,
        monitor: mpsc::Sender<MonitorMessage>,
        heartbeat_interval_ms: u64,
    ) -> Self {
        let (self_tx, inbox) = mpsc::channel(mailbox_capacity);
        Self {
            pid,
            queue,
            membership,
            executor,
            inbox,
            self_tx,
            heartbeat: HeartbeatSender::new(heartbeat_interval_ms, monitor.clone()),
            monitor,
            current: None,
        }
    }

    /// Process messages until shutdown. A busy worker finishes its job first;
    /// the monitor enforces the grace period.
    pub(crate) async fn run(mut self, shutdown: CancellationToken) {
        let mut node_events = self.membership.subscribe();
        self.membership
            .join_worker(&self.queue, self.pid, self.self_tx.clone())
            .await;
        tracing::debug!(worker = %self.pid, queue = %self.queue, "Worker started");
        self.announce_ready().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled(), if self.current.is_none() => break,
                _ = self.heartbeat.tick() => {
                    if !self.heartbeat.beat() {
                        tracing::warn!(worker = %self.pid, "Monitor gone, stopping worker");
                        break;
                    }
                }
                msg = self.inbox.recv() => match msg {
                    Some(WorkerMessage::Run { job, origin }) => self.accept(job, origin, &shutdown).await,
                    None => break,
                },
                result = self.executor.next(), if self.executor.is_running() => {
                    self.finish(result, &shutdown).await;
                }
                event = node_events.recv() => {
                    if let Ok(NodeEvent::Up(peer)) = event {
                        tracing::debug!(worker = %self.pid, peer_id = peer, "Peer up, re-registering");
                        self.membership
                            .join_worker(&self.queue, self.pid, self.self_tx.clone())
                            .await;
                        if self.current.is_none() && !shutdown.is_cancelled() {
                            self.announce_ready().await;
                        }
                    }
                }
            }
        }

        self.membership.leave_worker(&self.queue, self.pid).await;
        tracing::debug!(worker = %self.pid, "Worker stopped");
    }

    async fn accept(&mut self, job: Job, origin: QueueHandle, shutdown: &CancellationToken) {
        if self.current.is_some() || shutdown.is_cancelled() {
            let reject = QueueMessage::JobRejected {
                worker: self.pid,
                job,
            };
            if let Err(e) = origin.send(reject).await {
                tracing::warn!(worker = %self.pid, error = %e, "Could not return rejected job");
            }
            return;
        }

        tracing::info!(
            worker = %self.pid,
            job_id = %job.id,
            function = %job.task.function,
            "Running job"
        );
        let busy = MonitorMessage::Busy {
            job: job.clone(),
            origin: origin.clone(),
        };
        if self.monitor.send(busy).await.is_err() {
            tracing::warn!(worker = %self.pid, "Monitor gone while starting job");
        }
        self.executor.start(job.task.clone());
        self.current = Some((job, origin));
    }

    async fn finish(&mut self, result: JobResult, shutdown: &CancellationToken) {
        let Some((mut job, _origin)) = self.current.take() else {
            return;
        };
        tracing::info!(
            worker = %self.pid,
            job_id = %job.id,
            success = result.is_ok(),
            "Job finished"
        );
        job.complete(result);
        if self.monitor.send(MonitorMessage::Finished { job }).await.is_err() {
            tracing::warn!(worker = %self.pid, "Monitor gone, outcome lost");
        }

        if !shutdown.is_cancelled() {
            self.announce_ready().await;
        }
    }

    /// Tell every visible queue owner this worker is idle
    async fn announce_ready(&self) {
        for (pid, tx) in self.membership.queue_owners(&self.queue).await {
            let owner = QueueHandle::new(pid, tx);
            let ready = QueueMessage::WorkerReady {
                worker: self.pid,
                inbox: self.self_tx.clone(),
            };
            if let Err(e) = owner.send(ready).await {
                tracing::debug!(worker = %self.pid, owner = %pid, error = %e, "Queue owner gone");
            }
        }
    }
}
