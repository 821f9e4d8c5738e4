use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::membership::{Membership, ProcessId, QueueName};
use crate::scheduler::job::{Job, JobId};
use crate::scheduler::queue::{QueueHandle, QueueMessage};
use crate::worker::heartbeat::HeartbeatTracker;

/// Inbox of a worker monitor
pub enum MonitorMessage {
    Heartbeat,
    /// The worker accepted `job` from `origin`
    Busy { job: Job, origin: QueueHandle },
    /// The worker finished its current job
    Finished { job: Job },
    Status {
        reply: oneshot::Sender<WorkerSnapshot>,
    },
}

/// What a worker is doing right now
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkerActivity {
    Idle,
    Running {
        job_id: JobId,
        function: String,
        started_at: Option<DateTime<Utc>>,
    },
}

/// Status of one worker as seen by its monitor
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub worker: ProcessId,
    pub monitor: ProcessId,
    pub queue: QueueName,
    pub activity: WorkerActivity,
}

/// How a worker ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Stopped on request with no job in progress
    Normal,
    Crashed(String),
}

/// Supervises one worker process.
///
/// The monitor is the only party that knows which job a worker holds and on
/// behalf of which queue owner. When the worker dies it reports the crash to
/// every owner so the job is requeued.
pub struct WorkerMonitor {
    pid: ProcessId,
    worker: ProcessId,
    queue: QueueName,
    membership: Membership,
    inbox: mpsc::Receiver<MonitorMessage>,
    self_tx: mpsc::Sender<MonitorMessage>,
    tracker: HeartbeatTracker,
    check_every: Duration,
    grace: Duration,
    current: Option<(Job, QueueHandle)>,
}

impl WorkerMonitor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        pid: ProcessId,
        worker: ProcessId,
        queue: QueueName,
        membership: Membership,
        inbox: mpsc::Receiver<MonitorMessage>,
        self_tx: mpsc::Sender<MonitorMessage>,
        heartbeat_timeout_ms: u64,
        grace_ms: u64,
    ) -> Self {
        let tracker = HeartbeatTracker::new(heartbeat_timeout_ms);
        let check_every = (tracker.timeout() / 4).max(Duration::from_millis(1));
        Self {
            pid,
            worker,
            queue,
            membership,
            inbox,
            self_tx,
            tracker,
            check_every,
            grace: Duration::from_millis(grace_ms),
            current: None,
        }
    }

    /// Watch `worker_task` until it ends and report how it ended
    pub(crate) async fn run(
        mut self,
        mut worker_task: JoinHandle<()>,
        shutdown: CancellationToken,
    ) -> WorkerExit {
        self.membership
            .join_monitor(&self.queue, self.pid, self.self_tx.clone())
            .await;

        let mut check = tokio::time::interval(self.check_every);
        let mut deadline: Option<Instant> = None;

        let exit = loop {
            tokio::select! {
                joined = &mut worker_task => {
                    break self.worker_ended(joined, &shutdown);
                }
                Some(msg) = self.inbox.recv() => self.handle(msg).await,
                _ = check.tick() => {
                    if !self.tracker.is_alive() {
                        worker_task.abort();
                        break WorkerExit::Crashed(format!(
                            "no heartbeat for {}ms",
                            self.tracker.timeout().as_millis()
                        ));
                    }
                }
                _ = shutdown.cancelled(), if deadline.is_none() => {
                    deadline = Some(Instant::now() + self.grace);
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    tracing::warn!(
                        worker = %self.worker,
                        grace_ms = self.grace.as_millis() as u64,
                        "Worker did not stop within grace period, killing"
                    );
                    worker_task.abort();
                    break WorkerExit::Crashed("shutdown grace period expired".to_string());
                }
            }
        };

        // Outcomes sent right before the worker ended
        while let Ok(msg) = self.inbox.try_recv() {
            self.handle(msg).await;
        }

        let exit = match (exit, &self.current) {
            (WorkerExit::Normal, Some(_)) => WorkerExit::Crashed("stopped during a job".to_string()),
            (exit, _) => exit,
        };
        self.report(&exit).await;
        self.membership.leave_monitor(&self.queue, self.pid).await;
        exit
    }

    fn worker_ended(&self, joined: Result<(), JoinError>, shutdown: &CancellationToken) -> WorkerExit {
        match joined {
            Ok(()) if shutdown.is_cancelled() => WorkerExit::Normal,
            Ok(()) => WorkerExit::Crashed("worker exited unexpectedly".to_string()),
            Err(e) if e.is_cancelled() => WorkerExit::Crashed("killed".to_string()),
            Err(e) => WorkerExit::Crashed(format!("worker panicked: {}", e)),
        }
    }

    async fn handle(&mut self, msg: MonitorMessage) {
        match msg {
            MonitorMessage::Heartbeat => self.tracker.record(),
            MonitorMessage::Busy { job, origin } => {
                self.tracker.record();
                self.current = Some((job, origin));
            }
            MonitorMessage::Finished { job } => {
                self.tracker.record();
                let origin = match self.current.take() {
                    Some((_, origin)) => origin,
                    None => {
                        tracing::warn!(worker = %self.worker, job_id = %job.id, "Outcome for unknown job");
                        return;
                    }
                };
                let finished = QueueMessage::JobFinished {
                    worker: self.worker,
                    job,
                };
                if let Err(e) = origin.send(finished).await {
                    tracing::warn!(worker = %self.worker, owner = %origin.pid, error = %e, "Queue owner gone, outcome dropped");
                }
            }
            MonitorMessage::Status { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn snapshot(&self) -> WorkerSnapshot {
        let activity = match &self.current {
            Some((job, _)) => WorkerActivity::Running {
                job_id: job.id,
                function: job.task.function.clone(),
                started_at: job.started_at,
            },
            None => WorkerActivity::Idle,
        };
        WorkerSnapshot {
            worker: self.worker,
            monitor: self.pid,
            queue: self.queue.clone(),
            activity,
        }
    }

    async fn report(&self, exit: &WorkerExit) {
        let mut owners: Vec<QueueHandle> = self
            .membership
            .queue_owners(&self.queue)
            .await
            .into_iter()
            .map(|(pid, tx)| QueueHandle::new(pid, tx))
            .collect();
        if let Some((_, origin)) = &self.current {
            if !owners.iter().any(|o| o.pid == origin.pid) {
                owners.push(origin.clone());
            }
        }

        match exit {
            WorkerExit::Normal => {
                tracing::debug!(worker = %self.worker, "Worker stopped");
                for owner in owners {
                    let _ = owner.send(QueueMessage::WorkerLeft { worker: self.worker }).await;
                }
            }
            WorkerExit::Crashed(reason) => {
                let job_id = self.current.as_ref().map(|(job, _)| job.id);
                tracing::error!(worker = %self.worker, job_id = ?job_id, reason = %reason, "Worker crashed");
                for owner in owners {
                    let crashed = QueueMessage::WorkerCrashed {
                        worker: self.worker,
                        job_id,
                        reason: reason.clone(),
                    };
                    let _ = owner.send(crashed).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::Task;

    fn monitor(membership: &Membership, timeout_ms: u64) -> (WorkerMonitor, mpsc::Sender<MonitorMessage>) {
        let (tx, rx) = mpsc::channel(16);
        let monitor = WorkerMonitor::new(
            ProcessId::spawn(1),
            ProcessId::spawn(1),
            QueueName::local("q"),
            membership.clone(),
            rx,
            tx.clone(),
            timeout_ms,
            50,
        );
        (monitor, tx)
    }

    #[tokio::test]
    async fn normal_stop_is_reported_as_left() {
        let membership = Membership::standalone(1);
        let (owner_tx, mut owner_rx) = mpsc::channel(16);
        let owner = ProcessId::spawn(1);
        membership.join_queue(&QueueName::local("q"), owner, owner_tx).await;

        let (monitor, _tx) = monitor(&membership, 1_000);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let worker_task = tokio::spawn(async {});

        assert_eq!(monitor.run(worker_task, shutdown).await, WorkerExit::Normal);
        assert!(matches!(owner_rx.recv().await, Some(QueueMessage::WorkerLeft { .. })));
    }

    #[tokio::test]
    async fn panic_is_reported_as_crash_with_job() {
        let membership = Membership::standalone(1);
        let (owner_tx, mut owner_rx) = mpsc::channel(16);
        let owner = ProcessId::spawn(1);
        membership.join_queue(&QueueName::local("q"), owner, owner_tx.clone()).await;

        let (monitor, tx) = monitor(&membership, 1_000);
        let job = Job::new(Task::new("noop", vec![]), QueueName::local("q"));
        let job_id = job.id;
        tx.send(MonitorMessage::Busy {
            job,
            origin: QueueHandle::new(owner, owner_tx),
        })
        .await
        .unwrap();

        let worker_task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            panic!("boom");
        });

        let exit = monitor.run(worker_task, CancellationToken::new()).await;
        assert!(matches!(exit, WorkerExit::Crashed(_)));
        match owner_rx.recv().await {
            Some(QueueMessage::WorkerCrashed { job_id: reported, .. }) => assert_eq!(reported, Some(job_id)),
            _ => panic!("expected crash report"),
        }
    }

    #[tokio::test]
    async fn silent_worker_is_killed() {
        let membership = Membership::standalone(1);
        let (monitor, _tx) = monitor(&membership, 40);
        let worker_task = tokio::spawn(std::future::pending::<()>());

        let exit = monitor.run(worker_task, CancellationToken::new()).await;
        assert!(matches!(exit, WorkerExit::Crashed(reason) if reason.contains("heartbeat")));
    }
}
