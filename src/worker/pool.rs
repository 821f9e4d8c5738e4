use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::error::Result;
use crate::membership::{Membership, ProcessId, QueueName};
use crate::worker::executor::{JobExecutor, TaskHandler};
use crate::worker::monitor::{WorkerExit, WorkerMonitor};
use crate::worker::runner::Worker;

type LiveWorkers = Arc<RwLock<BTreeMap<ProcessId, AbortHandle>>>;

/// A fixed number of supervised worker slots for one queue.
///
/// Each slot initializes a handler state, runs a worker with its monitor and
/// starts a fresh worker whenever the previous one crashes. A failing `init`
/// is retried every `init_retry_ms` without affecting other slots.
pub struct WorkerPool {
    queue: QueueName,
    live: LiveWorkers,
    slots: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Validate `config` and start its worker slots.
    pub fn start<H: TaskHandler>(
        config: PoolConfig,
        handler: Arc<H>,
        membership: Membership,
        mailbox_capacity: usize,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let live: LiveWorkers = Arc::new(RwLock::new(BTreeMap::new()));

        let slots = (0..config.workers)
            .map(|slot| {
                let supervisor = Supervisor {
                    slot,
                    config: config.clone(),
                    handler: handler.clone(),
                    membership: membership.clone(),
                    mailbox_capacity,
                    live: live.clone(),
                };
                tokio::spawn(supervisor.run(shutdown.clone()))
            })
            .collect();

        tracing::info!(queue = %config.queue, workers = config.workers, "Worker pool started");
        Ok(Self {
            queue: config.queue.clone(),
            live,
            slots,
            shutdown,
        })
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    /// Number of workers currently running (initialized and not crashed)
    pub async fn live_workers(&self) -> usize {
        self.live.read().await.len()
    }

    pub async fn worker_ids(&self) -> Vec<ProcessId> {
        self.live.read().await.keys().copied().collect()
    }

    /// Kill a worker abruptly. Its job, if any, is requeued and the slot
    /// starts a replacement.
    pub async fn kill_worker(&self, pid: ProcessId) -> bool {
        match self.live.read().await.get(&pid) {
            Some(handle) => {
                tracing::warn!(worker = %pid, "Killing worker");
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Stop every slot and wait for them. Busy workers get the configured
    /// grace period.
    pub async fn stop(self) {
        self.shutdown.cancel();
        for slot in self.slots {
            let _ = slot.await;
        }
        tracing::info!(queue = %self.queue, "Worker pool stopped");
    }
}

struct Supervisor<H: TaskHandler> {
    slot: usize,
    config: Arc<PoolConfig>,
    handler: Arc<H>,
    membership: Membership,
    mailbox_capacity: usize,
    live: LiveWorkers,
}

impl<H: TaskHandler> Supervisor<H> {
    async fn run(self, shutdown: CancellationToken) {
        let node = self.membership.node_id();
        while !shutdown.is_cancelled() {
            let Some(state) = self.init_with_retry(&shutdown).await else {
                break;
            };

            let worker_pid = ProcessId::spawn(node);
            let monitor_pid = ProcessId::spawn(node);
            let (monitor_tx, monitor_rx) = mpsc::channel(self.mailbox_capacity);

            let worker = Worker::new(
                worker_pid,
                self.config.queue.clone(),
                self.membership.clone(),
                JobExecutor::new(self.handler.clone(), Arc::new(state)),
                self.mailbox_capacity,
                monitor_tx.clone(),
                self.config.heartbeat_interval_ms,
            );
            let monitor = WorkerMonitor::new(
                monitor_pid,
                worker_pid,
                self.config.queue.clone(),
                self.membership.clone(),
                monitor_rx,
                monitor_tx,
                self.config.heartbeat_timeout_ms,
                self.config.shutdown_grace_ms,
            );

            let task = tokio::spawn(worker.run(shutdown.clone()));
            self.live.write().await.insert(worker_pid, task.abort_handle());

            let exit = monitor.run(task, shutdown.clone()).await;
            self.live.write().await.remove(&worker_pid);

            match exit {
                WorkerExit::Normal => break,
                WorkerExit::Crashed(reason) => {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    tracing::warn!(
                        queue = %self.config.queue,
                        slot = self.slot,
                        worker = %worker_pid,
                        reason = %reason,
                        "Restarting crashed worker"
                    );
                }
            }
        }
    }

    /// Run `init` until it succeeds. Returns None on shutdown.
    async fn init_with_retry(&self, shutdown: &CancellationToken) -> Option<H::State> {
        let retry = Duration::from_millis(self.config.init_retry_ms);
        loop {
            let handler = self.handler.clone();
            let args = self.config.init_args.clone();
            // Spawned so a panicking init counts as a failed attempt
            let attempt = tokio::spawn(async move { handler.init(&args).await });

            let reason = tokio::select! {
                _ = shutdown.cancelled() => return None,
                joined = attempt => match joined {
                    Ok(Ok(state)) => return Some(state),
                    Ok(Err(reason)) => reason,
                    Err(e) => format!("init panicked: {}", e),
                },
            };

            tracing::warn!(
                queue = %self.config.queue,
                slot = self.slot,
                reason = %reason,
                retry_ms = self.config.init_retry_ms,
                "Worker init failed, retrying"
            );
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = tokio::time::sleep(retry) => {}
            }
        }
    }
}
