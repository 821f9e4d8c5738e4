use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::{JoinError, JoinSet};

use crate::scheduler::job::{Failure, JobResult, Task};

/// User-supplied task execution.
///
/// `init` runs once per worker (and again after every restart); a failure
/// keeps the worker slot unavailable until a retry succeeds. `run` executes
/// one task against the worker's state.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    type State: Send + Sync + 'static;

    async fn init(&self, args: &[Value]) -> Result<Self::State, String>;

    async fn run(&self, state: &Self::State, task: &Task) -> Result<Value, Value>;
}

/// Runs one task at a time for a worker.
///
/// The task runs in its own tokio task, so a panic in the handler becomes a
/// [`Failure::Crashed`] outcome instead of taking the worker down. Dropping
/// the executor aborts a running task.
pub struct JobExecutor<H: TaskHandler> {
    handler: Arc<H>,
    state: Arc<H::State>,
    running: JoinSet<Result<Value, Value>>,
}

impl<H: TaskHandler> JobExecutor<H> {
    pub fn new(handler: Arc<H>, state: Arc<H::State>) -> Self {
        Self {
            handler,
            state,
            running: JoinSet::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.running.is_empty()
    }

    /// Start executing `task`
    pub fn start(&mut self, task: Task) {
        let handler = self.handler.clone();
        let state = self.state.clone();
        tracing::debug!(function = %task.function, "Executing task");
        self.running
            .spawn(async move { handler.run(&state, &task).await });
    }

    /// Wait for the running task. Pending forever when nothing runs.
    pub async fn next(&mut self) -> JobResult {
        match self.running.join_next().await {
            Some(result) => Self::process_output(result),
            None => std::future::pending().await,
        }
    }

    fn process_output(result: Result<Result<Value, Value>, JoinError>) -> JobResult {
        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(Failure::Error(error)),
            Err(e) if e.is_panic() => {
                let reason = panic_message(e.into_panic());
                tracing::error!(reason = %reason, "Task panicked");
                Err(Failure::Crashed(reason))
            }
            Err(_) => Err(Failure::Crashed("task aborted".to_string())),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
