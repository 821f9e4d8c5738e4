use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::membership::{ProcessId, QueueName};

pub type JobId = Uuid;

/// Function identifier plus arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub function: String,
    pub args: Vec<Value>,
}

impl Task {
    pub fn new(function: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            function: function.into(),
            args,
        }
    }
}

/// Failure payload of one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Failure {
    /// The handler returned an error value
    Error(Value),
    /// The handler panicked or was killed mid-execution
    Crashed(String),
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Failure::Error(value) => write!(f, "error: {}", value),
            Failure::Crashed(reason) => write!(f, "crashed: {}", reason),
        }
    }
}

pub type JobResult = Result<Value, Failure>;

/// Where to send the completion message of a synchronous submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyTo {
    pub owner: ProcessId,
    pub token: Uuid,
}

/// Completion message delivered to a submitter's mailbox.
#[derive(Debug, Clone)]
pub struct Reply {
    pub token: Uuid,
    pub job_id: JobId,
    pub result: JobResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    InFlight,
    Succeeded,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::InFlight => write!(f, "in_flight"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One unit of work and its lifecycle metadata.
///
/// `result` is set at most once per dispatch attempt. A job whose worker
/// crashes is returned to the pending store with `by` and `result` cleared
/// and dispatched again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub task: Task,
    pub queue: QueueName,
    pub from: Option<ReplyTo>,
    pub result: Option<JobResult>,
    pub by: Option<ProcessId>,
    /// Failed attempts so far, consumed by retrying failure hooks
    pub failure_count: u32,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A fire-and-forget job
    pub fn new(task: Task, queue: QueueName) -> Self {
        Self {
            id: Uuid::new_v4(),
            task,
            queue,
            from: None,
            result: None,
            by: None,
            failure_count: 0,
            enqueued_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Request a completion message for `owner`, under a fresh reply token
    pub fn with_reply(mut self, owner: ProcessId) -> Self {
        self.from = Some(ReplyTo {
            owner,
            token: Uuid::new_v4(),
        });
        self
    }

    pub fn status(&self) -> JobStatus {
        match (&self.result, self.by) {
            (Some(Ok(_)), _) => JobStatus::Succeeded,
            (Some(Err(_)), _) => JobStatus::Failed,
            (None, Some(_)) => JobStatus::InFlight,
            (None, None) => JobStatus::Pending,
        }
    }

    /// Mark the job as handed to `worker`
    pub fn dispatch_to(&mut self, worker: ProcessId) {
        self.by = Some(worker);
        self.result = None;
        self.started_at = Some(Utc::now());
    }

    /// Record the outcome of the current attempt
    pub fn complete(&mut self, result: JobResult) {
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
    }

    /// Forget the current attempt so the job can be dispatched again
    pub fn reset_attempt(&mut self) {
        self.by = None;
        self.result = None;
        self.started_at = None;
        self.completed_at = None;
    }

    /// A fresh job carrying the same task and reply target on another queue
    pub fn copy_to(&self, queue: QueueName) -> Self {
        Self {
            from: self.from,
            ..Self::new(self.task.clone(), queue)
        }
    }
}
