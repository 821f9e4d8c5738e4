//! Pluggable policies run by a queue owner on a job's outcome.
//!
//! Hook specs are validated by [`FailureHookSpec::build`] and
//! [`SuccessHookSpec::build`] when the queue starts, so a bad configuration
//! is rejected before any queue-owner process exists.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::error::{PoolError, Result};
use crate::membership::QueueName;
use crate::scheduler::job::{Failure, Job};

/// What the queue owner does with a failed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureAction {
    /// Discard the job and reply with the failure
    Abandon,
    /// Put the job back in the pending store, optionally after a delay
    Requeue { delay: Option<Duration> },
    /// Enqueue the job on another queue, keeping its reply target
    Move(QueueName),
}

pub trait FailureHook: Send + Sync + fmt::Debug {
    /// Decide the fate of `job`. `job.failure_count` already includes the
    /// attempt that just failed.
    fn on_failure(&self, job: &Job, failure: &Failure) -> FailureAction;

    /// Decide the fate of a job whose worker died before reporting. Jobs are
    /// redelivered unless the hook bounds crashes like other failures.
    fn on_crash(&self, job: &Job, failure: &Failure) -> FailureAction {
        tracing::info!(job_id = %job.id, failure = %failure, "Worker lost, requeueing job");
        FailureAction::Requeue { delay: None }
    }

    /// Reject invalid configuration at queue construction time
    fn validate(&self) -> std::result::Result<(), String> {
        Ok(())
    }
}

pub trait SuccessHook: Send + Sync + fmt::Debug {
    fn on_success(&self, job: &Job, value: &Value);

    fn validate(&self) -> std::result::Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct Abandon;

impl FailureHook for Abandon {
    fn on_failure(&self, job: &Job, failure: &Failure) -> FailureAction {
        tracing::warn!(
            job_id = %job.id,
            queue = %job.queue,
            function = %job.task.function,
            failure = %failure,
            "Job failed, abandoning"
        );
        FailureAction::Abandon
    }
}

#[derive(Debug, Default)]
pub struct Requeue;

impl FailureHook for Requeue {
    fn on_failure(&self, job: &Job, failure: &Failure) -> FailureAction {
        tracing::info!(job_id = %job.id, failure = %failure, "Job failed, requeueing");
        FailureAction::Requeue { delay: None }
    }
}

/// Dead-letter style: send failed jobs to another queue
#[derive(Debug)]
pub struct MoveTo {
    pub to: QueueName,
}

impl FailureHook for MoveTo {
    fn on_failure(&self, job: &Job, failure: &Failure) -> FailureAction {
        tracing::info!(job_id = %job.id, to = %self.to, failure = %failure, "Job failed, moving");
        FailureAction::Move(self.to.clone())
    }
}

/// Retry up to `times` more attempts, then defer to `finally`
#[derive(Debug)]
pub struct Retry {
    pub times: u32,
    pub finally: Arc<dyn FailureHook>,
}

impl FailureHook for Retry {
    fn on_failure(&self, job: &Job, failure: &Failure) -> FailureAction {
        if job.failure_count <= self.times {
            tracing::info!(
                job_id = %job.id,
                attempt = job.failure_count,
                times = self.times,
                failure = %failure,
                "Job failed, retrying"
            );
            FailureAction::Requeue { delay: None }
        } else {
            self.finally.on_failure(job, failure)
        }
    }

    fn on_crash(&self, job: &Job, failure: &Failure) -> FailureAction {
        self.on_failure(job, failure)
    }
}

/// Like [`Retry`], waiting `base_ms * 2^(attempt - 1)` before each retry
#[derive(Debug)]
pub struct ExponentialRetry {
    pub times: u32,
    pub base_ms: u64,
    pub finally: Arc<dyn FailureHook>,
}

impl ExponentialRetry {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_ms.saturating_mul(factor))
    }
}

impl FailureHook for ExponentialRetry {
    fn on_failure(&self, job: &Job, failure: &Failure) -> FailureAction {
        if job.failure_count <= self.times {
            let delay = self.delay_for(job.failure_count);
            tracing::info!(
                job_id = %job.id,
                attempt = job.failure_count,
                delay_ms = delay.as_millis() as u64,
                failure = %failure,
                "Job failed, retrying with backoff"
            );
            FailureAction::Requeue { delay: Some(delay) }
        } else {
            self.finally.on_failure(job, failure)
        }
    }

    fn on_crash(&self, job: &Job, failure: &Failure) -> FailureAction {
        self.on_failure(job, failure)
    }
}

#[derive(Debug, Default)]
pub struct Noop;

impl SuccessHook for Noop {
    fn on_success(&self, _job: &Job, _value: &Value) {}
}

#[derive(Debug, Default)]
pub struct Log;

impl SuccessHook for Log {
    fn on_success(&self, job: &Job, value: &Value) {
        let elapsed_ms = match (job.started_at, job.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        };
        tracing::info!(
            job_id = %job.id,
            queue = %job.queue,
            function = %job.task.function,
            worker = ?job.by,
            elapsed_ms = ?elapsed_ms,
            result = %value,
            "Job succeeded"
        );
    }
}

/// Failure hook selection and arguments.
#[derive(Clone, Default)]
pub enum FailureHookSpec {
    #[default]
    Abandon,
    Requeue,
    Move {
        to: QueueName,
    },
    Retry {
        times: u32,
        finally: Box<FailureHookSpec>,
    },
    ExponentialRetry {
        times: u32,
        base_ms: u64,
        finally: Box<FailureHookSpec>,
    },
    Custom(Arc<dyn FailureHook>),
}

impl FailureHookSpec {
    /// Retry `times` times, then abandon
    pub fn retry(times: u32) -> Self {
        FailureHookSpec::Retry {
            times,
            finally: Box::new(FailureHookSpec::Abandon),
        }
    }

    /// Validate and build the hook for a queue named `owner`
    pub fn build(&self, owner: &QueueName) -> Result<Arc<dyn FailureHook>> {
        let hook: Arc<dyn FailureHook> = match self {
            FailureHookSpec::Abandon => Arc::new(Abandon),
            FailureHookSpec::Requeue => Arc::new(Requeue),
            FailureHookSpec::Move { to } => {
                if to.name().is_empty() {
                    return Err(PoolError::InvalidFailureHook(
                        "move target queue name is empty".to_string(),
                    ));
                }
                if to == owner {
                    return Err(PoolError::InvalidFailureHook(format!(
                        "move target {} is the failing queue itself",
                        to
                    )));
                }
                Arc::new(MoveTo { to: to.clone() })
            }
            FailureHookSpec::Retry { times, finally } => {
                if *times == 0 {
                    return Err(PoolError::InvalidFailureHook(
                        "retry times must be at least 1".to_string(),
                    ));
                }
                Arc::new(Retry {
                    times: *times,
                    finally: finally.build(owner)?,
                })
            }
            FailureHookSpec::ExponentialRetry {
                times,
                base_ms,
                finally,
            } => {
                if *times == 0 {
                    return Err(PoolError::InvalidFailureHook(
                        "retry times must be at least 1".to_string(),
                    ));
                }
                if *base_ms == 0 {
                    return Err(PoolError::InvalidFailureHook(
                        "backoff base must be at least 1ms".to_string(),
                    ));
                }
                Arc::new(ExponentialRetry {
                    times: *times,
                    base_ms: *base_ms,
                    finally: finally.build(owner)?,
                })
            }
            FailureHookSpec::Custom(hook) => hook.clone(),
        };
        hook.validate().map_err(PoolError::InvalidFailureHook)?;
        Ok(hook)
    }
}

impl fmt::Debug for FailureHookSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureHookSpec::Abandon => write!(f, "Abandon"),
            FailureHookSpec::Requeue => write!(f, "Requeue"),
            FailureHookSpec::Move { to } => write!(f, "Move({})", to),
            FailureHookSpec::Retry { times, finally } => {
                write!(f, "Retry({}, then {:?})", times, finally)
            }
            FailureHookSpec::ExponentialRetry {
                times,
                base_ms,
                finally,
            } => write!(f, "ExponentialRetry({}, {}ms, then {:?})", times, base_ms, finally),
            FailureHookSpec::Custom(hook) => write!(f, "Custom({:?})", hook),
        }
    }
}

/// Success hook selection.
#[derive(Clone, Default)]
pub enum SuccessHookSpec {
    #[default]
    Noop,
    Log,
    Custom(Arc<dyn SuccessHook>),
}

impl SuccessHookSpec {
    pub fn build(&self) -> Result<Arc<dyn SuccessHook>> {
        let hook: Arc<dyn SuccessHook> = match self {
            SuccessHookSpec::Noop => Arc::new(Noop),
            SuccessHookSpec::Log => Arc::new(Log),
            SuccessHookSpec::Custom(hook) => hook.clone(),
        };
        hook.validate().map_err(PoolError::InvalidSuccessHook)?;
        Ok(hook)
    }
}

impl fmt::Debug for SuccessHookSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuccessHookSpec::Noop => write!(f, "Noop"),
            SuccessHookSpec::Log => write!(f, "Log"),
            SuccessHookSpec::Custom(hook) => write!(f, "Custom({:?})", hook),
        }
    }
}
