use thiserror::Error;

use crate::membership::{ProcessId, QueueName};
use crate::scheduler::JobId;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("No queue-owner process for queue {0}")]
    NoQueueOwner(QueueName),

    #[error("Invalid failure hook configuration: {0}")]
    InvalidFailureHook(String),

    #[error("Invalid success hook configuration: {0}")]
    InvalidSuccessHook(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Job {0} was not submitted by this process")]
    NotOwner(JobId),

    #[error("Job {0} was submitted without requesting a reply")]
    NoReplyRequested(JobId),

    #[error("Process {0} is not running")]
    ProcessDown(ProcessId),

    #[error("Peer node {0} is unreachable")]
    PeerUnreachable(u64),
}

pub type Result<T> = std::result::Result<T, PoolError>;
