//! The job-dispatch engine.
//!
//! - [`job`]: the unit of work and its lifecycle metadata
//! - [`store`]: pluggable pending-job backends
//! - [`strategy`]: pluggable policies matching idle workers to jobs
//! - [`hooks`]: pluggable failure/success policies
//! - [`assigner`]: per-queue-owner worker tracking
//! - [`queue`]: the queue-owner process and its control protocol

pub mod assigner;
pub mod hooks;
pub mod job;
pub mod queue;
pub mod store;
pub mod strategy;

pub use job::{Failure, Job, JobId, JobResult, JobStatus, Task};
pub use queue::{CancelOutcome, QueueEngine, QueueHandle, QueueStatus};
