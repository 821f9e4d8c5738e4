//! A pluggable job queue and worker-pool runtime.
//!
//! Clients submit tasks to a named queue; queue owners hold the pending jobs
//! and hand them to idle workers chosen by a dispatch strategy. Queues are
//! either local to a node or global across a cluster. A job interrupted by a
//! worker crash or node loss is requeued, so every job runs at least once.

pub mod client;
pub mod config;
pub mod error;
pub mod membership;
pub mod node;
pub mod scheduler;
pub mod shutdown;
pub mod worker;

pub use client::{Client, PoolStatus};
pub use error::{PoolError, Result};
pub use membership::QueueName;
pub use node::Node;
