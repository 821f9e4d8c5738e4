//! Worker processes and their supervision.
//!
//! # Components
//!
//! - [`TaskHandler`]: user code; `init` builds per-worker state, `run`
//!   executes one task
//! - [`JobExecutor`]: runs a task in its own tokio task so a panic becomes a
//!   crashed outcome
//! - [`runner`]: the worker process; takes one job at a time from any queue
//!   owner of its queue
//! - [`monitor`]: watches one worker through heartbeats and its task handle,
//!   forwards outcomes and reports crashes
//! - [`WorkerPool`]: supervises a fixed number of worker slots
//!
//! # Execution Flow
//!
//! 1. A worker announces itself idle to every visible queue owner
//! 2. An owner sends it a job; the worker tells its monitor and starts it
//! 3. The outcome goes to the monitor, which forwards it to that owner
//! 4. The worker announces itself idle again
//!
//! If the worker dies in between, its monitor reports the crash and the owner
//! requeues the job.

pub mod executor;
pub mod heartbeat;
pub mod monitor;
pub mod pool;
pub mod runner;

pub use executor::{JobExecutor, TaskHandler};
pub use monitor::{WorkerActivity, WorkerSnapshot};
pub use pool::WorkerPool;
