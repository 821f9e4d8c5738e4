use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::worker::monitor::MonitorMessage;

/// Periodic liveness signal from a worker to its monitor.
///
/// Driven from the worker's own loop so that a stuck worker also stops
/// beating.
pub struct HeartbeatSender {
    interval: Interval,
    tx: mpsc::Sender<MonitorMessage>,
}

impl HeartbeatSender {
    pub fn new(interval_ms: u64, tx: mpsc::Sender<MonitorMessage>) -> Self {
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval, tx }
    }

    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }

    /// Send one heartbeat. Returns false once the monitor is gone.
    pub fn beat(&self) -> bool {
        match self.tx.try_send(MonitorMessage::Heartbeat) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Receiving side: when was the worker last heard from
#[derive(Debug)]
pub struct HeartbeatTracker {
    last_heartbeat: Instant,
    timeout: Duration,
}

impl HeartbeatTracker {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            last_heartbeat: Instant::now(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    pub fn record(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    pub fn is_alive(&self) -> bool {
        self.last_heartbeat.elapsed() < self.timeout
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
