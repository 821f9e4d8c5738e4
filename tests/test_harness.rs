//! Test harness for queue and worker-pool integration tests.
//!
//! Provides a scriptable task handler, single-node and multi-node setups with
//! short timeouts, and polling helpers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use nomad_pool::config::{NodeConfig, PoolConfig, QueueConfig};
use nomad_pool::membership::{Cluster, NodeId, ProcessId};
use nomad_pool::scheduler::hooks::SuccessHook;
use nomad_pool::scheduler::{Job, Task};
use nomad_pool::worker::TaskHandler;
use nomad_pool::{Client, Node, QueueName};

/// Task handler driven by the task's function name:
///
/// - `echo [v]`: returns `v`
/// - `sleep [ms]`: sleeps, then returns `ms`
/// - `fail`: always fails
/// - `panic`: panics
/// - `flaky [key, n]`: fails the first `n` attempts for `key`, then succeeds
#[derive(Debug, Default)]
pub struct TestHandler {
    /// Remaining `init` calls that should fail
    init_failures: AtomicU32,
    pub init_calls: AtomicUsize,
    pub started: AtomicUsize,
    pub completed: AtomicUsize,
    attempts: Mutex<HashMap<String, u32>>,
}

impl TestHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_init(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            init_failures: AtomicU32::new(failures),
            ..Default::default()
        })
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn attempts(&self, key: &str) -> u32 {
        self.attempts.lock().unwrap().get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl TaskHandler for TestHandler {
    type State = ();

    async fn init(&self, _args: &[Value]) -> Result<(), String> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.init_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.init_failures.store(remaining - 1, Ordering::SeqCst);
            return Err("backend not ready".to_string());
        }
        Ok(())
    }

    async fn run(&self, _state: &(), task: &Task) -> Result<Value, Value> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let arg = task.args.first().cloned().unwrap_or(Value::Null);
        let result = match task.function.as_str() {
            "echo" => Ok(arg),
            "sleep" => {
                let ms = arg.as_u64().unwrap_or(100);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!(ms))
            }
            "fail" => Err(json!("always fails")),
            "panic" => panic!("handler panicked"),
            "flaky" => {
                let key = arg.as_str().unwrap_or_default().to_string();
                let failures = task.args.get(1).and_then(Value::as_u64).unwrap_or(1) as u32;
                let mut attempts = self.attempts.lock().unwrap();
                let attempt = attempts.entry(key).or_insert(0);
                *attempt += 1;
                if *attempt <= failures {
                    Err(json!(format!("attempt {} failed", attempt)))
                } else {
                    Ok(json!(*attempt))
                }
            }
            other => Err(json!(format!("unknown function {}", other))),
        };
        self.completed.fetch_add(1, Ordering::SeqCst);
        result
    }
}

/// Success hook remembering which worker ran each job
#[derive(Debug, Default)]
pub struct RecordWorker {
    pub workers: Mutex<Vec<ProcessId>>,
}

impl RecordWorker {
    pub fn recorded(&self) -> Vec<ProcessId> {
        self.workers.lock().unwrap().clone()
    }
}

impl SuccessHook for RecordWorker {
    fn on_success(&self, job: &Job, _value: &Value) {
        if let Some(by) = job.by {
            self.workers.lock().unwrap().push(by);
        }
    }
}

/// Pool settings with short timeouts for faster tests
pub fn test_pool_config(queue: &QueueName, workers: usize) -> PoolConfig {
    PoolConfig::new(queue.clone())
        .with_workers(workers)
        .with_init_retry_ms(50)
        .with_shutdown_grace_ms(1_000)
        .with_heartbeat(20, 500)
}

/// A standalone node running one queue and one pool
pub struct TestPool {
    pub node: Node,
    pub queue: QueueName,
    pub handler: Arc<TestHandler>,
    pub client: Client,
}

impl TestPool {
    pub async fn start(queue_config: QueueConfig, pool_config: PoolConfig, handler: Arc<TestHandler>) -> Self {
        let queue = queue_config.queue.clone();
        let mut node = Node::standalone(NodeConfig::new(1)).unwrap();
        node.start_queue(queue_config).await.unwrap();
        node.start_workers(pool_config, handler.clone()).unwrap();
        let client = node.client().await;
        Self {
            node,
            queue,
            handler,
            client,
        }
    }

    /// Local queue `name` with `workers` workers and default hooks
    pub async fn local(name: &str, workers: usize) -> Self {
        let queue = QueueName::local(name);
        Self::start(
            QueueConfig::new(queue.clone()),
            test_pool_config(&queue, workers),
            TestHandler::new(),
        )
        .await
    }

    pub async fn pending(&self) -> usize {
        self.client.status(&self.queue).await.unwrap().pending()
    }

    pub async fn in_flight(&self) -> usize {
        self.client.status(&self.queue).await.unwrap().in_flight()
    }

    pub async fn wait_for_workers(&self, count: usize) {
        let pool = self.node.pool(&self.queue).unwrap();
        assert_eventually(
            || async { pool.live_workers().await == count },
            Duration::from_secs(5),
            "workers should start",
        )
        .await;
    }

    pub async fn submit(&self, function: &str, args: Vec<Value>) -> Job {
        self.client
            .submit(Task::new(function, args), &self.queue, true)
            .await
            .unwrap()
    }
}

/// Join `cluster` as `node_id`, monitoring `peers` every 20ms
pub async fn join_node(cluster: &Arc<Cluster>, node_id: NodeId, peers: &[NodeId]) -> Node {
    let config = peers
        .iter()
        .fold(NodeConfig::new(node_id), |config, &peer| {
            config.with_peer(peer, format!("node-{}", peer))
        })
        .with_reconnect_interval_ms(20);
    Node::join(cluster, config).await.unwrap()
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(condition: F, timeout_duration: Duration, poll_interval: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
