//! Failure and success hook behavior through a running queue.

mod test_harness;

use std::time::{Duration, Instant};

use serde_json::json;

use nomad_pool::config::QueueConfig;
use nomad_pool::scheduler::hooks::{FailureHookSpec, SuccessHookSpec};
use nomad_pool::scheduler::{CancelOutcome, Failure, Task};
use nomad_pool::{PoolError, QueueName};
use test_harness::{assert_eventually, test_pool_config, TestHandler, TestPool};

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

async fn pool_with_hook(name: &str, hook: FailureHookSpec) -> TestPool {
    let queue = QueueName::local(name);
    TestPool::start(
        QueueConfig::new(queue.clone()).with_failure_hook(hook),
        test_pool_config(&queue, 1),
        TestHandler::new(),
    )
    .await
}

#[tokio::test]
async fn test_retry_until_success() {
    let pool = pool_with_hook("retry", FailureHookSpec::retry(3)).await;
    let job = pool.submit("flaky", vec![json!("job-a"), json!(2)]).await;

    let result = pool.client.await_result(&job, REPLY_TIMEOUT).await.unwrap();
    assert_eq!(result, Some(Ok(json!(3))));
    assert_eq!(pool.handler.attempts("job-a"), 3);

    pool.node.shutdown().await;
}

#[tokio::test]
async fn test_retry_exhausted_abandons() {
    let pool = pool_with_hook("retry-exhausted", FailureHookSpec::retry(2)).await;
    let job = pool.submit("fail", vec![]).await;

    let result = pool.client.await_result(&job, REPLY_TIMEOUT).await.unwrap();
    assert_eq!(result, Some(Err(Failure::Error(json!("always fails")))));
    // One attempt plus two retries
    assert_eq!(pool.handler.started(), 3);
    assert_eq!(pool.pending().await, 0);

    pool.node.shutdown().await;
}

#[tokio::test]
async fn test_requeue_reruns_job() {
    let pool = pool_with_hook("requeue", FailureHookSpec::Requeue).await;
    let job = pool.submit("flaky", vec![json!("job-b"), json!(1)]).await;

    let result = pool.client.await_result(&job, REPLY_TIMEOUT).await.unwrap();
    assert_eq!(result, Some(Ok(json!(2))));

    pool.node.shutdown().await;
}

#[tokio::test]
async fn test_exponential_retry_backs_off() {
    let hook = FailureHookSpec::ExponentialRetry {
        times: 3,
        base_ms: 50,
        finally: Box::new(FailureHookSpec::Abandon),
    };
    let pool = pool_with_hook("backoff", hook).await;
    pool.wait_for_workers(1).await;

    let start = Instant::now();
    let job = pool.submit("flaky", vec![json!("job-c"), json!(2)]).await;
    let result = pool.client.await_result(&job, REPLY_TIMEOUT).await.unwrap();

    assert_eq!(result, Some(Ok(json!(3))));
    // 50ms after the first failure, 100ms after the second
    assert!(start.elapsed() >= Duration::from_millis(150));

    pool.node.shutdown().await;
}

#[tokio::test]
async fn test_job_waiting_for_backoff_can_be_cancelled() {
    let hook = FailureHookSpec::ExponentialRetry {
        times: 3,
        base_ms: 400,
        finally: Box::new(FailureHookSpec::Abandon),
    };
    let pool = pool_with_hook("backoff-cancel", hook).await;
    let job = pool.submit("flaky", vec![json!("job-d"), json!(1)]).await;

    let client = &pool.client;
    let queue = &pool.queue;
    assert_eventually(
        || async { client.status(queue).await.unwrap().delayed() == 1 },
        Duration::from_secs(2),
        "failed job should wait for its retry",
    )
    .await;

    // Still visible while waiting
    let status = client.status(queue).await.unwrap();
    assert_eq!(status.pending(), 1);
    assert_eq!(status.in_flight(), 0);
    let waiting = client.filter(queue, |_| true).await.unwrap();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].id, job.id);

    assert_eq!(client.cancel(&job).await.unwrap(), CancelOutcome::Cancelled);
    assert_eq!(client.cancel(&job).await.unwrap(), CancelOutcome::NotFound);

    // The retry timer fires but the job stays cancelled
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(pool.handler.attempts("job-d"), 1);
    assert_eq!(pool.pending().await, 0);
    assert_eq!(client.await_result(&job, Duration::from_millis(100)).await.unwrap(), None);

    pool.node.shutdown().await;
}

#[tokio::test]
async fn test_failed_job_moves_to_dead_letter_queue() {
    let dead = QueueName::local("dead-letter");
    let mut pool = pool_with_hook("dlq-source", FailureHookSpec::Move { to: dead.clone() }).await;
    pool.node
        .start_queue(QueueConfig::new(dead.clone()).suspended(true))
        .await
        .unwrap();

    let job = pool.submit("fail", vec![json!("payload")]).await;

    let client = &pool.client;
    assert_eventually(
        || async { client.filter(&dead, |_| true).await.unwrap().len() == 1 },
        Duration::from_secs(2),
        "failed job should land in the dead-letter queue",
    )
    .await;

    let parked = client.filter(&dead, |_| true).await.unwrap();
    assert_eq!(parked[0].task, Task::new("fail", vec![json!("payload")]));
    assert_eq!(parked[0].from, job.from);
    assert_eq!(pool.pending().await, 0);

    // No reply until the moved job itself finishes
    assert_eq!(
        client.await_result(&job, Duration::from_millis(100)).await.unwrap(),
        None
    );

    pool.node.shutdown().await;
}

#[tokio::test]
async fn test_move_to_missing_queue_abandons() {
    let missing = QueueName::local("nowhere");
    let pool = pool_with_hook("dlq-missing", FailureHookSpec::Move { to: missing }).await;

    let job = pool.submit("fail", vec![]).await;
    let result = pool.client.await_result(&job, REPLY_TIMEOUT).await.unwrap();
    assert_eq!(result, Some(Err(Failure::Error(json!("always fails")))));

    pool.node.shutdown().await;
}

#[tokio::test]
async fn test_invalid_hooks_prevent_queue_start() {
    let queue = QueueName::local("invalid");
    let mut node = nomad_pool::Node::standalone(nomad_pool::config::NodeConfig::new(1)).unwrap();

    let zero_retries = QueueConfig::new(queue.clone()).with_failure_hook(FailureHookSpec::Retry {
        times: 0,
        finally: Box::new(FailureHookSpec::Abandon),
    });
    let err = node.start_queue(zero_retries).await.unwrap_err();
    assert!(matches!(err, PoolError::InvalidFailureHook(_)));

    let self_move =
        QueueConfig::new(queue.clone()).with_failure_hook(FailureHookSpec::Move { to: queue.clone() });
    assert!(matches!(
        node.start_queue(self_move).await.unwrap_err(),
        PoolError::InvalidFailureHook(_)
    ));

    let nested = QueueConfig::new(queue.clone()).with_failure_hook(FailureHookSpec::Retry {
        times: 2,
        finally: Box::new(FailureHookSpec::ExponentialRetry {
            times: 1,
            base_ms: 0,
            finally: Box::new(FailureHookSpec::Abandon),
        }),
    });
    assert!(matches!(
        node.start_queue(nested).await.unwrap_err(),
        PoolError::InvalidFailureHook(_)
    ));

    // Nothing was started
    let client = node.client().await;
    let err = client.submit(Task::new("echo", vec![]), &queue, false).await.unwrap_err();
    assert!(matches!(err, PoolError::NoQueueOwner(_)));

    node.shutdown().await;
}

#[tokio::test]
async fn test_log_success_hook_does_not_change_reply() {
    let queue = QueueName::local("logged");
    let pool = TestPool::start(
        QueueConfig::new(queue.clone()).with_success_hook(SuccessHookSpec::Log),
        test_pool_config(&queue, 1),
        TestHandler::new(),
    )
    .await;

    let job = pool.submit("echo", vec![json!({"k": "v"})]).await;
    let result = pool.client.await_result(&job, REPLY_TIMEOUT).await.unwrap();
    assert_eq!(result, Some(Ok(json!({"k": "v"}))));

    pool.node.shutdown().await;
}
