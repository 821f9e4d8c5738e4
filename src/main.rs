use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use serde::Serialize;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use nomad_pool::config::{NodeConfig, PoolConfig, QueueConfig};
use nomad_pool::scheduler::hooks::{FailureHookSpec, SuccessHookSpec};
use nomad_pool::scheduler::strategy::StrategySpec;
use nomad_pool::scheduler::{Failure, JobResult, Task};
use nomad_pool::shutdown::install_shutdown_handler;
use nomad_pool::worker::{TaskHandler, WorkerActivity};
use nomad_pool::{Client, Node, QueueName};

#[derive(Parser, Debug)]
#[command(name = "nomad-pool")]
#[command(version)]
#[command(about = "A pluggable job queue and worker-pool runtime")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a node with one queue and pool, submit a batch of jobs and
    /// print their results
    Run(RunArgs),

    /// Start a node with one queue and pool and report its status until
    /// SIGINT/SIGTERM
    Serve(ServeArgs),
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct QueueArgs {
    /// Node ID
    #[arg(long, default_value = "1")]
    node_id: u64,

    /// Queue name
    #[arg(long, short = 'q', default_value = "default")]
    queue: String,

    /// Number of workers in the pool
    #[arg(long, short = 'w', default_value = "4")]
    workers: usize,

    /// Number of queue-owner replicas
    #[arg(long, default_value = "1")]
    replicas: usize,

    /// Dispatch strategy
    #[arg(long, default_value = "lru")]
    strategy: StrategyArg,

    /// Retry failed jobs this many times before abandoning them
    #[arg(long, default_value = "0")]
    retries: u32,

    /// Base delay for exponential retry backoff (0 = retry immediately)
    #[arg(long, default_value = "0")]
    backoff_ms: u64,

    /// Log every successful job
    #[arg(long)]
    log_success: bool,

    /// Time a busy worker gets to finish on shutdown
    #[arg(long, default_value = "10000")]
    grace_ms: u64,
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[command(flatten)]
    queue: QueueArgs,

    /// Function to run: echo, square, sleep or fail
    #[arg(long, short = 'f', default_value = "square")]
    function: String,

    /// Number of jobs to submit
    #[arg(long, short = 'n', default_value = "10")]
    jobs: usize,

    /// Seconds to wait for each result
    #[arg(long, default_value = "30")]
    timeout_secs: u64,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Parser, Debug)]
struct ServeArgs {
    #[command(flatten)]
    queue: QueueArgs,

    /// How often to print the queue status
    #[arg(long, default_value = "5000")]
    status_interval_ms: u64,
}

#[derive(Debug, Clone, ValueEnum)]
enum StrategyArg {
    Lru,
    LruNode,
    Mru,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobOutput {
    job_id: String,
    function: String,
    status: String,
    result: Option<Value>,
    error: Option<String>,
}

#[derive(Serialize)]
struct RunOutput {
    queue: String,
    jobs: Vec<JobOutput>,
    succeeded: usize,
    failed: usize,
    timed_out: usize,
}

// =============================================================================
// Demo handler
// =============================================================================

/// Built-in task functions for the demo node
struct DemoHandler;

#[async_trait]
impl TaskHandler for DemoHandler {
    type State = ();

    async fn init(&self, _args: &[Value]) -> Result<(), String> {
        Ok(())
    }

    async fn run(&self, _state: &(), task: &Task) -> Result<Value, Value> {
        let arg = task.args.first().cloned().unwrap_or(Value::Null);
        match task.function.as_str() {
            "echo" => Ok(arg),
            "square" => {
                let n = arg.as_i64().ok_or_else(|| json!("square expects an integer"))?;
                Ok(json!(n * n))
            }
            "sleep" => {
                let ms = arg.as_u64().unwrap_or(100);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!(ms))
            }
            "fail" => Err(json!("requested failure")),
            other => Err(json!(format!("unknown function {}", other))),
        }
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn failure_hook(args: &QueueArgs) -> FailureHookSpec {
    match (args.retries, args.backoff_ms) {
        (0, _) => FailureHookSpec::Abandon,
        (times, 0) => FailureHookSpec::retry(times),
        (times, base_ms) => FailureHookSpec::ExponentialRetry {
            times,
            base_ms,
            finally: Box::new(FailureHookSpec::Abandon),
        },
    }
}

async fn start_node(args: &QueueArgs) -> Result<(Node, QueueName), Box<dyn std::error::Error>> {
    let queue = QueueName::local(args.queue.clone());
    let strategy = match args.strategy {
        StrategyArg::Lru => StrategySpec::Lru,
        StrategyArg::LruNode => StrategySpec::LruNode,
        StrategyArg::Mru => StrategySpec::Mru,
    };
    let success_hook = if args.log_success {
        SuccessHookSpec::Log
    } else {
        SuccessHookSpec::Noop
    };

    let mut node = Node::standalone(NodeConfig::new(args.node_id))?;
    node.start_queue(
        QueueConfig::new(queue.clone())
            .with_strategy(strategy)
            .with_failure_hook(failure_hook(args))
            .with_success_hook(success_hook)
            .with_replicas(args.replicas),
    )
    .await?;
    node.start_workers(
        PoolConfig::new(queue.clone())
            .with_workers(args.workers)
            .with_shutdown_grace_ms(args.grace_ms),
        Arc::new(DemoHandler),
    )?;

    tracing::info!(
        node_id = args.node_id,
        queue = %queue,
        workers = args.workers,
        replicas = args.replicas,
        "Node ready"
    );
    Ok((node, queue))
}

fn job_output(job_id: String, function: &str, result: Option<JobResult>) -> JobOutput {
    let (status, result, error) = match result {
        Some(Ok(value)) => ("SUCCEEDED", Some(value), None),
        Some(Err(Failure::Error(value))) => ("FAILED", None, Some(value.to_string())),
        Some(Err(Failure::Crashed(reason))) => ("CRASHED", None, Some(reason)),
        None => ("TIMED OUT", None, None),
    };
    JobOutput {
        job_id,
        function: function.to_string(),
        status: status.to_string(),
        result,
        error,
    }
}

fn print_table(output: &RunOutput) {
    println!("{:<38} {:<10} {:<10} RESULT", "JOB ID", "FUNCTION", "STATUS");
    println!("{}", "-".repeat(78));
    for job in &output.jobs {
        let shown = match (&job.result, &job.error) {
            (Some(value), _) => value.to_string(),
            (None, Some(error)) => error.clone(),
            (None, None) => "-".to_string(),
        };
        println!(
            "{:<38} {:<10} {:<10} {}",
            job.job_id, job.function, job.status, shown
        );
    }
    println!();
    println!(
        "Queue {}: {} succeeded, {} failed, {} timed out",
        output.queue, output.succeeded, output.failed, output.timed_out
    );
}

async fn print_status(client: &Client, queue: &QueueName) {
    match client.status(queue).await {
        Ok(status) => {
            let running = status
                .workers
                .iter()
                .filter(|w| matches!(w.activity, WorkerActivity::Running { .. }))
                .count();
            println!(
                "queue={} owners={} pending={} in_flight={} workers={} running={}",
                queue,
                status.queues.len(),
                status.pending(),
                status.in_flight(),
                status.workers.len(),
                running
            );
        }
        Err(e) => eprintln!("Error: status failed: {}", e),
    }
}

// =============================================================================
// Commands
// =============================================================================

async fn run_batch(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let (node, queue) = start_node(&args.queue).await?;
    let client = node.client().await;

    let mut jobs = Vec::with_capacity(args.jobs);
    for i in 0..args.jobs {
        let task = Task::new(args.function.clone(), vec![json!(i)]);
        jobs.push(client.submit(task, &queue, true).await?);
    }

    let timeout = Duration::from_secs(args.timeout_secs);
    let mut outputs = Vec::with_capacity(jobs.len());
    for job in &jobs {
        let result = client.await_result(job, timeout).await?;
        outputs.push(job_output(job.id.to_string(), &job.task.function, result));
    }

    let count = |status: &str| outputs.iter().filter(|o| o.status == status).count();
    let output = RunOutput {
        queue: queue.to_string(),
        succeeded: count("SUCCEEDED"),
        failed: count("FAILED") + count("CRASHED"),
        timed_out: count("TIMED OUT"),
        jobs: outputs,
    };

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
        OutputFormat::Table => print_table(&output),
    }

    client.close().await;
    node.shutdown().await;
    Ok(())
}

async fn serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = install_shutdown_handler();
    let (node, queue) = start_node(&args.queue).await?;
    let client = node.client().await;

    let mut interval = tokio::time::interval(Duration::from_millis(args.status_interval_ms.max(1)));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => print_status(&client, &queue).await,
        }
    }

    client.close().await;
    node.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Run(run_args) => run_batch(run_args).await?,
        Commands::Serve(serve_args) => serve(serve_args).await?,
    }
    Ok(())
}
