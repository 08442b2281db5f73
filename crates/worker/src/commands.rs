// Subcommand implementations

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, ValueEnum};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use taskpool_engine::persistence::{PostgresTaskStore, StoreError, TaskFilter, TaskStore};
use taskpool_engine::task::{NewTask, Task, TaskStatus};
use taskpool_engine::{EngineConfig, EngineError, HandlerRegistry, RetryPolicy, TaskEngine};

/// Output format for admin commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Engine options for `run`
#[derive(Debug, Clone, Args)]
pub struct EngineArgs {
    /// Number of concurrent workers
    #[arg(long, env = "WORKER_POOL_SIZE", default_value_t = 10)]
    pub pool_size: usize,

    /// Failed attempts after which a task is marked failed
    #[arg(long, env = "MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    /// Delay before a failed task is retried, in seconds
    #[arg(long, env = "RETRY_DELAY_SECS", default_value_t = 5)]
    pub retry_delay_secs: u64,

    /// Grow the retry delay exponentially (with jitter) instead of keeping it fixed
    #[arg(long, env = "RETRY_EXPONENTIAL")]
    pub exponential_backoff: bool,

    /// Interval between polls for pending tasks, in milliseconds
    #[arg(long, env = "POLL_INTERVAL_MS", default_value_t = 1000)]
    pub poll_interval_ms: u64,

    /// Pending tasks fetched per poll (default: 2 x pool size)
    #[arg(long, env = "FETCH_BATCH_SIZE")]
    pub fetch_batch_size: Option<usize>,

    /// Dispatch queue capacity (default: 4 x pool size)
    #[arg(long, env = "QUEUE_CAPACITY")]
    pub queue_capacity: Option<usize>,

    /// Upper bound on a single handler run, in seconds
    #[arg(long, env = "EXECUTION_TIMEOUT_SECS")]
    pub execution_timeout_secs: Option<u64>,

    /// How long `stop` waits for running handlers, in seconds
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 30)]
    pub shutdown_timeout_secs: u64,

    /// Simulated latency of the built-in handlers, in milliseconds
    #[arg(long, env = "HANDLER_LATENCY_MS", default_value_t = 100)]
    pub handler_latency_ms: u64,

    /// Interval between statistics log lines, in seconds (0 disables)
    #[arg(long, env = "STATS_INTERVAL_SECS", default_value_t = 30)]
    pub stats_interval_secs: u64,
}

impl EngineArgs {
    pub fn engine_config(&self) -> EngineConfig {
        let delay = Duration::from_secs(self.retry_delay_secs);
        let retry = if self.exponential_backoff {
            RetryPolicy::exponential()
                .with_initial_interval(delay)
                .with_max_retries(self.max_retries)
        } else {
            RetryPolicy::fixed(delay, self.max_retries)
        };

        let mut config = EngineConfig::new()
            .with_pool_size(self.pool_size)
            .with_retry(retry)
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_shutdown_timeout(Duration::from_secs(self.shutdown_timeout_secs));

        if let Some(size) = self.fetch_batch_size {
            config = config.with_fetch_batch_size(size);
        }
        if let Some(capacity) = self.queue_capacity {
            config = config.with_queue_capacity(capacity);
        }
        if let Some(secs) = self.execution_timeout_secs {
            config = config.with_execution_timeout(Duration::from_secs(secs));
        }
        config
    }
}

/// Run the engine until Ctrl-C
pub async fn run(store: Arc<PostgresTaskStore>, args: EngineArgs) -> Result<()> {
    let registry =
        HandlerRegistry::with_builtin_handlers(Duration::from_millis(args.handler_latency_ms));
    let engine = TaskEngine::new(store, registry, args.engine_config());

    engine.start().await.context("Failed to start task engine")?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    if args.stats_interval_secs == 0 {
        shutdown.await.context("Failed to listen for shutdown signal")?;
    } else {
        let mut ticker = tokio::time::interval(Duration::from_secs(args.stats_interval_secs));
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => match engine.stats().await {
                    Ok(stats) => info!(%stats, "Engine stats"),
                    Err(e) => warn!(error = %e, "Failed to read engine stats"),
                },
                signal = &mut shutdown => {
                    signal.context("Failed to listen for shutdown signal")?;
                    break;
                }
            }
        }
    }

    info!("Received shutdown signal");
    match engine.stop().await {
        Ok(()) => Ok(()),
        Err(EngineError::ShutdownTimeout) => {
            warn!("Some tasks were still running and will be requeued on next start");
            Ok(())
        }
        Err(e) => Err(e).context("Failed to stop task engine"),
    }
}

pub async fn submit(
    store: &dyn TaskStore,
    task_type: String,
    payload: &str,
    format: OutputFormat,
) -> Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("Payload is not valid JSON")?;
    let task = store.create_task(NewTask::new(task_type, payload)).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&task)?),
        OutputFormat::Text => println!("Submitted task {} ({})", task.id, task.task_type),
    }
    Ok(())
}

pub async fn get(store: &dyn TaskStore, id: Uuid, format: OutputFormat) -> Result<()> {
    let Some(task) = store.get_task(id).await? else {
        bail!("Task not found: {}", id);
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&task_outcome(&task))?),
        OutputFormat::Text => print_task(&task),
    }
    Ok(())
}

pub async fn list(
    store: &dyn TaskStore,
    status: Option<TaskStatus>,
    limit: usize,
    format: OutputFormat,
) -> Result<()> {
    let filter = TaskFilter {
        status,
        limit,
    };
    let tasks = store.list_tasks(filter).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&tasks)?),
        OutputFormat::Text => {
            if tasks.is_empty() {
                println!("No tasks found.");
            }
            for task in &tasks {
                println!(
                    "{}  {:<10}  {:<20}  retries={}  {}",
                    task.id,
                    task.status.as_str(),
                    task.task_type,
                    task.retry_count,
                    task.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
    }
    Ok(())
}

pub async fn delete(store: &dyn TaskStore, id: Uuid) -> Result<()> {
    match store.delete_task(id).await {
        Ok(()) => {
            println!("Deleted task {}", id);
            Ok(())
        }
        Err(StoreError::InvalidState { status, .. }) => {
            bail!("Cannot delete task {} while it is {}", id, status)
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn stats(store: &dyn TaskStore, format: OutputFormat) -> Result<()> {
    let counts = store.count_by_status().await?;

    match format {
        OutputFormat::Json => {
            let breakdown: serde_json::Map<_, _> = counts
                .iter()
                .map(|(status, count)| (status.as_str().to_string(), json!(count)))
                .collect();
            let body = json!({
                "status_breakdown": breakdown,
                "total": counts.total(),
                "success_rate_percent": counts.success_rate(),
            });
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        OutputFormat::Text => {
            for (status, count) in counts.iter() {
                println!("{:<12}{}", status.as_str(), count);
            }
            println!("{:<12}{}", "total", counts.total());
            if let Some(rate) = counts.success_rate() {
                println!("{:<12}{:.1}%", "success", rate);
            }
        }
    }
    Ok(())
}

/// What a client needs to know about a task, depending on where it is
fn task_outcome(task: &Task) -> serde_json::Value {
    match task.status {
        TaskStatus::Pending | TaskStatus::Processing | TaskStatus::Retrying => json!({
            "status": task.status,
            "message": "Task is still processing",
            "retry_count": task.retry_count,
        }),
        TaskStatus::Failed => json!({
            "status": task.status,
            "error": task.error_message,
            "retry_count": task.retry_count,
        }),
        TaskStatus::Completed => json!({
            "status": task.status,
            "result": task.result,
            "completed_at": task.completed_at,
        }),
    }
}

fn print_task(task: &Task) {
    println!("ID:          {}", task.id);
    println!("Type:        {}", task.task_type);
    println!("Status:      {}", task.status);
    println!("Retries:     {}", task.retry_count);
    println!("Created:     {}", task.created_at);
    if let Some(completed_at) = task.completed_at {
        println!("Completed:   {}", completed_at);
    }
    if let Some(error) = &task.error_message {
        println!("Error:       {}", error);
    }
    if let Some(result) = &task.result {
        println!("Result:      {}", result);
    }
}
