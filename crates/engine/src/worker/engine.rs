//! Task engine lifecycle
//!
//! Owns one engine run at a time: the dispatch queue, the fetcher, the worker
//! pool and the shared cancellation token.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::config::EngineConfig;
use super::fetcher::{Fetcher, FetcherConfig};
use super::queue::DispatchQueue;
use super::runner::{RetryTimers, Worker, WorkerContext};
use crate::handler::HandlerRegistry;
use crate::persistence::{StoreError, TaskStore};
use crate::stats::EngineStats;
use crate::task::{NewTask, Task};

/// Engine lifecycle state
///
/// ```text
/// Stopped ──► Starting ──► Running ──► Stopping ──► Stopped
///                │
///                └──────── (startup error) ──────► Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Engine errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// `start` called while not stopped
    #[error("task engine is already running")]
    AlreadyRunning,

    /// `stop` called while not running
    #[error("task engine is not running")]
    NotRunning,

    /// Workers did not finish within the shutdown timeout and were aborted
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,

    /// Configuration rejected at startup
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Resources of one started engine
struct EngineRun {
    shutdown: CancellationToken,
    queue: Arc<DispatchQueue>,
    handles: Vec<JoinHandle<()>>,
    retry_timers: RetryTimers,
}

/// Store-backed task dispatch engine
///
/// # Example
///
/// ```ignore
/// use taskpool_engine::prelude::*;
///
/// let store = Arc::new(PostgresTaskStore::new(pool));
/// let registry = HandlerRegistry::with_builtin_handlers(Duration::from_secs(1));
/// let engine = TaskEngine::new(store, registry, EngineConfig::default());
///
/// engine.start().await?;
/// engine.submit(NewTask::new("email", json!({"email": "a@b.com"}))).await?;
///
/// // ... later, graceful shutdown
/// engine.stop().await?;
/// ```
pub struct TaskEngine {
    store: Arc<dyn TaskStore>,
    registry: Arc<HandlerRegistry>,
    config: EngineConfig,
    state: RwLock<EngineState>,
    nudge: Arc<Notify>,
    live_workers: Arc<AtomicUsize>,
    run: Mutex<Option<EngineRun>>,
}

impl TaskEngine {
    /// Create a stopped engine
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: HandlerRegistry,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            config,
            state: RwLock::new(EngineState::Stopped),
            nudge: Arc::new(Notify::new()),
            live_workers: Arc::new(AtomicUsize::new(0)),
            run: Mutex::new(None),
        }
    }

    /// Start the fetcher and the worker pool
    ///
    /// Fails without starting anything if the configuration is invalid or the
    /// store is unreachable. Tasks left processing by a previous run are put
    /// back to pending first when reconciliation is enabled.
    #[instrument(skip(self), fields(pool_size = self.config.pool_size))]
    pub async fn start(&self) -> Result<(), EngineError> {
        {
            let mut state = self.state.write();
            if *state != EngineState::Stopped {
                return Err(EngineError::AlreadyRunning);
            }
            *state = EngineState::Starting;
        }

        match self.launch().await {
            Ok(run) => {
                *self.run.lock() = Some(run);
                *self.state.write() = EngineState::Running;
                info!(
                    pool_size = self.config.pool_size,
                    queue_capacity = self.config.queue_capacity(),
                    max_retries = self.config.retry.max_retries,
                    "Task engine started"
                );
                Ok(())
            }
            Err(e) => {
                *self.state.write() = EngineState::Stopped;
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<EngineRun, EngineError> {
        self.config
            .validate()
            .map_err(EngineError::InvalidConfig)?;

        self.store.ping().await?;

        if self.config.reconcile_on_start {
            let requeued = self
                .store
                .requeue_stale(self.config.stale_threshold)
                .await?;
            if !requeued.is_empty() {
                warn!(count = requeued.len(), "Requeued tasks left in flight by a previous run");
            }
        }

        let shutdown = CancellationToken::new();
        let queue = Arc::new(DispatchQueue::bounded(self.config.queue_capacity()));
        let retry_timers = RetryTimers::new();

        let mut handles = Vec::with_capacity(self.config.pool_size + 1);

        let fetcher = Fetcher::new(
            Arc::clone(&self.store),
            Arc::clone(&queue),
            FetcherConfig {
                poll_interval: self.config.poll_interval,
                error_backoff: self.config.error_backoff(),
                batch_size: self.config.fetch_batch_size(),
            },
            Arc::clone(&self.nudge),
            shutdown.clone(),
        );
        handles.push(tokio::spawn(fetcher.run()));

        let ctx = Arc::new(WorkerContext {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            queue: Arc::clone(&queue),
            retry: self.config.retry.clone(),
            dequeue_timeout: self.config.dequeue_timeout,
            execution_timeout: self.config.execution_timeout,
            store_backoff: self.config.error_backoff(),
            shutdown: shutdown.clone(),
            retry_timers: retry_timers.clone(),
            live_workers: Arc::clone(&self.live_workers),
        });
        for id in 0..self.config.pool_size {
            handles.push(tokio::spawn(Worker::new(id, Arc::clone(&ctx)).run()));
        }

        Ok(EngineRun {
            shutdown,
            queue,
            handles,
            retry_timers,
        })
    }

    /// Stop the engine
    ///
    /// No task is claimed after this is called. Handlers and retry timers
    /// already running get until the shutdown timeout to finish; anything
    /// still running then is aborted and its task stays processing or
    /// retrying until the next start reconciles it.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), EngineError> {
        {
            let mut state = self.state.write();
            if *state != EngineState::Running {
                return Err(EngineError::NotRunning);
            }
            *state = EngineState::Stopping;
        }

        let Some(run) = self.run.lock().take() else {
            *self.state.write() = EngineState::Stopped;
            return Err(EngineError::NotRunning);
        };

        info!("Initiating graceful shutdown");

        let EngineRun {
            shutdown,
            queue,
            handles,
            retry_timers,
        } = run;

        shutdown.cancel();
        queue.close();
        retry_timers.close();

        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let timers = retry_timers.clone();
        let drained = tokio::time::timeout(self.config.shutdown_timeout, async move {
            futures::future::join_all(handles).await;
            timers.wait().await;
        })
        .await;

        let result = match drained {
            Ok(()) => {
                debug!("All workers exited");
                Ok(())
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
                    live_workers = self.live_workers.load(Ordering::SeqCst),
                    "Shutdown timeout reached, aborting workers"
                );
                for handle in &aborts {
                    handle.abort();
                }
                retry_timers.abort_all();
                Err(EngineError::ShutdownTimeout)
            }
        };

        *self.state.write() = EngineState::Stopped;
        info!("Task engine stopped");
        result
    }

    /// Wake the fetcher ahead of its next poll
    pub fn notify_new_task(&self) {
        self.nudge.notify_one();
    }

    /// Create a task and wake the fetcher
    #[instrument(skip(self, task), fields(task_type = %task.task_type))]
    pub async fn submit(&self, task: NewTask) -> Result<Task, EngineError> {
        let task = self.store.create_task(task).await?;
        debug!(task_id = %task.id, "Task submitted");
        self.notify_new_task();
        Ok(task)
    }

    /// Current lifecycle state
    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    /// Snapshot of engine and task counters
    pub async fn stats(&self) -> Result<EngineStats, EngineError> {
        let tasks = self.store.count_by_status().await?;

        let (queue_depth, queue_capacity) = match self.run.lock().as_ref() {
            Some(run) => (run.queue.len(), run.queue.capacity()),
            None => (0, None),
        };

        Ok(EngineStats {
            state: self.state(),
            pool_size: self.config.pool_size,
            live_workers: self.live_workers.load(Ordering::SeqCst),
            queue_depth,
            queue_capacity,
            tasks,
        })
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl Drop for TaskEngine {
    fn drop(&mut self) {
        if let Some(run) = self.run.get_mut().take() {
            run.shutdown.cancel();
            run.queue.close();
            run.retry_timers.abort_all();
        }
    }
}

impl std::fmt::Debug for TaskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskEngine")
            .field("state", &self.state())
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish()
    }
}
