//! Worker loop: dequeue, claim, execute, record the outcome

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::queue::DispatchQueue;
use crate::handler::{HandlerError, HandlerRegistry, HandlerResult, TaskInvocation};
use crate::persistence::{StoreError, TaskStore};
use crate::reliability::{RetryDecision, RetryPolicy};
use crate::task::{Task, TaskStatus, TaskUpdate};

/// State shared by every worker of one engine run
pub(crate) struct WorkerContext {
    pub store: Arc<dyn TaskStore>,
    pub registry: Arc<HandlerRegistry>,
    pub queue: Arc<DispatchQueue>,
    pub retry: RetryPolicy,
    pub dequeue_timeout: Duration,
    pub execution_timeout: Option<Duration>,
    /// Pause between attempts to write a retry requeue that hit a store error
    pub store_backoff: Duration,
    pub shutdown: CancellationToken,
    pub retry_timers: RetryTimers,
    pub live_workers: Arc<AtomicUsize>,
}

/// Delayed requeues spawned by workers
///
/// `stop` waits for them through the tracker and aborts the stragglers when
/// the shutdown timeout expires. Once aborted, newly spawned timers are
/// aborted on arrival.
#[derive(Clone)]
pub(crate) struct RetryTimers {
    tracker: TaskTracker,
    aborts: Arc<Mutex<TimerAborts>>,
}

#[derive(Default)]
struct TimerAborts {
    handles: Vec<AbortHandle>,
    aborted: bool,
}

impl RetryTimers {
    pub fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
            aborts: Arc::new(Mutex::new(TimerAborts::default())),
        }
    }

    fn spawn<F>(&self, timer: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self.tracker.spawn(timer).abort_handle();
        let mut aborts = self.aborts.lock();
        if aborts.aborted {
            handle.abort();
            return;
        }
        aborts.handles.retain(|h| !h.is_finished());
        aborts.handles.push(handle);
    }

    /// Stop counting on new timers for [`RetryTimers::wait`]
    pub fn close(&self) {
        self.tracker.close();
    }

    /// Wait until closed and every timer has exited
    pub async fn wait(&self) {
        self.tracker.wait().await;
    }

    /// Abort every running timer, and any spawned later
    pub fn abort_all(&self) {
        let mut aborts = self.aborts.lock();
        aborts.aborted = true;
        for handle in aborts.handles.drain(..) {
            handle.abort();
        }
    }
}

/// Decrements the live worker count on drop
struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One member of the worker pool
///
/// Counted as live from construction until dropped, so a worker spawned but
/// not yet polled already shows up in the stats.
pub(crate) struct Worker {
    id: usize,
    ctx: Arc<WorkerContext>,
    _live: LiveGuard,
}

impl Worker {
    pub fn new(id: usize, ctx: Arc<WorkerContext>) -> Self {
        let live = LiveGuard::new(&ctx.live_workers);
        Self {
            id,
            ctx,
            _live: live,
        }
    }

    /// Process dispatch entries until shutdown
    ///
    /// Errors outside handler execution are logged and the loop continues
    /// after `store_backoff`, so an outage does not drain the queue.
    pub async fn run(self) {
        debug!(worker = self.id, "Worker started");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.ctx.shutdown.cancelled() => break,
                next = self.ctx.queue.pop_timeout(self.ctx.dequeue_timeout) => next,
            };

            let task_id = match next {
                Ok(Some(task_id)) => task_id,
                Ok(None) => continue,
                Err(_) => break,
            };

            if let Err(e) = self.process(task_id).await {
                error!(worker = self.id, %task_id, "Error processing task: {}", e);
                tokio::select! {
                    biased;
                    _ = self.ctx.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.ctx.store_backoff) => {}
                }
            }
        }

        debug!(worker = self.id, "Worker exited");
    }

    /// Handle a single dispatch entry
    #[instrument(skip(self), fields(worker = self.id))]
    pub async fn process(&self, task_id: Uuid) -> Result<(), StoreError> {
        let Some(task) = self.ctx.store.get_task(task_id).await? else {
            debug!(%task_id, "Discarding entry for missing task");
            return Ok(());
        };

        if task.status != TaskStatus::Pending {
            debug!(%task_id, status = %task.status, "Discarding entry for task that is not pending");
            return Ok(());
        }

        if self.ctx.shutdown.is_cancelled() {
            return Ok(());
        }

        if !self.ctx.store.claim_task(task_id).await? {
            debug!(%task_id, "Task claimed by another worker");
            return Ok(());
        }

        info!(
            %task_id,
            task_type = %task.task_type,
            attempt = task.retry_count + 1,
            "Processing task"
        );

        let invocation = TaskInvocation {
            task_id,
            task_type: task.task_type.clone(),
            payload: task.payload.clone(),
            attempt: task.retry_count + 1,
        };

        match self.execute(&invocation).await {
            Ok(result) => {
                self.record(task_id, TaskUpdate::completed(result)).await?;
                info!(%task_id, "Task completed");
                Ok(())
            }
            Err(e) => self.handle_failure(&task, e).await,
        }
    }

    /// Run the handler, turning timeouts and panics into handler errors
    async fn execute(&self, invocation: &TaskInvocation) -> HandlerResult {
        let run = AssertUnwindSafe(self.ctx.registry.execute(invocation)).catch_unwind();

        let outcome = match self.ctx.execution_timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(HandlerError::new(format!(
                        "execution timed out after {}ms",
                        limit.as_millis()
                    ))
                    .with_type("TIMEOUT"))
                }
            },
            None => run.await,
        };

        outcome.unwrap_or_else(|panic| {
            Err(HandlerError::new(format!("handler panicked: {}", panic_message(&*panic)))
                .with_type("PANIC"))
        })
    }

    async fn handle_failure(&self, task: &Task, error: HandlerError) -> Result<(), StoreError> {
        match self.ctx.retry.decide(task.retry_count) {
            RetryDecision::Retry { retry_count, delay } => {
                warn!(
                    task_id = %task.id,
                    retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Task failed, will retry: {}", error
                );
                self.record(task.id, TaskUpdate::retrying(retry_count, error.message))
                    .await?;
                self.schedule_requeue(task.id, delay);
            }
            RetryDecision::Fail { retry_count } => {
                error!(
                    task_id = %task.id,
                    retry_count,
                    "Task failed permanently: {}", error
                );
                self.record(task.id, TaskUpdate::failed(retry_count, error.message))
                    .await?;
            }
        }
        Ok(())
    }

    /// Write the outcome of a claimed task
    ///
    /// Only this write releases the task, so store errors are retried every
    /// `store_backoff` until it applies. Gives up once the engine is stopping;
    /// the task then stays processing until the next start requeues it.
    async fn record(&self, task_id: Uuid, update: TaskUpdate) -> Result<(), StoreError> {
        loop {
            let err = match self.ctx.store.update_task(task_id, update.clone()).await {
                Ok(()) => return Ok(()),
                Err(e @ StoreError::TaskNotFound(_)) => return Err(e),
                Err(e) => e,
            };

            if self.ctx.shutdown.is_cancelled() {
                return Err(err);
            }
            warn!(
                %task_id,
                status = %update.status(),
                "Failed to record task outcome, retrying: {}", err
            );

            tokio::select! {
                biased;
                _ = self.ctx.shutdown.cancelled() => return Err(err),
                _ = tokio::time::sleep(self.ctx.store_backoff) => {}
            }
        }
    }

    /// Move a retrying task back to pending once `delay` has passed
    ///
    /// Runs detached from the worker so the slot is free during the delay.
    /// On shutdown the task is still reset to pending but not enqueued.
    fn schedule_requeue(&self, task_id: Uuid, delay: Duration) {
        let store = Arc::clone(&self.ctx.store);
        let queue = Arc::clone(&self.ctx.queue);
        let shutdown = self.ctx.shutdown.clone();
        let backoff = self.ctx.store_backoff;

        self.ctx.retry_timers.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }

            loop {
                match store
                    .update_task_if(task_id, TaskStatus::Retrying, TaskUpdate::requeued())
                    .await
                {
                    Ok(true) => break,
                    Ok(false) => {
                        debug!(%task_id, "Task left retrying before its delay elapsed");
                        return;
                    }
                    Err(e) => {
                        error!(%task_id, "Failed to requeue task: {}", e);
                        if shutdown.is_cancelled() {
                            return;
                        }
                        tokio::select! {
                            _ = shutdown.cancelled() => {}
                            _ = tokio::time::sleep(backoff) => {}
                        }
                    }
                }
            }

            if shutdown.is_cancelled() {
                debug!(%task_id, "Task requeued in store only, engine is stopping");
                return;
            }

            if queue.push(task_id).await.is_err() {
                debug!(%task_id, "Dispatch queue closed before requeue");
            }
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
