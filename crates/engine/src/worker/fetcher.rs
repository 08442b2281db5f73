//! Periodic discovery of pending tasks
//!
//! Bridges the durable backlog to the dispatch queue. The store is the source
//! of truth; the submission hint only shortens the wait before the next poll.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, trace};

use super::queue::DispatchQueue;
use crate::persistence::TaskStore;

/// Fetcher timing and batch configuration
#[derive(Debug, Clone, PartialEq)]
pub struct FetcherConfig {
    /// Interval between polls
    pub poll_interval: Duration,

    /// Sleep after a failed poll
    pub error_backoff: Duration,

    /// Maximum pending tasks read per poll
    pub batch_size: usize,
}

/// Outcome of waiting between polls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Elapsed,
    Nudged,
    Shutdown,
}

/// Polls the store for pending tasks and queues their IDs
pub struct Fetcher {
    store: Arc<dyn TaskStore>,
    queue: Arc<DispatchQueue>,
    config: FetcherConfig,
    nudge: Arc<Notify>,
    shutdown: CancellationToken,
}

impl Fetcher {
    /// Create a new fetcher
    pub fn new(
        store: Arc<dyn TaskStore>,
        queue: Arc<DispatchQueue>,
        config: FetcherConfig,
        nudge: Arc<Notify>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            queue,
            config,
            nudge,
            shutdown,
        }
    }

    /// Run until cancelled
    ///
    /// Store errors are logged and followed by the error backoff; they never
    /// end the loop.
    pub async fn run(self) {
        debug!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Fetcher started"
        );

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let wait = match self.poll_once().await {
                Ok(_) => self.config.poll_interval,
                Err(FetchError::QueueClosed) => break,
                Err(FetchError::Store(e)) => {
                    error!(
                        backoff_ms = self.config.error_backoff.as_millis() as u64,
                        "Error fetching pending tasks: {}", e
                    );
                    self.config.error_backoff
                }
            };

            match self.wait(wait).await {
                Wake::Shutdown => break,
                Wake::Nudged => trace!("Fetcher nudged by new task"),
                Wake::Elapsed => {}
            }
        }

        debug!("Fetcher exited");
    }

    /// Read one batch of pending tasks and queue their IDs
    ///
    /// Blocks while the queue is full. Returns the number of IDs queued.
    #[instrument(skip(self))]
    pub async fn poll_once(&self) -> Result<usize, FetchError> {
        let tasks = self.store.list_pending(self.config.batch_size).await?;

        let mut queued = 0;
        for task in tasks {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(queued),
                pushed = self.queue.push(task.id) => {
                    pushed.map_err(|_| FetchError::QueueClosed)?;
                    queued += 1;
                }
            }
        }

        if queued > 0 {
            debug!(count = queued, "Queued pending tasks");
        }
        Ok(queued)
    }

    async fn wait(&self, duration: Duration) -> Wake {
        tokio::select! {
            _ = self.shutdown.cancelled() => Wake::Shutdown,
            _ = self.nudge.notified() => Wake::Nudged,
            _ = tokio::time::sleep(duration) => Wake::Elapsed,
        }
    }
}

/// Fetcher errors
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] crate::persistence::StoreError),

    /// Dispatch queue closed by shutdown
    #[error("dispatch queue is closed")]
    QueueClosed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryTaskStore;
    use crate::task::NewTask;
    use serde_json::json;

    fn config() -> FetcherConfig {
        FetcherConfig {
            poll_interval: Duration::from_millis(20),
            error_backoff: Duration::from_millis(50),
            batch_size: 4,
        }
    }

    fn fetcher(
        store: Arc<InMemoryTaskStore>,
        queue: Arc<DispatchQueue>,
        shutdown: CancellationToken,
    ) -> Fetcher {
        Fetcher::new(store, queue, config(), Arc::new(Notify::new()), shutdown)
    }

    #[tokio::test]
    async fn test_poll_once_respects_batch_size() {
        let store = Arc::new(InMemoryTaskStore::new());
        for _ in 0..6 {
            store
                .create_task(NewTask::new("echo", json!({})))
                .await
                .unwrap();
        }
        let queue = Arc::new(DispatchQueue::bounded(16));
        let fetcher = fetcher(store, Arc::clone(&queue), CancellationToken::new());

        assert_eq!(fetcher.poll_once().await.unwrap(), 4);
        assert_eq!(queue.len(), 4);
    }

    #[tokio::test]
    async fn test_poll_once_propagates_store_errors() {
        let store = Arc::new(InMemoryTaskStore::new());
        store.set_unavailable(true);
        let queue = Arc::new(DispatchQueue::bounded(16));
        let fetcher = fetcher(store, queue, CancellationToken::new());

        assert!(matches!(
            fetcher.poll_once().await,
            Err(FetchError::Store(_))
        ));
    }

    #[tokio::test]
    async fn test_run_survives_store_outage() {
        let store = Arc::new(InMemoryTaskStore::new());
        store.set_unavailable(true);
        let queue = Arc::new(DispatchQueue::bounded(16));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(
            fetcher(Arc::clone(&store), Arc::clone(&queue), shutdown.clone()).run(),
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        store.set_unavailable(false);
        store
            .create_task(NewTask::new("echo", json!({})))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!handle.is_finished());
        assert!(!queue.is_empty());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_stops_while_blocked_on_full_queue() {
        let store = Arc::new(InMemoryTaskStore::new());
        for _ in 0..3 {
            store
                .create_task(NewTask::new("echo", json!({})))
                .await
                .unwrap();
        }
        let queue = Arc::new(DispatchQueue::bounded(1));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(fetcher(store, Arc::clone(&queue), shutdown.clone()).run());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(queue.len(), 1);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("fetcher did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_nudge_triggers_early_poll() {
        let store = Arc::new(InMemoryTaskStore::new());
        let queue = Arc::new(DispatchQueue::bounded(16));
        let shutdown = CancellationToken::new();
        let nudge = Arc::new(Notify::new());
        let slow = FetcherConfig {
            poll_interval: Duration::from_secs(60),
            ..config()
        };
        let fetcher = Fetcher::new(
            Arc::clone(&store) as Arc<dyn TaskStore>,
            Arc::clone(&queue),
            slow,
            Arc::clone(&nudge),
            shutdown.clone(),
        );
        let handle = tokio::spawn(fetcher.run());

        // Let the first (empty) poll happen
        tokio::time::sleep(Duration::from_millis(20)).await;
        store
            .create_task(NewTask::new("echo", json!({})))
            .await
            .unwrap();
        nudge.notify_one();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.len(), 1);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
