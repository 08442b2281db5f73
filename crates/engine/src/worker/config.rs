//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::reliability::RetryPolicy;

/// Engine configuration
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use taskpool_engine::{EngineConfig, RetryPolicy};
///
/// let config = EngineConfig::default()
///     .with_pool_size(4)
///     .with_retry(RetryPolicy::fixed(Duration::from_secs(2), 5))
///     .with_poll_interval(Duration::from_millis(500));
///
/// assert_eq!(config.fetch_batch_size(), 8);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Number of concurrent workers
    pub pool_size: usize,

    /// Retry policy applied when a handler fails
    pub retry: RetryPolicy,

    /// Interval between fetcher polls
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Fetcher sleep after a store error (`None` = 5 × poll interval)
    #[serde(default, with = "option_duration_millis")]
    pub error_backoff: Option<Duration>,

    /// Pending tasks fetched per poll (`None` = 2 × pool size)
    #[serde(default)]
    pub fetch_batch_size: Option<usize>,

    /// Dispatch queue capacity (`None` = 4 × pool size)
    #[serde(default)]
    pub queue_capacity: Option<usize>,

    /// How long an idle worker waits on the queue before re-checking shutdown
    #[serde(with = "duration_millis")]
    pub dequeue_timeout: Duration,

    /// Upper bound on a single handler run (`None` = unbounded)
    #[serde(default, with = "option_duration_millis")]
    pub execution_timeout: Option<Duration>,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// Requeue stale processing tasks when the engine starts
    pub reconcile_on_start: bool,

    /// Age after which a processing task counts as stale at startup
    #[serde(with = "duration_millis")]
    pub stale_threshold: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_secs(1),
            error_backoff: None,
            fetch_batch_size: None,
            queue_capacity: None,
            dequeue_timeout: Duration::from_secs(5),
            execution_timeout: None,
            shutdown_timeout: Duration::from_secs(30),
            reconcile_on_start: true,
            // One engine per store: anything still processing at boot is orphaned
            stale_threshold: Duration::ZERO,
        }
    }
}

impl EngineConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker count
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the maximum number of failed attempts
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    /// Set a fixed retry delay
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry = RetryPolicy::fixed(delay, self.retry.max_retries);
        self
    }

    /// Set the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the fetcher error backoff
    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = Some(backoff);
        self
    }

    /// Set the fetch batch size
    pub fn with_fetch_batch_size(mut self, size: usize) -> Self {
        self.fetch_batch_size = Some(size.max(1));
        self
    }

    /// Set the dispatch queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity.max(1));
        self
    }

    /// Set the idle dequeue timeout
    pub fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    /// Bound each handler run
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Enable or disable the startup sweep of stale processing tasks
    pub fn with_reconcile_on_start(mut self, enabled: bool) -> Self {
        self.reconcile_on_start = enabled;
        self
    }

    /// Set the staleness threshold for the startup sweep
    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    /// Effective fetcher error backoff
    pub fn error_backoff(&self) -> Duration {
        self.error_backoff.unwrap_or(self.poll_interval * 5)
    }

    /// Effective fetch batch size
    pub fn fetch_batch_size(&self) -> usize {
        self.fetch_batch_size.unwrap_or(self.pool_size * 2)
    }

    /// Effective dispatch queue capacity
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity.unwrap_or(self.pool_size * 4)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.pool_size == 0 {
            return Err("pool_size must be at least 1".into());
        }
        if self.fetch_batch_size == Some(0) {
            return Err("fetch_batch_size must be at least 1".into());
        }
        if self.queue_capacity == Some(0) {
            return Err("queue_capacity must be at least 1".into());
        }
        if self.poll_interval.is_zero() {
            return Err("poll_interval must be positive".into());
        }
        if self.dequeue_timeout.is_zero() {
            return Err("dequeue_timeout must be positive".into());
        }
        Ok(())
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
