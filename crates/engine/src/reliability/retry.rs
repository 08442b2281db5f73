//! Retry policy implementation

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// What to do with a task whose attempt just failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Mark retrying, wait `delay`, then requeue
    Retry { retry_count: u32, delay: Duration },

    /// Mark failed for good
    Fail { retry_count: u32 },
}

impl RetryDecision {
    /// Retry count to persist with this decision
    pub fn retry_count(&self) -> u32 {
        match self {
            Self::Retry { retry_count, .. } | Self::Fail { retry_count } => *retry_count,
        }
    }
}

/// Configuration for task retries
///
/// The default is a fixed five second delay with at most three failed
/// attempts. Exponential backoff with jitter is available through
/// [`RetryPolicy::exponential`].
///
/// # Example
///
/// ```
/// use taskpool_engine::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_retries(5)
///     .with_initial_interval(Duration::from_secs(1))
///     .with_max_interval(Duration::from_secs(60));
///
/// // First retry after ~1 second
/// // Second retry after ~2 seconds
/// // Third retry after ~4 seconds
/// // etc.
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Failed attempts after which a task is marked failed
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Maximum delay between retries
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier (1.0 for a fixed delay)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0) to add randomness
    ///
    /// A value of 0.1 means ±10% randomness.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5), 3)
    }
}

impl RetryPolicy {
    /// Create a policy with fixed intervals (no backoff)
    pub fn fixed(delay: Duration, max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_interval: delay,
            max_interval: delay,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Create an exponential backoff retry policy
    ///
    /// - 3 max retries
    /// - 1 second initial interval
    /// - 60 second max interval
    /// - 2x backoff coefficient
    /// - 10% jitter
    pub fn exponential() -> Self {
        Self {
            max_retries: 3,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }

    /// Create a policy that fails a task on its first error
    pub fn no_retry() -> Self {
        Self::fixed(Duration::ZERO, 1)
    }

    /// Set the maximum number of failed attempts
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the initial retry interval
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the maximum retry interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the backoff coefficient
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient.max(1.0);
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Decide the outcome of a failure
    ///
    /// `previous_retry_count` is the task's count before this failure. Every
    /// failure increments it exactly once; the task is retried while the new
    /// count stays below `max_retries`.
    pub fn decide(&self, previous_retry_count: u32) -> RetryDecision {
        let retry_count = previous_retry_count.saturating_add(1);
        if retry_count < self.max_retries {
            RetryDecision::Retry {
                retry_count,
                delay: self.delay_for_retry(retry_count),
            }
        } else {
            RetryDecision::Fail { retry_count }
        }
    }

    /// Calculate the delay before retry number `retry` (1-based)
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_interval.as_secs_f64()
            * self.backoff_coefficient.powi(retry as i32 - 1);
        let capped = base.min(self.max_interval.as_secs_f64());

        // Apply jitter
        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = capped * self.jitter;
            let jitter_offset = rng.gen_range(-jitter_range..jitter_range);
            (capped + jitter_offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
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
