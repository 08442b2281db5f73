//! Reliability patterns for task execution
//!
//! This module provides:
//! - [`RetryPolicy`] - Configurable retry with fixed or exponential backoff
//! - [`RetryDecision`] - Outcome of a failed attempt

mod retry;

pub use retry::{RetryDecision, RetryPolicy};
