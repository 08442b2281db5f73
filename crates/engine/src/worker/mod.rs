//! Task dispatch: fetcher, dispatch queue, worker pool and lifecycle
//!
//! This module provides:
//! - [`TaskEngine`] - Start/stop of one engine run, submission and stats
//! - [`EngineConfig`] - Pool size, retry policy, polling and shutdown settings
//! - [`DispatchQueue`] - Bounded FIFO of task IDs with backpressure
//! - [`Fetcher`] - Periodic discovery of pending tasks
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TaskEngine                            │
//! │  ┌─────────────┐    ┌─────────────────┐    ┌─────────────┐  │
//! │  │   Fetcher   │───►│  DispatchQueue  │───►│  Worker 1   │  │
//! │  │  (polling)  │    │  (bounded FIFO) │    │  Worker 2   │  │
//! │  └──────┬──────┘    └────────▲────────┘    │  ...        │  │
//! │         │                    │             │  Worker N   │  │
//! │         │           ┌────────┴────────┐    └──────┬──────┘  │
//! │         │           │  Retry timers   │◄──────────┘         │
//! │         │           └─────────────────┘                     │
//! └─────────┼───────────────────────────────────────────────────┘
//!           ▼
//!      TaskStore (list_pending / claim_task / update_task)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use taskpool_engine::worker::{EngineConfig, TaskEngine};
//!
//! let config = EngineConfig::default()
//!     .with_pool_size(20)
//!     .with_max_retries(5);
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register_fn("process_order", |task| async move {
//!     let order: Order = serde_json::from_value(task.payload)?;
//!     // Process the order...
//!     Ok(json!({"status": "completed"}))
//! });
//!
//! let engine = TaskEngine::new(store, registry, config);
//! engine.start().await?;
//!
//! // Graceful shutdown
//! engine.stop().await?;
//! ```

mod config;
mod engine;
mod fetcher;
mod queue;
mod runner;

pub use config::EngineConfig;
pub use engine::{EngineError, EngineState, TaskEngine};
pub use fetcher::{FetchError, Fetcher, FetcherConfig};
pub use queue::{DispatchQueue, QueueClosed};
