//! # Task Dispatch Engine
//!
//! A store-backed engine that executes submitted tasks on a fixed-size pool of
//! concurrent workers.
//!
//! ## Features
//!
//! - **Durable backlog**: The task store is the source of truth; the in-memory queue only holds hints
//! - **Atomic claiming**: A conditional `pending → processing` write gives each attempt exactly one owner
//! - **Automatic retries**: Fixed delay by default, exponential backoff with jitter on request
//! - **Backpressure**: A bounded dispatch queue throttles fetching to the workers' pace
//! - **Graceful shutdown**: Cooperative cancellation with a bounded wait
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TaskEngine                            │
//! │  (lifecycle, fetcher, dispatch queue, worker pool)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     HandlerRegistry                          │
//! │  (task type → handler, echo fallback)                       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TaskStore                             │
//! │  (PostgreSQL `tasks` table, or in memory for tests)         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use taskpool_engine::prelude::*;
//!
//! let store = Arc::new(InMemoryTaskStore::new());
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register_fn("resize_image", |task| async move {
//!     let url = task.payload["url"]
//!         .as_str()
//!         .ok_or_else(|| HandlerError::invalid_payload("missing url"))?;
//!     Ok(json!({"status": "resized", "url": url}))
//! });
//!
//! let engine = TaskEngine::new(store, registry, EngineConfig::default());
//! engine.start().await?;
//! engine
//!     .submit(NewTask::new("resize_image", json!({"url": "https://example.com/a.png"})))
//!     .await?;
//! ```

pub mod handler;
pub mod persistence;
pub mod reliability;
pub mod stats;
pub mod task;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::handler::{HandlerError, HandlerRegistry, TaskHandler, TaskInvocation};
    pub use crate::persistence::{
        InMemoryTaskStore, PostgresTaskStore, StatusCounts, StoreError, TaskFilter, TaskStore,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::stats::EngineStats;
    pub use crate::task::{NewTask, Task, TaskStatus};
    pub use crate::worker::{EngineConfig, EngineError, EngineState, TaskEngine};
}

// Re-export key types at crate root
pub use handler::{HandlerError, HandlerRegistry, HandlerResult, TaskHandler, TaskInvocation};
pub use persistence::{
    InMemoryTaskStore, PostgresTaskStore, StatusCounts, StoreError, TaskFilter, TaskStore,
};
pub use reliability::{RetryDecision, RetryPolicy};
pub use stats::EngineStats;
pub use task::{NewTask, Task, TaskStatus, TaskUpdate};
pub use worker::{EngineConfig, EngineError, EngineState, TaskEngine};
