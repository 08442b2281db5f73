//! Persistence layer for tasks
//!
//! This module provides:
//! - [`TaskStore`] trait for task persistence and atomic status transitions
//! - [`InMemoryTaskStore`] for testing
//! - [`PostgresTaskStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryTaskStore;
pub use postgres::PostgresTaskStore;
pub use store::{StatusCounts, StoreError, TaskFilter, TaskStore};
