//! TaskStore trait definition

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::{NewTask, Task, TaskStatus, TaskUpdate};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// Operation not allowed in the task's current status
    #[error("task {id} is {status}, operation not allowed")]
    InvalidState { id: Uuid, status: TaskStatus },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Filter for listing tasks
#[derive(Debug, Clone)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub limit: usize,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            status: None,
            limit: 100,
        }
    }
}

impl TaskFilter {
    pub fn with_status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// Task counts keyed by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts(HashMap<TaskStatus, u64>);

impl StatusCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count for one status (zero if absent)
    pub fn get(&self, status: TaskStatus) -> u64 {
        self.0.get(&status).copied().unwrap_or(0)
    }

    pub fn set(&mut self, status: TaskStatus, count: u64) {
        self.0.insert(status, count);
    }

    pub fn increment(&mut self, status: TaskStatus) {
        *self.0.entry(status).or_insert(0) += 1;
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    /// Percentage of finished tasks that completed, `None` if nothing finished yet
    pub fn success_rate(&self) -> Option<f64> {
        let completed = self.get(TaskStatus::Completed);
        let finished = completed + self.get(TaskStatus::Failed);
        if finished == 0 {
            return None;
        }
        Some(completed as f64 / finished as f64 * 100.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (TaskStatus, u64)> + '_ {
        TaskStatus::ALL.into_iter().map(|s| (s, self.get(s)))
    }
}

/// Durable record of tasks and their status
///
/// Implementations must be thread-safe and serialize conflicting writes to
/// the same task: [`TaskStore::update_task_if`] is the only primitive the
/// engine relies on for exclusive ownership.
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    /// Persist a new task in status pending
    async fn create_task(&self, task: NewTask) -> Result<Task, StoreError>;

    /// Load a task, `None` if it does not exist
    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, StoreError>;

    /// Up to `limit` pending tasks, oldest first
    async fn list_pending(&self, limit: usize) -> Result<Vec<Task>, StoreError>;

    /// Unconditionally write a transition
    async fn update_task(&self, task_id: Uuid, update: TaskUpdate) -> Result<(), StoreError>;

    /// Write a transition only if the task is currently in `expected`
    ///
    /// Returns `true` iff the write applied. Two racing callers with the same
    /// `expected` status observe exactly one `true`.
    async fn update_task_if(
        &self,
        task_id: Uuid,
        expected: TaskStatus,
        update: TaskUpdate,
    ) -> Result<bool, StoreError>;

    /// Atomically move a task from pending to processing
    async fn claim_task(&self, task_id: Uuid) -> Result<bool, StoreError> {
        self.update_task_if(task_id, TaskStatus::Pending, TaskUpdate::processing())
            .await
    }

    /// List tasks, newest first
    async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, StoreError>;

    /// Number of tasks in each status
    async fn count_by_status(&self) -> Result<StatusCounts, StoreError>;

    /// Delete a completed or failed task
    async fn delete_task(&self, task_id: Uuid) -> Result<(), StoreError>;

    /// Move processing and retrying tasks not updated within `stale_threshold`
    /// back to pending
    ///
    /// Run at startup, this recovers tasks orphaned by a previous run: those
    /// whose worker never recorded an outcome and those whose retry timer
    /// never fired.
    async fn requeue_stale(&self, stale_threshold: Duration) -> Result<Vec<Uuid>, StoreError>;

    /// Check that the store is reachable
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
