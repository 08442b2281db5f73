//! In-memory implementation of TaskStore for testing

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::task::{NewTask, Task, TaskStatus, TaskUpdate};

#[derive(Default)]
struct Inner {
    tasks: HashMap<Uuid, Task>,
    /// Creation order, for oldest-first listing
    order: Vec<Uuid>,
}

/// In-memory implementation of TaskStore
///
/// Every operation takes the single write lock, so conditional updates are
/// atomic with respect to each other. Provides the same semantics as the
/// PostgreSQL implementation.
///
/// # Example
///
/// ```
/// use taskpool_engine::InMemoryTaskStore;
///
/// let store = InMemoryTaskStore::new();
/// assert_eq!(store.task_count(), 0);
/// ```
pub struct InMemoryTaskStore {
    inner: RwLock<Inner>,
    unavailable: AtomicBool,
}

impl InMemoryTaskStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Get the number of tasks
    pub fn task_count(&self) -> usize {
        self.inner.read().tasks.len()
    }

    /// Simulate an outage: every operation fails with a database error
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Insert a task as-is (for testing recovery paths)
    pub fn insert(&self, task: Task) {
        let mut inner = self.inner.write();
        if inner.tasks.insert(task.id, task.clone()).is_none() {
            inner.order.push(task.id);
        }
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.tasks.clear();
        inner.order.clear();
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Database("store unavailable".to_string()));
        }
        Ok(())
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_task(&self, new_task: NewTask) -> Result<Task, StoreError> {
        self.check_available()?;
        let task = Task::new(new_task);
        let mut inner = self.inner.write();
        inner.order.push(task.id);
        inner.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, StoreError> {
        self.check_available()?;
        Ok(self.inner.read().tasks.get(&task_id).cloned())
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<Task>, StoreError> {
        self.check_available()?;
        let inner = self.inner.read();
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.tasks.get(id))
            .filter(|t| t.status == TaskStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update_task(&self, task_id: Uuid, update: TaskUpdate) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.write();
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        task.apply(&update);
        Ok(())
    }

    async fn update_task_if(
        &self,
        task_id: Uuid,
        expected: TaskStatus,
        update: TaskUpdate,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.write();
        match inner.tasks.get_mut(&task_id) {
            Some(task) if task.status == expected => {
                task.apply(&update);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, StoreError> {
        self.check_available()?;
        let inner = self.inner.read();
        Ok(inner
            .order
            .iter()
            .rev()
            .filter_map(|id| inner.tasks.get(id))
            .filter(|t| filter.status.map_or(true, |s| t.status == s))
            .take(filter.limit)
            .cloned()
            .collect())
    }

    async fn count_by_status(&self) -> Result<StatusCounts, StoreError> {
        self.check_available()?;
        let mut counts = StatusCounts::new();
        for task in self.inner.read().tasks.values() {
            counts.increment(task.status);
        }
        Ok(counts)
    }

    async fn delete_task(&self, task_id: Uuid) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.write();
        let status = inner
            .tasks
            .get(&task_id)
            .map(|t| t.status)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        if !status.is_terminal() {
            return Err(StoreError::InvalidState {
                id: task_id,
                status,
            });
        }

        inner.tasks.remove(&task_id);
        inner.order.retain(|id| *id != task_id);
        Ok(())
    }

    async fn requeue_stale(&self, stale_threshold: Duration) -> Result<Vec<Uuid>, StoreError> {
        self.check_available()?;
        let cutoff = Utc::now() - chrono::Duration::from_std(stale_threshold).unwrap_or_default();
        let mut inner = self.inner.write();
        let mut requeued = vec![];

        for task in inner.tasks.values_mut() {
            let orphaned = matches!(task.status, TaskStatus::Processing | TaskStatus::Retrying);
            if orphaned && task.updated_at <= cutoff {
                task.apply(&TaskUpdate::requeued());
                requeued.push(task.id);
            }
        }

        Ok(requeued)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }
}
