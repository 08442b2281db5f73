//! In-memory dispatch queue between the fetcher and the workers
//!
//! A FIFO of task IDs with an optional capacity. Producers block while the
//! queue is full, which throttles the fetcher to the workers' pace. The
//! buffer itself sits behind a short synchronous lock; all waiting happens
//! on semaphores, so no lock is held across an `.await`.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use uuid::Uuid;

/// The queue was closed by shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("dispatch queue is closed")]
pub struct QueueClosed;

/// Multi-producer, multi-consumer FIFO of task IDs
///
/// Entries are scheduling hints, not claims: the same ID may be queued more
/// than once, and workers discard entries for tasks that are no longer
/// pending.
pub struct DispatchQueue {
    entries: Mutex<VecDeque<Uuid>>,
    /// Free slots, `None` when unbounded
    slots: Option<Semaphore>,
    /// Entries ready to be popped
    ready: Semaphore,
    capacity: Option<usize>,
}

impl DispatchQueue {
    /// Create a queue holding at most `capacity` entries
    pub fn bounded(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            slots: Some(Semaphore::new(capacity)),
            ready: Semaphore::new(0),
            capacity: Some(capacity),
        }
    }

    /// Create a queue without a size limit
    pub fn unbounded() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            slots: None,
            ready: Semaphore::new(0),
            capacity: None,
        }
    }

    /// Append an entry, waiting for a free slot if the queue is full
    pub async fn push(&self, task_id: Uuid) -> Result<(), QueueClosed> {
        if let Some(slots) = &self.slots {
            slots.acquire().await.map_err(|_| QueueClosed)?.forget();
        } else if self.ready.is_closed() {
            return Err(QueueClosed);
        }
        self.enqueue(task_id);
        Ok(())
    }

    /// Append an entry if there is room, returning `false` when full
    pub fn try_push(&self, task_id: Uuid) -> Result<bool, QueueClosed> {
        if let Some(slots) = &self.slots {
            match slots.try_acquire() {
                Ok(permit) => permit.forget(),
                Err(tokio::sync::TryAcquireError::NoPermits) => return Ok(false),
                Err(tokio::sync::TryAcquireError::Closed) => return Err(QueueClosed),
            }
        } else if self.ready.is_closed() {
            return Err(QueueClosed);
        }
        self.enqueue(task_id);
        Ok(true)
    }

    /// Remove the oldest entry, waiting up to `timeout` for one to arrive
    ///
    /// Returns `Ok(None)` on timeout.
    pub async fn pop_timeout(&self, timeout: Duration) -> Result<Option<Uuid>, QueueClosed> {
        let permit = match tokio::time::timeout(timeout, self.ready.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(QueueClosed),
            Err(_) => return Ok(None),
        };
        permit.forget();

        let task_id = self.entries.lock().pop_front();
        if let Some(slots) = &self.slots {
            slots.add_permits(1);
        }
        Ok(task_id)
    }

    /// Number of queued entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of entries, `None` when unbounded
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Close the queue, waking every blocked producer and consumer
    ///
    /// Entries still buffered are dropped; their tasks stay pending in the
    /// store and are fetched again on the next start.
    pub fn close(&self) {
        if let Some(slots) = &self.slots {
            slots.close();
        }
        self.ready.close();
        self.entries.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.ready.is_closed()
    }

    fn enqueue(&self, task_id: Uuid) {
        self.entries.lock().push_back(task_id);
        // Publish only after the entry is in the buffer
        self.ready.add_permits(1);
    }
}

impl std::fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}
