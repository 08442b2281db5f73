//! Point-in-time engine statistics

use serde::{Deserialize, Serialize};

use crate::persistence::StatusCounts;
use crate::task::TaskStatus;
use crate::worker::EngineState;

/// Snapshot returned by [`TaskEngine::stats`](crate::TaskEngine::stats)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub state: EngineState,
    pub pool_size: usize,
    /// Workers whose loop has not exited yet
    pub live_workers: usize,
    /// Dispatch entries waiting for a worker
    pub queue_depth: usize,
    pub queue_capacity: Option<usize>,
    /// Tasks in the store, by status
    pub tasks: StatusCounts,
}

impl EngineStats {
    /// Tasks still to be executed (pending or waiting for a retry)
    pub fn backlog(&self) -> u64 {
        self.tasks.get(TaskStatus::Pending) + self.tasks.get(TaskStatus::Retrying)
    }

    /// Share of finished tasks that completed, as a percentage
    pub fn success_rate(&self) -> Option<f64> {
        self.tasks.success_rate()
    }
}

impl std::fmt::Display for EngineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "state={} workers={}/{} queue={}",
            self.state, self.live_workers, self.pool_size, self.queue_depth
        )?;
        for (status, count) in self.tasks.iter() {
            write!(f, " {}={}", status, count)?;
        }
        if let Some(rate) = self.success_rate() {
            write!(f, " success_rate={:.1}%", rate)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(counts: &[(TaskStatus, u64)]) -> EngineStats {
        let mut tasks = StatusCounts::new();
        for (status, count) in counts {
            tasks.set(*status, *count);
        }
        EngineStats {
            state: EngineState::Running,
            pool_size: 4,
            live_workers: 4,
            queue_depth: 2,
            queue_capacity: Some(16),
            tasks,
        }
    }

    #[test]
    fn test_backlog_counts_pending_and_retrying() {
        let s = stats(&[
            (TaskStatus::Pending, 3),
            (TaskStatus::Retrying, 2),
            (TaskStatus::Processing, 4),
        ]);
        assert_eq!(s.backlog(), 5);
    }

    #[test]
    fn test_display() {
        let s = stats(&[(TaskStatus::Completed, 3), (TaskStatus::Failed, 1)]);
        let line = s.to_string();
        assert!(line.starts_with("state=running workers=4/4 queue=2"));
        assert!(line.contains("completed=3"));
        assert!(line.ends_with("success_rate=75.0%"));
    }

    #[test]
    fn test_no_success_rate_before_anything_finishes() {
        let s = stats(&[(TaskStatus::Pending, 1)]);
        assert!(s.success_rate().is_none());
        assert!(!s.to_string().contains("success_rate"));
    }
}
