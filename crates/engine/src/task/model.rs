//! Task records and the status transitions applied to them

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task status
///
/// ```text
/// Pending ──► Processing ──► Completed
///    ▲             │
///    │             ├──────────► Failed
///    │             ▼
///    └──────── Retrying
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed by a worker
    Pending,

    /// Claimed by exactly one worker and executing
    Processing,

    /// Finished successfully, `result` is set
    Completed,

    /// Failed permanently after exhausting retries
    Failed,

    /// Failed, waiting out the retry delay before going back to pending
    Retrying,
}

impl TaskStatus {
    /// All statuses, in lifecycle order
    pub const ALL: [TaskStatus; 5] = [
        Self::Pending,
        Self::Processing,
        Self::Completed,
        Self::Failed,
        Self::Retrying,
    ];

    /// Database / wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        }
    }

    /// Whether no further transition can happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown status string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task status: {0}")]
pub struct ParseStatusError(pub String);

impl FromStr for TaskStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "retrying" => Ok(Self::Retrying),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// A unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Build a fresh pending task with a time-ordered ID
    pub fn new(new_task: NewTask) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            task_type: new_task.task_type,
            payload: new_task.payload,
            status: TaskStatus::Pending,
            result: None,
            error_message: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Apply a transition to this in-flight copy
    pub fn apply(&mut self, update: &TaskUpdate) {
        let now = Utc::now();
        self.status = update.status;
        self.result = update.result.clone();
        self.error_message = update.error_message.clone();
        if let Some(retry_count) = update.retry_count {
            self.retry_count = retry_count;
        }
        if update.status == TaskStatus::Completed {
            self.completed_at = Some(now);
        }
        self.updated_at = now;
    }
}

/// Request to create a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub task_type: String,
    pub payload: serde_json::Value,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
        }
    }
}

/// The full set of outcome fields written by one status transition
///
/// Only constructible through the named transitions, so `result` is present
/// only for [`TaskStatus::Completed`] and `error_message` only for
/// [`TaskStatus::Retrying`] and [`TaskStatus::Failed`].
#[derive(Debug, Clone, PartialEq)]
pub struct TaskUpdate {
    status: TaskStatus,
    result: Option<serde_json::Value>,
    error_message: Option<String>,
    retry_count: Option<u32>,
}

impl TaskUpdate {
    /// Claimed by a worker
    pub fn processing() -> Self {
        Self {
            status: TaskStatus::Processing,
            result: None,
            error_message: None,
            retry_count: None,
        }
    }

    /// Finished with a result
    pub fn completed(result: serde_json::Value) -> Self {
        Self {
            status: TaskStatus::Completed,
            result: Some(result),
            error_message: None,
            retry_count: None,
        }
    }

    /// Failed an attempt, another one will follow
    pub fn retrying(retry_count: u32, error: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Retrying,
            result: None,
            error_message: Some(error.into()),
            retry_count: Some(retry_count),
        }
    }

    /// Failed for good
    pub fn failed(retry_count: u32, error: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            result: None,
            error_message: Some(error.into()),
            retry_count: Some(retry_count),
        }
    }

    /// Back to pending, after a retry delay or a stale-task sweep
    pub fn requeued() -> Self {
        Self {
            status: TaskStatus::Pending,
            result: None,
            error_message: None,
            retry_count: None,
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn result(&self) -> Option<&serde_json::Value> {
        self.result.as_ref()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// New retry count, `None` leaves the stored value untouched
    pub fn retry_count(&self) -> Option<u32> {
        self.retry_count
    }
}
