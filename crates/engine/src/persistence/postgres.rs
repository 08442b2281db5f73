//! PostgreSQL implementation of TaskStore
//!
//! Production persistence using PostgreSQL with:
//! - Atomic claiming through a single conditional `UPDATE ... WHERE status = $n`
//! - Partial index on pending tasks for the fetcher
//! - Startup sweep of stale processing tasks

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::task::{NewTask, Task, TaskStatus, TaskUpdate};

const TASK_COLUMNS: &str = "id, task_type, payload, status, result, error_message, \
                            retry_count, created_at, updated_at, completed_at";

/// PostgreSQL implementation of TaskStore
///
/// Uses a connection pool for efficient database access. Row-level write
/// atomicity comes from PostgreSQL itself: a conditional update either
/// matches the expected status and applies, or affects zero rows.
///
/// # Example
///
/// ```ignore
/// use taskpool_engine::PostgresTaskStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/task_queue_db").await?;
/// let store = PostgresTaskStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })
    }
}

fn db_error(context: &str, e: sqlx::Error) -> StoreError {
    error!("{}: {}", context, e);
    StoreError::Database(e.to_string())
}

fn task_from_row(row: &PgRow) -> Result<Task, StoreError> {
    let status: String = row.get("status");
    let status: TaskStatus = status
        .parse()
        .map_err(|e: crate::task::ParseStatusError| StoreError::Serialization(e.to_string()))?;

    Ok(Task {
        id: row.get("id"),
        task_type: row.get("task_type"),
        payload: row.get("payload"),
        status,
        result: row.get("result"),
        error_message: row.get("error_message"),
        retry_count: row.get::<i32, _>("retry_count").max(0) as u32,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        completed_at: row.get("completed_at"),
    })
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    #[instrument(skip(self, new_task), fields(task_type = %new_task.task_type))]
    async fn create_task(&self, new_task: NewTask) -> Result<Task, StoreError> {
        let task = Task::new(new_task);

        sqlx::query(
            r#"
            INSERT INTO tasks (id, task_type, payload, status, retry_count, created_at, updated_at)
            VALUES ($1, $2, $3, 'pending', 0, $4, $4)
            "#,
        )
        .bind(task.id)
        .bind(&task.task_type)
        .bind(&task.payload)
        .bind(task.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to create task", e))?;

        debug!(task_id = %task.id, "created task");
        Ok(task)
    }

    #[instrument(skip(self))]
    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to get task", e))?;

        row.as_ref().map(task_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn list_pending(&self, limit: usize) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'pending' \
             ORDER BY created_at, id LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list pending tasks", e))?;

        rows.iter().map(task_from_row).collect()
    }

    #[instrument(skip(self, update), fields(status = %update.status()))]
    async fn update_task(&self, task_id: Uuid, update: TaskUpdate) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = $2,
                result = $3,
                error_message = $4,
                retry_count = COALESCE($5, retry_count),
                completed_at = CASE WHEN $2 = 'completed' THEN NOW() ELSE completed_at END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .bind(update.status().as_str())
        .bind(update.result())
        .bind(update.error_message())
        .bind(update.retry_count().map(|c| c as i32))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to update task", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(task_id));
        }

        debug!(%task_id, "updated task");
        Ok(())
    }

    #[instrument(skip(self, update), fields(status = %update.status()))]
    async fn update_task_if(
        &self,
        task_id: Uuid,
        expected: TaskStatus,
        update: TaskUpdate,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = $3,
                result = $4,
                error_message = $5,
                retry_count = COALESCE($6, retry_count),
                completed_at = CASE WHEN $3 = 'completed' THEN NOW() ELSE completed_at END,
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(task_id)
        .bind(expected.as_str())
        .bind(update.status().as_str())
        .bind(update.result())
        .bind(update.error_message())
        .bind(update.retry_count().map(|c| c as i32))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to conditionally update task", e))?;

        let applied = result.rows_affected() == 1;
        debug!(%task_id, %expected, applied, "conditional task update");
        Ok(applied)
    }

    #[instrument(skip(self))]
    async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE ($1::TEXT IS NULL OR status = $1) \
             ORDER BY created_at DESC, id DESC LIMIT $2"
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list tasks", e))?;

        rows.iter().map(task_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn count_by_status(&self) -> Result<StatusCounts, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("Failed to count tasks", e))?;

        let mut counts = StatusCounts::new();
        for row in rows {
            let status: String = row.get("status");
            let status: TaskStatus = status.parse().map_err(
                |e: crate::task::ParseStatusError| StoreError::Serialization(e.to_string()),
            )?;
            counts.set(status, row.get::<i64, _>("count").max(0) as u64);
        }
        Ok(counts)
    }

    #[instrument(skip(self))]
    async fn delete_task(&self, task_id: Uuid) -> Result<(), StoreError> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM tasks
            WHERE id = $1 AND status IN ('completed', 'failed')
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to delete task", e))?;

        if deleted.rows_affected() == 1 {
            debug!(%task_id, "deleted task");
            return Ok(());
        }

        // Distinguish a missing task from one that is still live
        match self.get_task(task_id).await? {
            Some(task) => Err(StoreError::InvalidState {
                id: task_id,
                status: task.status,
            }),
            None => Err(StoreError::TaskNotFound(task_id)),
        }
    }

    #[instrument(skip(self))]
    async fn requeue_stale(&self, stale_threshold: Duration) -> Result<Vec<Uuid>, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(stale_threshold).unwrap_or_default();

        let rows = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'pending',
                result = NULL,
                error_message = NULL,
                updated_at = NOW()
            WHERE status IN ('processing', 'retrying')
              AND updated_at <= $1
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to requeue stale tasks", e))?;

        let requeued: Vec<Uuid> = rows.iter().map(|r| r.get("id")).collect();

        if !requeued.is_empty() {
            debug!(count = requeued.len(), "requeued stale tasks");
        }

        Ok(requeued)
    }

    #[instrument(skip(self))]
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Store ping failed", e))?;
        Ok(())
    }
}
