//! The job queue: enqueue with concurrency-key dedup, atomic claim by
//! priority then FIFO, and completion bookkeeping.

use chrono::Utc;
use serde_json::Value;
use tracing::info;

use crate::error::Result;
use crate::models::{JobRow, JobStatus, QueueStatus};
use crate::store::Store;

#[derive(Clone)]
pub struct Queue {
    store: Store,
}

impl Queue {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Enqueues a job unless one with the same `concurrency_key` is already
    /// queued or running, in which case it returns `None` rather than
    /// double-scheduling work behind that key.
    pub async fn enqueue(
        &self,
        action_type: &str,
        action_config: Value,
        event_id: Option<&str>,
        _source: &str,
        priority: i64,
        concurrency_key: Option<&str>,
    ) -> Result<Option<i64>> {
        if let Some(key) = concurrency_key {
            let existing: Option<i64> = sqlx::query_scalar(
                "SELECT id FROM job_queue WHERE concurrency_key = ? AND status IN ('queued', 'running') LIMIT 1",
            )
            .bind(key)
            .fetch_optional(&self.store.pool)
            .await?;

            if existing.is_some() {
                return Ok(None);
            }
        }

        let now = Utc::now().to_rfc3339();
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO job_queue
                (event_id, priority, concurrency_key, action_type, action_config, status, queued_at)
             VALUES (?, ?, ?, ?, ?, 'queued', ?)
             RETURNING id",
        )
        .bind(event_id)
        .bind(priority)
        .bind(concurrency_key)
        .bind(action_type)
        .bind(action_config.to_string())
        .bind(&now)
        .fetch_one(&self.store.pool)
        .await?;

        info!(job_id = id, action_type, "enqueued job");
        Ok(Some(id))
    }

    /// Atomically claims the highest-priority, oldest eligible job whose
    /// concurrency key (if any) isn't already running, via a single
    /// UPDATE ... WHERE id = (correlated SELECT ...) RETURNING statement.
    pub async fn dequeue(&self, worker_id: &str) -> Result<Option<JobRow>> {
        let now = Utc::now().to_rfc3339();

        let row: Option<JobRow> = sqlx::query_as(
            "UPDATE job_queue
             SET status = 'running', worker_id = ?, started_at = ?
             WHERE id = (
                 SELECT id FROM job_queue
                 WHERE status = 'queued'
                   AND (
                       concurrency_key IS NULL
                       OR concurrency_key NOT IN (
                           SELECT concurrency_key FROM job_queue
                           WHERE status = 'running' AND concurrency_key IS NOT NULL
                       )
                   )
                 ORDER BY priority ASC, queued_at ASC
                 LIMIT 1
             )
             RETURNING *",
        )
        .bind(worker_id)
        .bind(&now)
        .fetch_optional(&self.store.pool)
        .await?;

        Ok(row)
    }

    /// Stamps the terminal status and `completed_at`. Terminal rows are
    /// never mutated again.
    pub async fn complete_job(&self, id: i64, result: Option<&str>, error: Option<&str>) -> Result<()> {
        let status = if error.is_some() { JobStatus::Failed } else { JobStatus::Completed };
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            "UPDATE job_queue SET status = ?, result = ?, error = ?, completed_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(result)
        .bind(error)
        .bind(&now)
        .bind(id)
        .execute(&self.store.pool)
        .await?;

        Ok(())
    }

    pub async fn get_queue_status(&self) -> Result<QueueStatus> {
        let count_for = |status: &'static str| {
            let pool = self.store.pool.clone();
            async move {
                sqlx::query_scalar::<_, i64>("SELECT count(*) FROM job_queue WHERE status = ?")
                    .bind(status)
                    .fetch_one(&pool)
                    .await
            }
        };

        let queued = count_for("queued").await?;
        let running = count_for("running").await?;
        let completed = count_for("completed").await?;
        let failed = count_for("failed").await?;

        let recent: Vec<JobRow> = sqlx::query_as(
            "SELECT * FROM job_queue ORDER BY queued_at DESC LIMIT 20",
        )
        .fetch_all(&self.store.pool)
        .await?;

        Ok(QueueStatus { queued, running, completed, failed, recent })
    }
}
