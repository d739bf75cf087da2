//! The worker pool: N cooperating tasks sharing one dequeue contract,
//! dispatching claimed jobs to a registry of executors.

pub mod executors;
pub mod flow;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::Bus;
use crate::error::Result;
use crate::models::{JobRow, Run};
use crate::queue::Queue;
use crate::store::Store;
use executors::Executor;

const EMPTY_QUEUE_BACKOFF: Duration = Duration::from_secs(2);

pub struct WorkerPool {
    store: Store,
    queue: Queue,
    bus: Bus,
    executors: executors::Registry,
    size: usize,
}

impl WorkerPool {
    pub fn new(store: Store, queue: Queue, bus: Bus, size: usize) -> Self {
        let executors = executors::Registry::new(store.clone(), bus.clone());
        Self { store, queue, bus, executors, size }
    }

    /// Dequeues and executes exactly one job under `worker_id`, for manual
    /// triggers and tests. Returns whether a job was available to run.
    pub async fn run_one(&self, worker_id: &str) -> Result<bool> {
        match self.queue.dequeue(worker_id).await? {
            Some(job) => {
                run_job(worker_id, &self.store, &self.queue, &self.bus, &self.executors, job).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut handles = Vec::with_capacity(self.size);
        for idx in 0..self.size {
            let worker_id = format!("worker-{idx}");
            let store = self.store.clone();
            let queue = self.queue.clone();
            let bus = self.bus.clone();
            let executors = self.executors.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(worker_id, store, queue, bus, executors, cancel).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(
    worker_id: String,
    store: Store,
    queue: Queue,
    bus: Bus,
    executors: executors::Registry,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            info!(worker_id, "worker stopping");
            return;
        }

        let job = tokio::select! {
            _ = cancel.cancelled() => return,
            job = queue.dequeue(&worker_id) => job,
        };

        match job {
            Ok(Some(job)) => {
                if let Err(err) = run_job(&worker_id, &store, &queue, &bus, &executors, job).await {
                    error!(worker_id, error = %err, "job execution failed unexpectedly");
                }
            }
            Ok(None) => sleep(EMPTY_QUEUE_BACKOFF).await,
            Err(err) => {
                warn!(worker_id, error = %err, "dequeue failed, backing off");
                sleep(EMPTY_QUEUE_BACKOFF).await;
            }
        }
    }
}

async fn run_job(
    worker_id: &str,
    store: &Store,
    queue: &Queue,
    bus: &Bus,
    executors: &executors::Registry,
    job: JobRow,
) -> Result<()> {
    let started_at = Utc::now();
    let executor = executors.get(&job.action_type);

    let (output, error) = match executor {
        None => (
            String::new(),
            Some(format!("Unknown action_type: {}", job.action_type)),
        ),
        Some(executor) => {
            let config: serde_json::Value =
                serde_json::from_str(&job.action_config).unwrap_or(serde_json::json!({}));
            match executor.execute(config).await {
                Ok(result) if result.starts_with("error") => {
                    let err = result.clone();
                    (result, Some(err))
                }
                Ok(result) => (result, None),
                Err(err) => (String::new(), Some(err.to_string())),
            }
        }
    };

    let completed_at = Utc::now();
    let duration_ms = (completed_at - started_at).num_milliseconds();

    queue.complete_job(job.id, Some(&output), error.as_deref()).await?;

    if let Some(event_id) = &job.event_id {
        record_run(
            store,
            &Run {
                event_id: Some(event_id.clone()),
                started_at,
                completed_at,
                result: Run::truncate_output(&output),
                duration_ms,
                error: error.clone(),
                worker_id: worker_id.to_string(),
            },
        )
        .await?;
        update_event_counters(store, event_id, error.is_none()).await?;
    }

    let topic = if error.is_some() { "job.failed" } else { "job.completed" };
    bus.publish(
        topic,
        serde_json::json!({ "job_id": job.id, "event_id": job.event_id, "error": error }),
        Some("worker"),
    )
    .await;

    Ok(())
}

async fn record_run(store: &Store, run: &Run) -> Result<()> {
    sqlx::query(
        "INSERT INTO event_runs (event_id, started_at, completed_at, result, duration_ms, error, worker_id)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&run.event_id)
    .bind(run.started_at.to_rfc3339())
    .bind(run.completed_at.to_rfc3339())
    .bind(&run.result)
    .bind(run.duration_ms)
    .bind(&run.error)
    .bind(&run.worker_id)
    .execute(&store.pool)
    .await?;
    Ok(())
}

/// Success resets `consecutive_fails` to zero; failure increments both
/// `fail_count` and `consecutive_fails`. `run_count` always advances.
async fn update_event_counters(store: &Store, event_id: &str, succeeded: bool) -> Result<()> {
    if succeeded {
        sqlx::query(
            "UPDATE events SET run_count = run_count + 1, consecutive_fails = 0, updated_at = ? WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(event_id)
        .execute(&store.pool)
        .await?;
    } else {
        sqlx::query(
            "UPDATE events SET run_count = run_count + 1, fail_count = fail_count + 1,
                consecutive_fails = consecutive_fails + 1, updated_at = ? WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(event_id)
        .execute(&store.pool)
        .await?;
    }
    Ok(())
}
