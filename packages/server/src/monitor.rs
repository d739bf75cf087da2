//! The ops monitor: a sibling tick loop that checks system health,
//! auto-restarts the Engine/Workers with an escalation budget, reaps stale
//! jobs, evicts expired locks, and snapshots the result. Ported from
//! `ops_monitor.py`.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::bus::Bus;
use crate::config::Config;
use crate::engine::Engine;
use crate::error::Result;
use crate::lifecycle::Supervised;
use crate::models::{AlertSeverity, HealAction};
use crate::store::Store;
use crate::workers::WorkerPool;

/// Restart attempts within this many seconds count against the
/// 3-per-window escalation budget, for both Engine and Workers.
const RESTART_WINDOW_SECONDS: i64 = 600;
const RESTART_BUDGET: usize = 3;
const PENDING_BACKLOG_MINUTES: i64 = 5;

pub struct Monitor {
    store: Store,
    bus: Bus,
    interval: std::time::Duration,
    stale_job_timeout: ChronoDuration,
    max_failed_jobs_hour: u32,
    webhook_url: Option<String>,
    engine: Arc<Supervised<Engine>>,
    workers: Arc<Supervised<WorkerPool>>,
    worker_pool_size: usize,
    engine_restart_times: RwLock<Vec<DateTime<Utc>>>,
    worker_restart_times: RwLock<Vec<DateTime<Utc>>>,
}

impl Monitor {
    pub fn new(
        store: Store,
        bus: Bus,
        config: &Config,
        engine: Arc<Supervised<Engine>>,
        workers: Arc<Supervised<WorkerPool>>,
    ) -> Self {
        Self {
            store,
            bus,
            interval: config.ops_monitor_interval(),
            stale_job_timeout: config.ops_stale_job_timeout(),
            max_failed_jobs_hour: config.ops_max_failed_jobs_hour,
            webhook_url: config.ops_webhook_url.clone(),
            engine,
            workers,
            worker_pool_size: config.worker_pool_size,
            engine_restart_times: RwLock::new(Vec::new()),
            worker_restart_times: RwLock::new(Vec::new()),
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.interval);
        info!(interval_s = self.interval.as_secs(), "ops monitor started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("ops monitor stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.tick_once().await {
                        error!(error = %err, "ops monitor tick failed, continuing");
                    }
                }
            }
        }
    }

    async fn tick_once(&self) -> Result<()> {
        let db_healthy = self.check_db().await;
        if !db_healthy {
            return Ok(());
        }

        let engine_healthy = self.check_engine().await;
        let worker_count = self.check_workers().await;
        let cleared_locks = self.clear_expired_locks().await?;
        let stale_reaped = self.reap_stale_jobs().await?;
        let pending_jobs = self.count_pending_backlog().await?;
        let failed_last_hour = self.count_failed_last_hour().await?;

        self.write_snapshot(
            engine_healthy,
            db_healthy,
            worker_count,
            pending_jobs,
            failed_last_hour,
            cleared_locks + stale_reaped,
        )
        .await?;

        Ok(())
    }

    async fn check_db(&self) -> bool {
        let healthy = self.store.is_healthy().await;
        if !healthy {
            self.alert(AlertSeverity::Critical, "db", "Database is unreachable", false, None).await;
        }
        healthy
    }

    /// Restarts the Engine if its supervised task has died, subject to a
    /// 3-per-10-minute escalation budget. Returns whether the engine is
    /// healthy (running) after this check.
    async fn check_engine(&self) -> bool {
        if self.engine.is_alive().await {
            return true;
        }

        let mut times = self.engine_restart_times.write().await;
        prune_restart_times(&mut times);

        if times.len() >= RESTART_BUDGET {
            drop(times);
            self.alert(
                AlertSeverity::Critical,
                "engine",
                "Engine restart failed repeatedly (>3 in 10min)",
                false,
                None,
            )
            .await;
            return false;
        }

        self.engine.restart().await;
        times.push(Utc::now());
        drop(times);
        self.alert(
            AlertSeverity::Info,
            "engine",
            "Event engine was stopped — auto-restarted",
            true,
            None,
        )
        .await;
        true
    }

    /// Same escalation logic as `check_engine`, applied to the worker
    /// pool's single supervised task. Returns the worker count reported
    /// (the configured pool size if alive, 0 if not).
    async fn check_workers(&self) -> i64 {
        if self.workers.is_alive().await {
            return self.worker_pool_size as i64;
        }

        let mut times = self.worker_restart_times.write().await;
        prune_restart_times(&mut times);

        if times.len() >= RESTART_BUDGET {
            drop(times);
            self.alert(
                AlertSeverity::Critical,
                "worker",
                "Worker pool restart failed repeatedly (>3 in 10min)",
                false,
                None,
            )
            .await;
            return 0;
        }

        self.workers.restart().await;
        times.push(Utc::now());
        drop(times);
        self.alert(
            AlertSeverity::Info,
            "worker",
            "Worker pool was stopped — auto-restarted",
            true,
            None,
        )
        .await;
        self.worker_pool_size as i64
    }

    /// Force-fails any job stuck `running` past `stale_job_timeout`.
    /// Returns the count reaped.
    async fn reap_stale_jobs(&self) -> Result<i64> {
        let cutoff = (Utc::now() - self.stale_job_timeout).to_rfc3339();
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM job_queue WHERE status = 'running' AND started_at < ?",
        )
        .bind(&cutoff)
        .fetch_all(&self.store.pool)
        .await?;

        if ids.is_empty() {
            return Ok(0);
        }

        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE job_queue SET status = 'failed', error = 'Force-failed by ops monitor (stale)',
                completed_at = ? WHERE status = 'running' AND started_at < ?",
        )
        .bind(&now)
        .bind(&cutoff)
        .execute(&self.store.pool)
        .await?;

        self.alert(
            AlertSeverity::Info,
            "job",
            &format!("Force-failed {} stale job(s)", ids.len()),
            true,
            Some(serde_json::json!({ "job_ids": ids })),
        )
        .await;

        Ok(ids.len() as i64)
    }

    /// Informative only: counts jobs stuck `queued` longer than
    /// `PENDING_BACKLOG_MINUTES`.
    async fn count_pending_backlog(&self) -> Result<i64> {
        let cutoff = (Utc::now() - ChronoDuration::minutes(PENDING_BACKLOG_MINUTES)).to_rfc3339();
        let count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM job_queue WHERE status = 'queued' AND queued_at < ?",
        )
        .bind(&cutoff)
        .fetch_one(&self.store.pool)
        .await?;
        Ok(count)
    }

    async fn count_failed_last_hour(&self) -> Result<i64> {
        let cutoff = (Utc::now() - ChronoDuration::hours(1)).to_rfc3339();
        let count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM job_queue WHERE status = 'failed' AND completed_at > ?",
        )
        .bind(&cutoff)
        .fetch_one(&self.store.pool)
        .await?;

        if count > self.max_failed_jobs_hour as i64 {
            self.alert(
                AlertSeverity::Warning,
                "job",
                &format!(
                    "High job failure rate: {count} failures in last hour (threshold: {})",
                    self.max_failed_jobs_hour
                ),
                false,
                Some(serde_json::json!({ "count": count, "threshold": self.max_failed_jobs_hour })),
            )
            .await;
        }

        Ok(count)
    }

    async fn clear_expired_locks(&self) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM events WHERE lock_expires_at IS NOT NULL AND lock_expires_at < ?",
        )
        .bind(&now)
        .fetch_all(&self.store.pool)
        .await?;

        if ids.is_empty() {
            return Ok(0);
        }

        sqlx::query(
            "UPDATE events SET lock_holder = NULL, lock_expires_at = NULL
             WHERE lock_expires_at IS NOT NULL AND lock_expires_at < ?",
        )
        .bind(&now)
        .execute(&self.store.pool)
        .await?;

        self.alert(
            AlertSeverity::Info,
            "engine",
            &format!("Cleared {} expired event lock(s)", ids.len()),
            true,
            Some(serde_json::json!({ "event_ids": ids })),
        )
        .await;

        Ok(ids.len() as i64)
    }

    async fn write_snapshot(
        &self,
        engine_healthy: bool,
        db_healthy: bool,
        worker_count: i64,
        pending_jobs: i64,
        failed_last_hour: i64,
        cleared_locks: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO ops_health_snapshots
                (engine_healthy, db_healthy, worker_count, pending_jobs, failed_last_hour, cleared_locks, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(engine_healthy)
        .bind(db_healthy)
        .bind(worker_count)
        .bind(pending_jobs)
        .bind(failed_last_hour)
        .bind(cleared_locks)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.store.pool)
        .await?;
        Ok(())
    }

    /// Persists an alert row, publishes it to the bus, and for `critical`
    /// severity posts it to the configured webhook with a 10s timeout. None
    /// of these failures propagate — logged and swallowed, same as the
    /// original's broad `except Exception` guards.
    async fn alert(
        &self,
        severity: AlertSeverity,
        category: &str,
        message: &str,
        auto_healed: bool,
        details: Option<Value>,
    ) {
        let details = details.unwrap_or(Value::Null);

        if let Err(err) = sqlx::query(
            "INSERT INTO ops_alerts (severity, category, message, auto_healed, details, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(severity.as_str())
        .bind(category)
        .bind(message)
        .bind(auto_healed)
        .bind(details.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.store.pool)
        .await
        {
            tracing::warn!(error = %err, "failed to persist ops alert");
        }

        self.bus
            .publish(
                "ops.alert",
                serde_json::json!({
                    "severity": severity.as_str(),
                    "category": category,
                    "message": message,
                    "auto_healed": auto_healed,
                    "details": details,
                }),
                Some("ops_monitor"),
            )
            .await;

        if severity == AlertSeverity::Critical {
            if let Some(url) = &self.webhook_url {
                let client = reqwest::Client::builder()
                    .timeout(std::time::Duration::from_secs(10))
                    .build();
                if let Ok(client) = client {
                    let payload = serde_json::json!({
                        "severity": severity.as_str(),
                        "category": category,
                        "message": message,
                        "details": details,
                        "timestamp": Utc::now().to_rfc3339(),
                    });
                    if let Err(err) = client.post(url).json(&payload).send().await {
                        tracing::warn!(error = %err, "failed to send ops webhook");
                    }
                }
            }
        }
    }

    /// Dispatches a manual heal action, as exposed to a facade API.
    pub async fn heal(&self, action: HealAction) -> Result<String> {
        match action {
            HealAction::RestartWorkers => {
                self.workers.restart().await;
                self.alert(
                    AlertSeverity::Info,
                    "worker",
                    "Worker pool manually restarted",
                    false,
                    Some(serde_json::json!({ "source": "api" })),
                )
                .await;
                Ok("Workers restarted".to_string())
            }
            HealAction::RestartEngine => {
                self.engine.restart().await;
                self.alert(
                    AlertSeverity::Info,
                    "engine",
                    "Event engine manually restarted",
                    false,
                    Some(serde_json::json!({ "source": "api" })),
                )
                .await;
                Ok("Engine restarted".to_string())
            }
            HealAction::ClearLocks => {
                let count = self.clear_expired_locks().await?;
                Ok(format!("Cleared {count} expired lock(s)"))
            }
            HealAction::FailStaleJobs => {
                let count = self.reap_stale_jobs().await?;
                Ok(format!("Force-failed {count} stale job(s)"))
            }
        }
    }
}

fn prune_restart_times(times: &mut Vec<DateTime<Utc>>) {
    let cutoff = Utc::now() - ChronoDuration::seconds(RESTART_WINDOW_SECONDS);
    times.retain(|t| *t > cutoff);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Queue;

    async fn harness() -> Monitor {
        let store = Store::connect_in_memory().await.unwrap();
        let bus = Bus::new(store.clone());
        let queue = Queue::new(store.clone());
        let config = Config::from_env();
        let engine = Arc::new(Supervised::new(Arc::new(Engine::new(
            store.clone(),
            queue.clone(),
            bus.clone(),
            config.engine_tick(),
        ))));
        let workers = Arc::new(Supervised::new(Arc::new(WorkerPool::new(
            store.clone(),
            queue,
            bus.clone(),
            config.worker_pool_size,
        ))));
        Monitor::new(store, bus, &config, engine, workers)
    }

    #[tokio::test]
    async fn stale_running_job_force_failed_once() {
        let monitor = harness().await;
        let stale_started = (Utc::now() - ChronoDuration::minutes(30)).to_rfc3339();
        sqlx::query(
            "INSERT INTO job_queue (action_type, status, queued_at, started_at, worker_id)
             VALUES ('script', 'running', ?, ?, 'worker-0')",
        )
        .bind(&stale_started)
        .bind(&stale_started)
        .execute(&monitor.store.pool)
        .await
        .unwrap();

        let reaped = monitor.reap_stale_jobs().await.unwrap();
        assert_eq!(reaped, 1);

        let again = monitor.reap_stale_jobs().await.unwrap();
        assert_eq!(again, 0);

        let status: String = sqlx::query_scalar("SELECT status FROM job_queue")
            .fetch_one(&monitor.store.pool)
            .await
            .unwrap();
        assert_eq!(status, "failed");
    }

    #[tokio::test]
    async fn expired_lock_is_cleared() {
        let monitor = harness().await;
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO events (id, event_type, condition_type, next_eval_at, action_type,
                lock_holder, lock_expires_at, created_at, updated_at)
             VALUES ('e1', 'test', 'interval', ?, 'script', 'dead', ?, ?, ?)",
        )
        .bind(now.to_rfc3339())
        .bind((now - ChronoDuration::seconds(1)).to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&monitor.store.pool)
        .await
        .unwrap();

        let cleared = monitor.clear_expired_locks().await.unwrap();
        assert_eq!(cleared, 1);

        let lock_holder: Option<String> =
            sqlx::query_scalar("SELECT lock_holder FROM events WHERE id = 'e1'")
                .fetch_one(&monitor.store.pool)
                .await
                .unwrap();
        assert!(lock_holder.is_none());
    }

    #[tokio::test]
    async fn three_restarts_then_critical_alert_in_window() {
        let monitor = harness().await;
        {
            let mut times = monitor.engine_restart_times.write().await;
            let now = Utc::now();
            times.push(now - ChronoDuration::seconds(100));
            times.push(now - ChronoDuration::seconds(50));
            times.push(now - ChronoDuration::seconds(10));
        }

        // The supervised engine task is alive (spawned but never started in
        // this harness counts as not-alive: no task has been started yet).
        assert!(!monitor.engine.is_alive().await);
        let healthy = monitor.check_engine().await;
        assert!(!healthy);

        let alerts: i64 = sqlx::query_scalar("SELECT count(*) FROM ops_alerts WHERE category = 'engine' AND severity = 'critical'")
            .fetch_one(&monitor.store.pool)
            .await
            .unwrap();
        assert_eq!(alerts, 1);
    }
}
