//! The tick loop: finds due events, claims them with a lease, evaluates
//! their condition, and turns true conditions into queued jobs.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bus::Bus;
use crate::error::Result;
use crate::models::{ConditionType, EventRow, EventStatus};
use crate::queue::Queue;
use crate::store::Store;

/// How long a tick's lock on a candidate event is held before it's
/// considered abandoned and eligible for another instance to reclaim.
const LOCK_DURATION_SECONDS: i64 = 120;

pub struct Engine {
    store: Store,
    queue: Queue,
    bus: Bus,
    tick: std::time::Duration,
    instance_id: String,
}

impl Engine {
    pub fn new(store: Store, queue: Queue, bus: Bus, tick: std::time::Duration) -> Self {
        Self {
            store,
            queue,
            bus,
            tick,
            instance_id: Uuid::new_v4().to_string()[..8].to_string(),
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.tick);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("engine stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.tick_once().await {
                        error!(error = %err, "engine tick failed, continuing");
                    }
                }
            }
        }
    }

    /// Runs exactly one tick: fetch candidates, lock, evaluate, enqueue.
    /// Exposed publicly so both the interval loop and tests/manual triggers
    /// can drive a single pass deterministically.
    pub async fn tick_once(&self) -> Result<()> {
        let now = Utc::now();
        let lock_until = now + ChronoDuration::seconds(LOCK_DURATION_SECONDS);

        let candidates: Vec<EventRow> = sqlx::query_as(
            "SELECT * FROM events WHERE status = 'active' AND next_eval_at <= ?
             AND (lock_holder IS NULL OR lock_expires_at < ?)",
        )
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .fetch_all(&self.store.pool)
        .await?;

        for candidate in candidates {
            if let Err(err) = self.process_candidate(candidate, now, lock_until).await {
                error!(error = %err, "failed processing candidate, continuing tick");
            }
        }

        Ok(())
    }

    async fn process_candidate(
        &self,
        row: EventRow,
        now: DateTime<Utc>,
        lock_until: DateTime<Utc>,
    ) -> Result<()> {
        let claimed = sqlx::query(
            "UPDATE events SET lock_holder = ?, lock_expires_at = ?
             WHERE id = ? AND status = 'active' AND next_eval_at <= ?
               AND (lock_holder IS NULL OR lock_expires_at < ?)",
        )
        .bind(&self.instance_id)
        .bind(lock_until.to_rfc3339())
        .bind(&row.id)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.store.pool)
        .await?;

        if claimed.rows_affected() == 0 {
            return Ok(());
        }

        let condition_type = ConditionType::from_str(&row.condition_type);
        let due = match condition_type {
            Some(ct) if ct.is_tick_driven() => row.next_eval_at <= now.to_rfc3339(),
            Some(_) => false,
            None => {
                warn!(event_id = %row.id, condition_type = %row.condition_type, "unknown condition_type");
                false
            }
        };

        if !due {
            self.release_lock(&row.id).await?;
            return Ok(());
        }

        if row.consecutive_fails >= row.max_retries {
            self.pause_event(&row.id).await?;
            self.release_lock(&row.id).await?;
            self.bus
                .publish(
                    "event.paused",
                    serde_json::json!({ "event_id": row.id, "reason": "max_retries" }),
                    Some("engine"),
                )
                .await;
            return Ok(());
        }

        let job_id = self
            .queue
            .enqueue(
                &row.action_type,
                serde_json::from_str(&row.action_config).unwrap_or(serde_json::json!({})),
                Some(&row.id),
                "engine",
                row.priority,
                row.concurrency_key.as_deref(),
            )
            .await?;

        if job_id.is_none() {
            self.release_lock(&row.id).await?;
            return Ok(());
        }

        let next_eval_at = compute_next_eval(condition_type, &row.condition_expr, now, self.tick);

        sqlx::query("UPDATE events SET next_eval_at = ?, updated_at = ?, lock_holder = NULL, lock_expires_at = NULL WHERE id = ?")
            .bind(next_eval_at.to_rfc3339())
            .bind(now.to_rfc3339())
            .bind(&row.id)
            .execute(&self.store.pool)
            .await?;

        self.bus
            .publish(
                "event.triggered",
                serde_json::json!({ "event_id": row.id, "job_id": job_id }),
                Some("engine"),
            )
            .await;

        Ok(())
    }

    async fn release_lock(&self, event_id: &str) -> Result<()> {
        sqlx::query("UPDATE events SET lock_holder = NULL, lock_expires_at = NULL WHERE id = ?")
            .bind(event_id)
            .execute(&self.store.pool)
            .await?;
        Ok(())
    }

    async fn pause_event(&self, event_id: &str) -> Result<()> {
        sqlx::query("UPDATE events SET status = ?, updated_at = ? WHERE id = ?")
            .bind(EventStatus::Paused.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(event_id)
            .execute(&self.store.pool)
            .await?;
        Ok(())
    }
}

/// Interval events advance by their expressed number of seconds; cron
/// events re-evaluate in a fixed 60s window (no cron parser in the core,
/// see the Engine's design notes); once events push far into the future so
/// they never re-trigger; anything else falls back to the tick interval.
fn compute_next_eval(
    condition_type: Option<ConditionType>,
    condition_expr: &Option<String>,
    now: DateTime<Utc>,
    tick: std::time::Duration,
) -> DateTime<Utc> {
    match condition_type {
        Some(ConditionType::Interval) => {
            let seconds: i64 = condition_expr
                .as_deref()
                .and_then(|s| s.parse().ok())
                .unwrap_or(tick.as_secs() as i64);
            now + ChronoDuration::seconds(seconds)
        }
        Some(ConditionType::Cron) => now + ChronoDuration::seconds(60),
        Some(ConditionType::Once) => now + ChronoDuration::days(365 * 100),
        _ => now + ChronoDuration::from_std(tick).unwrap_or(ChronoDuration::seconds(30)),
    }
}
