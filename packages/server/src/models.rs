//! Core data model: events, jobs, runs, bus journal rows, and ops state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    Cron,
    Interval,
    Once,
    Webhook,
    Manual,
    FlowChain,
}

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::Cron => "cron",
            ConditionType::Interval => "interval",
            ConditionType::Once => "once",
            ConditionType::Webhook => "webhook",
            ConditionType::Manual => "manual",
            ConditionType::FlowChain => "flow_chain",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "cron" => ConditionType::Cron,
            "interval" => ConditionType::Interval,
            "once" => ConditionType::Once,
            "webhook" => ConditionType::Webhook,
            "manual" => ConditionType::Manual,
            "flow_chain" => ConditionType::FlowChain,
            _ => return None,
        })
    }

    /// Only cron/interval/once ever transition to true from a tick; the rest
    /// are driven by external triggers (webhook calls, manual dispatch,
    /// flow-chain completion updating `next_eval_at` directly).
    pub fn is_tick_driven(&self) -> bool {
        matches!(self, ConditionType::Cron | ConditionType::Interval | ConditionType::Once)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    #[default]
    Active,
    Paused,
    Failed,
    Expired,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Active => "active",
            EventStatus::Paused => "paused",
            EventStatus::Failed => "failed",
            EventStatus::Expired => "expired",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "paused" => EventStatus::Paused,
            "failed" => EventStatus::Failed,
            "expired" => EventStatus::Expired,
            _ => EventStatus::Active,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "running" => JobStatus::Running,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Queued,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }
}

// ============================================================================
// Event
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Event {
    pub id: String,
    pub event_type: String,
    #[builder(default = "manual".to_string())]
    pub condition_type: String,
    #[builder(default, setter(strip_option))]
    pub condition_expr: Option<String>,
    pub next_eval_at: DateTime<Utc>,
    pub action_type: String,
    #[builder(default = serde_json::json!({}))]
    pub action_config: serde_json::Value,
    #[builder(default = EventStatus::Active.as_str().to_string())]
    pub status: String,
    #[builder(default = 5)]
    pub priority: i64,
    #[builder(default, setter(strip_option))]
    pub concurrency_key: Option<String>,
    #[builder(default = 3)]
    pub max_retries: i64,
    #[builder(default = 5)]
    pub retry_backoff_minutes: i64,
    #[builder(default = 0)]
    pub consecutive_fails: i64,
    #[builder(default = 0)]
    pub run_count: i64,
    #[builder(default = 0)]
    pub fail_count: i64,
    #[builder(default, setter(strip_option))]
    pub lock_holder: Option<String>,
    #[builder(default, setter(strip_option))]
    pub lock_expires_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub expires_at: Option<DateTime<Utc>>,
    #[builder(default = serde_json::json!({}))]
    pub metadata: serde_json::Value,
    #[builder(default, setter(strip_option))]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    /// Mirrors the candidate predicate in the data model: due, active, and
    /// not presently locked by a live instance.
    pub fn is_candidate(&self, now: DateTime<Utc>) -> bool {
        self.status == EventStatus::Active.as_str()
            && self.next_eval_at <= now
            && match (&self.lock_holder, self.lock_expires_at) {
                (None, _) => true,
                (Some(_), Some(expires)) => expires < now,
                (Some(_), None) => false,
            }
    }
}

/// Row shape returned by `SELECT * FROM events`.
#[derive(Debug, Clone, FromRow)]
pub struct EventRow {
    pub id: String,
    pub event_type: String,
    pub condition_type: String,
    pub condition_expr: Option<String>,
    pub next_eval_at: String,
    pub action_type: String,
    pub action_config: String,
    pub status: String,
    pub priority: i64,
    pub concurrency_key: Option<String>,
    pub max_retries: i64,
    pub retry_backoff_minutes: i64,
    pub consecutive_fails: i64,
    pub run_count: i64,
    pub fail_count: i64,
    pub lock_holder: Option<String>,
    pub lock_expires_at: Option<String>,
    pub expires_at: Option<String>,
    pub metadata: String,
    pub description: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

// ============================================================================
// Job
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default)]
    pub id: i64,
    #[builder(default, setter(strip_option))]
    pub event_id: Option<String>,
    #[builder(default = 5)]
    pub priority: i64,
    #[builder(default, setter(strip_option))]
    pub concurrency_key: Option<String>,
    pub action_type: String,
    #[builder(default = serde_json::json!({}))]
    pub action_config: serde_json::Value,
    #[builder(default = JobStatus::Queued.as_str().to_string())]
    pub status: String,
    #[builder(default, setter(strip_option))]
    pub worker_id: Option<String>,
    pub queued_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub result: Option<String>,
    #[builder(default, setter(strip_option))]
    pub error: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: i64,
    pub event_id: Option<String>,
    pub priority: i64,
    pub concurrency_key: Option<String>,
    pub action_type: String,
    pub action_config: String,
    pub status: String,
    pub worker_id: Option<String>,
    pub queued_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub result: Option<String>,
    pub error: Option<String>,
}

/// Aggregate counts plus the most recent rows, as `get_queue_status` returns.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub queued: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub recent: Vec<JobRow>,
}

// ============================================================================
// Run (append-only)
// ============================================================================

const RUN_OUTPUT_MAX_CHARS: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub event_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub result: String,
    pub duration_ms: i64,
    pub error: Option<String>,
    pub worker_id: String,
}

impl Run {
    /// Output is capped at `RUN_OUTPUT_MAX_CHARS` before it's persisted.
    pub fn truncate_output(output: &str) -> String {
        if output.chars().count() <= RUN_OUTPUT_MAX_CHARS {
            output.to_string()
        } else {
            output.chars().take(RUN_OUTPUT_MAX_CHARS).collect()
        }
    }
}

// ============================================================================
// Bus journal
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub event_type: String,
    pub source: Option<String>,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Ops monitor state
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub engine_healthy: bool,
    pub db_healthy: bool,
    pub worker_count: i64,
    pub pending_jobs: i64,
    pub failed_last_hour: i64,
    pub cleared_locks: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub category: String,
    pub message: String,
    pub auto_healed: bool,
    pub acknowledged: bool,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Manual heal actions exposed by the monitor, modeled as a closed enum
/// rather than a string-keyed dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealAction {
    RestartWorkers,
    RestartEngine,
    ClearLocks,
    FailStaleJobs,
}
