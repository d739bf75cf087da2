//! Process configuration, loaded once from the environment at startup.

use std::env;
use std::time::Duration;

use dotenvy::dotenv;

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Settings for one orchestrator process. Field names and defaults mirror
/// the environment variables this crate documents.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub engine_tick_seconds: u64,
    pub worker_pool_size: usize,
    pub ops_monitor_enabled: bool,
    pub ops_monitor_interval_s: u64,
    pub ops_stale_job_timeout_m: u64,
    pub ops_max_failed_jobs_hour: u32,
    pub ops_webhook_url: Option<String>,
}

impl Config {
    /// Load configuration from the environment, falling back to `.env` if present.
    pub fn from_env() -> Self {
        let _ = dotenv();

        Self {
            database_path: env_or("DATABASE_PATH", "data/nexaas.db"),
            engine_tick_seconds: env_parsed("ENGINE_TICK_SECONDS", 30),
            worker_pool_size: env_parsed("WORKER_POOL_SIZE", 1),
            ops_monitor_enabled: env_parsed("OPS_MONITOR_ENABLED", true),
            ops_monitor_interval_s: env_parsed("OPS_MONITOR_INTERVAL_S", 30),
            ops_stale_job_timeout_m: env_parsed("OPS_STALE_JOB_TIMEOUT_M", 10),
            ops_max_failed_jobs_hour: env_parsed("OPS_MAX_FAILED_JOBS_HOUR", 10),
            ops_webhook_url: env::var("OPS_WEBHOOK_URL").ok(),
        }
    }

    pub fn engine_tick(&self) -> Duration {
        Duration::from_secs(self.engine_tick_seconds)
    }

    pub fn ops_monitor_interval(&self) -> Duration {
        Duration::from_secs(self.ops_monitor_interval_s)
    }

    pub fn ops_stale_job_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.ops_stale_job_timeout_m as i64)
    }
}
