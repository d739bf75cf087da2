//! Process entry point: load config, open the store, wire up the
//! Lifecycle, run until interrupted, shut down in order.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use server_core::config::Config;
use server_core::lifecycle::Lifecycle;
use server_core::store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true).with_line_number(true))
        .init();

    tracing::info!("starting nexaas orchestrator");

    let config = Config::from_env();
    tracing::info!(
        database_path = %config.database_path,
        engine_tick_seconds = config.engine_tick_seconds,
        worker_pool_size = config.worker_pool_size,
        ops_monitor_enabled = config.ops_monitor_enabled,
        "configuration loaded",
    );

    let store = Store::connect(&config.database_path).await?;
    let lifecycle = Lifecycle::new(&config, store);

    lifecycle.start().await;
    tracing::info!("engine, workers, and ops monitor started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    lifecycle.stop().await;
    tracing::info!("nexaas orchestrator stopped");

    Ok(())
}
