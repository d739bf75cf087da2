//! Thin CLI to run or list schema migrations against `DATABASE_PATH`,
//! trimmed from the teacher's `migrate_cli` to the single-SQLite-store
//! subset this crate needs (no multi-tenant Postgres workflow machinery).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

use server_core::config::Config;

#[derive(Parser)]
#[command(name = "migrate_cli")]
#[command(about = "Run or inspect nexaas schema migrations")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply all pending migrations.
    Run,
    /// List migrations known to the embedded migrator and their status.
    List,
}

async fn connect(database_path: &str) -> Result<SqlitePool> {
    if let Some(parent) = std::path::Path::new(database_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{database_path}"))?
        .create_if_missing(true)
        .foreign_keys(true);
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .context("failed to connect to database")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Run => cmd_run(&config.database_path).await,
        Commands::List => cmd_list(&config.database_path).await,
    }
}

async fn cmd_run(database_path: &str) -> Result<()> {
    let pool = connect(database_path).await?;
    sqlx::migrate!("./src/store/migrations").run(&pool).await?;
    println!("migrations applied");
    Ok(())
}

async fn cmd_list(database_path: &str) -> Result<()> {
    let pool = connect(database_path).await?;
    let migrator = sqlx::migrate!("./src/store/migrations");

    let applied: Vec<i64> = sqlx::query_scalar("SELECT version FROM _sqlx_migrations ORDER BY version")
        .fetch_all(&pool)
        .await
        .unwrap_or_default();

    for migration in migrator.iter() {
        let status = if applied.contains(&(migration.version)) { "applied" } else { "pending" };
        println!("{:>5}  {:<8}  {}", migration.version, status, migration.description);
    }

    Ok(())
}
