//! CardMint control plane.
//!
//! Owns the durable state: scan jobs, the two-lane work queue, operator
//! sessions. Runs the worker pool that advances scans through the stage
//! pipeline, and delivers terminal-state webhooks downstream.

pub mod db;
pub mod operator;
pub mod pool;
pub mod webhook;
pub mod worker;

pub use db::migrations::run_migrations;
pub use db::queue::{JobQueue, Lane, QueueJob, QueueStats};
pub use db::scans::{ScanJob, ScanPatch, ScanStore};
pub use db::sessions::{SessionPhase, SessionStore};
pub use pool::{PoolConfig, PoolEvent, WorkerPool};

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;

/// Open the SQLite store, creating the file if needed, and apply pending
/// migrations.
///
/// In-memory databases are pinned to one held connection; a pool of
/// separate `:memory:` connections would each see a different database.
pub async fn open_store(url: &str) -> Result<Pool<Sqlite>> {
    let options = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("Invalid database url: {url}"))?
        .create_if_missing(true);
    let in_memory = url.contains(":memory:");
    let pool = SqlitePoolOptions::new()
        .max_connections(if in_memory { 1 } else { 8 })
        .min_connections(if in_memory { 1 } else { 0 })
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open database: {url}"))?;
    run_migrations(&pool).await?;
    Ok(pool)
}

#[cfg(test)]
pub(crate) async fn test_pool() -> Pool<Sqlite> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .expect("in-memory sqlite");
    run_migrations(&pool).await.expect("migrations apply");
    pool
}
