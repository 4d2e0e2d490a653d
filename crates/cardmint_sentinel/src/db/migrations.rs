//! Checksummed schema migrations.
//!
//! Embedded SQL applied in lexical order inside transactions. Each applied
//! migration is recorded by id and SHA-256 checksum; a checksum mismatch on
//! an already-applied id is fatal, and re-running the migrator is a no-op.
//! The specific "already exists" failure shapes left behind by pre-migrator
//! deployments are tolerated by marking the migration applied.

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use sqlx::{Pool, Sqlite};
use tracing::{info, warn};

use super::now_ms;

/// Embedded migrations, lexical order by id.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_scans",
        r#"
        CREATE TABLE scans (
            id TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'QUEUED',
            raw_image TEXT,
            processed_image TEXT,
            master_image TEXT,
            extracted_fields TEXT,
            candidates TEXT,
            timings TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            error_code TEXT,
            error_message TEXT,
            operator TEXT,
            processor_id TEXT,
            locked_at INTEGER,
            inference_path TEXT,
            accepted_name TEXT,
            accepted_hp INTEGER,
            accepted_collector_no TEXT,
            accepted_set_name TEXT,
            accepted_set_size INTEGER,
            accepted_variant_tags TEXT
        );
        CREATE INDEX ix_scans_status ON scans(status);
        CREATE INDEX ix_scans_updated ON scans(updated_at DESC);
        "#,
    ),
    (
        "0002_queue",
        r#"
        CREATE TABLE queue_jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            lane TEXT NOT NULL,
            job_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'WAITING',
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 3,
            next_attempt_at INTEGER,
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            completed_at INTEGER,
            last_error TEXT
        );
        CREATE INDEX ix_queue_pop ON queue_jobs(lane, status, priority DESC, created_at ASC);
        "#,
    ),
    (
        "0003_operator_sessions",
        r#"
        CREATE TABLE operator_sessions (
            id TEXT PRIMARY KEY,
            started_at INTEGER NOT NULL,
            ended_at INTEGER,
            phase TEXT NOT NULL DEFAULT 'PREP',
            heartbeat_at INTEGER NOT NULL,
            baseline INTEGER NOT NULL DEFAULT 0,
            notes TEXT
        );
        CREATE TABLE operator_session_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            phase TEXT NOT NULL,
            level TEXT NOT NULL,
            source TEXT NOT NULL,
            message TEXT NOT NULL,
            payload TEXT
        );
        CREATE INDEX ix_session_events_range
            ON operator_session_events(session_id, created_at);
        "#,
    ),
];

fn checksum(sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sql.as_bytes());
    hex::encode(hasher.finalize())
}

/// Apply any unapplied migration. Safe to run at every startup.
pub async fn run_migrations(pool: &Pool<Sqlite>) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            id TEXT PRIMARY KEY,
            checksum TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create schema_migrations table")?;

    debug_assert!(
        MIGRATIONS.windows(2).all(|w| w[0].0 < w[1].0),
        "migrations must be in lexical order"
    );

    for (id, sql) in MIGRATIONS {
        let expected = checksum(sql);
        let recorded: Option<String> =
            sqlx::query_scalar("SELECT checksum FROM schema_migrations WHERE id = ?")
                .bind(id)
                .fetch_optional(pool)
                .await?;

        match recorded {
            Some(actual) if actual == expected => continue,
            Some(actual) => {
                bail!(
                    "Migration {id} checksum mismatch: recorded {actual}, computed {expected}. \
                     Refusing to continue."
                );
            }
            None => {}
        }

        let mut tx = pool.begin().await?;
        let applied = match sqlx::raw_sql(sql).execute(&mut *tx).await {
            Ok(_) => true,
            Err(e) if is_already_applied_shape(&e) => {
                warn!("Migration {id} found already applied out-of-band: {e}");
                false
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Migration {id} failed"));
            }
        };
        if !applied {
            // The DDL partially exists; restart the transaction cleanly and
            // only record the marker.
            tx.rollback().await?;
            tx = pool.begin().await?;
        }

        sqlx::query("INSERT INTO schema_migrations (id, checksum, applied_at) VALUES (?, ?, ?)")
            .bind(id)
            .bind(&expected)
            .bind(now_ms())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!("Applied migration {id}");
    }

    Ok(())
}

/// Failure shapes produced when the DDL already ran without being recorded.
fn is_already_applied_shape(e: &sqlx::Error) -> bool {
    let message = e.to_string();
    message.contains("already exists") || message.contains("duplicate column name")
}
