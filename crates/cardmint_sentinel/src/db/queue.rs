//! Two-lane work queue.
//!
//! Atomic job claiming via `UPDATE ... WHERE status = 'WAITING'` so parallel
//! workers never double-pop. Priority wins; FIFO within a priority class;
//! retry-delayed jobs stay invisible until their backoff expires.

use anyhow::{bail, Result};
use cardmint_protocol::defaults;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Pool, Sqlite};
use tracing::info;

use super::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    /// Ingestion events from the watcher.
    Capture,
    /// Stage pipeline work; the expensive lane.
    Processing,
}

impl Lane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Capture => "capture",
            Lane::Processing => "processing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueJobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone, FromRow)]
pub struct QueueJob {
    pub id: i64,
    pub lane: String,
    pub job_type: String,
    pub payload: String,
    pub priority: i64,
    pub status: QueueJobStatus,
    pub attempts: i64,
    pub max_attempts: i64,
    pub next_attempt_at: Option<i64>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRow, Serialize)]
pub struct QueueStats {
    pub waiting: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
}

#[derive(Clone)]
pub struct JobQueue {
    pool: Pool<Sqlite>,
    backoff_base_ms: u64,
}

impl JobQueue {
    pub fn new(pool: Pool<Sqlite>, backoff_base_ms: u64) -> Self {
        Self {
            pool,
            backoff_base_ms,
        }
    }

    /// Enqueue a job. The payload is an opaque blob with a hard size bound;
    /// anything bigger belongs on disk with a reference here.
    pub async fn push(
        &self,
        lane: Lane,
        job_type: &str,
        payload: &str,
        priority: i64,
        max_attempts: u32,
    ) -> Result<i64> {
        const MAX_PAYLOAD_BYTES: usize = 64 * 1024;
        if payload.len() > MAX_PAYLOAD_BYTES {
            bail!(
                "queue payload of {} bytes exceeds the {} byte bound",
                payload.len(),
                MAX_PAYLOAD_BYTES
            );
        }
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO queue_jobs (lane, job_type, payload, priority, max_attempts, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(lane.as_str())
        .bind(job_type)
        .bind(payload)
        .bind(priority)
        .bind(max_attempts as i64)
        .bind(now_ms())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Atomically pop the highest-priority eligible job from a lane.
    ///
    /// Eligible: WAITING, attempts below the budget, no unexpired retry
    /// delay. Ties break by creation time, then id.
    pub async fn pop(&self, lane: Lane) -> Result<Option<QueueJob>> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;

        let job_id: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM queue_jobs
            WHERE lane = ? AND status = 'WAITING'
              AND attempts < max_attempts
              AND (next_attempt_at IS NULL OR next_attempt_at <= ?)
            ORDER BY priority DESC, created_at ASC, id ASC
            LIMIT 1
            "#,
        )
        .bind(lane.as_str())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job_id) = job_id else {
            tx.commit().await?;
            return Ok(None);
        };

        let rows_affected = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'ACTIVE', started_at = ?
            WHERE id = ? AND status = 'WAITING'
            "#,
        )
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            // Claimed by another worker between select and update.
            tx.commit().await?;
            return Ok(None);
        }

        let job: QueueJob = sqlx::query_as("SELECT * FROM queue_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(job))
    }

    pub async fn complete(&self, job_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'COMPLETED', completed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(now_ms())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failure: requeue with exponential backoff while attempts
    /// remain, terminal-fail otherwise. Returns true when the job went
    /// terminal.
    pub async fn fail(&self, job_id: i64, error: &str) -> Result<bool> {
        let now = now_ms();
        let job: QueueJob = sqlx::query_as("SELECT * FROM queue_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await?;

        let attempts = job.attempts + 1;
        if attempts >= job.max_attempts {
            sqlx::query(
                r#"
                UPDATE queue_jobs
                SET status = 'FAILED', attempts = ?, completed_at = ?, last_error = ?
                WHERE id = ?
                "#,
            )
            .bind(attempts)
            .bind(now)
            .bind(error)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
            info!("Job {job_id} failed terminally after {attempts} attempts: {error}");
            return Ok(true);
        }

        let delay = backoff_delay_ms(self.backoff_base_ms, attempts as u32);
        sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'WAITING', attempts = ?, next_attempt_at = ?, last_error = ?,
                started_at = NULL
            WHERE id = ?
            "#,
        )
        .bind(attempts)
        .bind(now + delay as i64)
        .bind(error)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        info!("Job {job_id} requeued (attempt {attempts}, retry in {delay} ms): {error}");
        Ok(false)
    }

    /// Waiting depth of a lane, the backpressure signal.
    pub async fn depth(&self, lane: Lane) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queue_jobs WHERE lane = ? AND status = 'WAITING'",
        )
        .bind(lane.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    pub async fn stats(&self, lane: Lane) -> Result<QueueStats> {
        let stats: QueueStats = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'WAITING') as waiting,
                COUNT(*) FILTER (WHERE status = 'ACTIVE') as active,
                COUNT(*) FILTER (WHERE status = 'COMPLETED') as completed,
                COUNT(*) FILTER (WHERE status = 'FAILED') as failed
            FROM queue_jobs
            WHERE lane = ?
            "#,
        )
        .bind(lane.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(stats)
    }

    /// Crash recovery: jobs stuck ACTIVE past the lease window become
    /// eligible for redelivery.
    pub async fn requeue_stale_active(&self, stale_after_ms: i64) -> Result<u64> {
        let cutoff = now_ms() - stale_after_ms;
        let requeued = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'WAITING', started_at = NULL
            WHERE status = 'ACTIVE' AND started_at < ?
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if requeued > 0 {
            info!("Requeued {requeued} stale in-flight jobs");
        }
        Ok(requeued)
    }
}

/// Exponential backoff: base * 2^attempt plus 250-1250 ms jitter, capped.
pub fn backoff_delay_ms(base_ms: u64, attempt: u32) -> u64 {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(16));
    let jitter = rand::thread_rng()
        .gen_range(defaults::BACKOFF_JITTER_MIN_MS..=defaults::BACKOFF_JITTER_MAX_MS);
    exp.saturating_add(jitter).min(defaults::BACKOFF_CAP_MS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_pool;

    #[tokio::test]
    async fn pop_empty_lane_returns_none() {
        let queue = JobQueue::new(test_pool().await, 1000);
        assert!(queue.pop(Lane::Capture).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pop_respects_priority_then_fifo() {
        let queue = JobQueue::new(test_pool().await, 1000);
        queue
            .push(Lane::Processing, "scan", r#"{"n":"low"}"#, 0, 3)
            .await
            .unwrap();
        queue
            .push(Lane::Processing, "scan", r#"{"n":"high-1"}"#, 10, 3)
            .await
            .unwrap();
        queue
            .push(Lane::Processing, "scan", r#"{"n":"high-2"}"#, 10, 3)
            .await
            .unwrap();

        let first = queue.pop(Lane::Processing).await.unwrap().unwrap();
        assert_eq!(first.payload, r#"{"n":"high-1"}"#);
        let second = queue.pop(Lane::Processing).await.unwrap().unwrap();
        assert_eq!(second.payload, r#"{"n":"high-2"}"#);
        let third = queue.pop(Lane::Processing).await.unwrap().unwrap();
        assert_eq!(third.payload, r#"{"n":"low"}"#);
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected() {
        let queue = JobQueue::new(test_pool().await, 1000);
        let blob = "x".repeat(64 * 1024 + 1);
        assert!(queue
            .push(Lane::Processing, "scan", &blob, 0, 3)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn lanes_are_isolated() {
        let queue = JobQueue::new(test_pool().await, 1000);
        queue
            .push(Lane::Capture, "ingest", "{}", 0, 3)
            .await
            .unwrap();
        assert!(queue.pop(Lane::Processing).await.unwrap().is_none());
        assert!(queue.pop(Lane::Capture).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn popped_job_is_not_popped_twice() {
        let queue = JobQueue::new(test_pool().await, 1000);
        queue
            .push(Lane::Processing, "scan", "{}", 0, 3)
            .await
            .unwrap();
        assert!(queue.pop(Lane::Processing).await.unwrap().is_some());
        assert!(queue.pop(Lane::Processing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failure_requeues_with_future_delay() {
        let queue = JobQueue::new(test_pool().await, 1000);
        let id = queue
            .push(Lane::Processing, "scan", "{}", 0, 3)
            .await
            .unwrap();
        let job = queue.pop(Lane::Processing).await.unwrap().unwrap();
        assert_eq!(job.id, id);

        let terminal = queue.fail(id, "transient db error").await.unwrap();
        assert!(!terminal);

        // Delay is in the future, so the job is invisible right now.
        assert!(queue.pop(Lane::Processing).await.unwrap().is_none());

        let job: QueueJob = sqlx::query_as("SELECT * FROM queue_jobs WHERE id = ?")
            .bind(id)
            .fetch_one(&queue.pool)
            .await
            .unwrap();
        assert_eq!(job.status, QueueJobStatus::Waiting);
        assert_eq!(job.attempts, 1);
        assert!(job.next_attempt_at.unwrap() > now_ms());
    }

    #[tokio::test]
    async fn exhausted_attempts_fail_terminally() {
        let queue = JobQueue::new(test_pool().await, 1000);
        let id = queue
            .push(Lane::Processing, "scan", "{}", 0, 1)
            .await
            .unwrap();
        queue.pop(Lane::Processing).await.unwrap().unwrap();
        let terminal = queue.fail(id, "boom").await.unwrap();
        assert!(terminal);

        let stats = queue.stats(Lane::Processing).await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.waiting, 0);
    }

    #[tokio::test]
    async fn depth_counts_waiting_only() {
        let queue = JobQueue::new(test_pool().await, 1000);
        queue
            .push(Lane::Capture, "ingest", "{}", 0, 3)
            .await
            .unwrap();
        queue
            .push(Lane::Capture, "ingest", "{}", 0, 3)
            .await
            .unwrap();
        assert_eq!(queue.depth(Lane::Capture).await.unwrap(), 2);
        queue.pop(Lane::Capture).await.unwrap().unwrap();
        assert_eq!(queue.depth(Lane::Capture).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stale_active_jobs_are_redelivered() {
        let queue = JobQueue::new(test_pool().await, 1000);
        let id = queue
            .push(Lane::Processing, "scan", "{}", 0, 3)
            .await
            .unwrap();
        queue.pop(Lane::Processing).await.unwrap().unwrap();

        // Nothing is stale yet.
        assert_eq!(queue.requeue_stale_active(60_000).await.unwrap(), 0);

        sqlx::query("UPDATE queue_jobs SET started_at = started_at - 120000 WHERE id = ?")
            .bind(id)
            .execute(&queue.pool)
            .await
            .unwrap();
        assert_eq!(queue.requeue_stale_active(60_000).await.unwrap(), 1);
        assert!(queue.pop(Lane::Processing).await.unwrap().is_some());
    }

    #[test]
    fn backoff_grows_and_respects_cap() {
        for attempt in 0..10 {
            let delay = backoff_delay_ms(1000, attempt);
            assert!(delay <= defaults::BACKOFF_CAP_MS);
            if attempt == 0 {
                assert!(delay >= 1000 + defaults::BACKOFF_JITTER_MIN_MS);
                assert!(delay <= 1000 + defaults::BACKOFF_JITTER_MAX_MS);
            }
        }
        // Second attempt is at least double the base before jitter.
        let second = backoff_delay_ms(1000, 1);
        assert!(second >= 2000 + defaults::BACKOFF_JITTER_MIN_MS);
    }
}
