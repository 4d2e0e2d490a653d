//! Operator session storage.
//!
//! One operator works the station at a time: at most one session may be in
//! RUNNING or VALIDATING, enforced at creation and phase change. Events are
//! append-only; "events since T" is a range scan on (session_id, created_at).

use cardmint_protocol::defaults;
use cardmint_protocol::ids::SessionId;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Pool, Sqlite};
use thiserror::Error;
use tracing::info;

use super::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionPhase {
    Prep,
    Running,
    Validating,
    Closed,
    Aborted,
}

impl SessionPhase {
    pub const ALL: [SessionPhase; 5] = [
        SessionPhase::Prep,
        SessionPhase::Running,
        SessionPhase::Validating,
        SessionPhase::Closed,
        SessionPhase::Aborted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Prep => "PREP",
            SessionPhase::Running => "RUNNING",
            SessionPhase::Validating => "VALIDATING",
            SessionPhase::Closed => "CLOSED",
            SessionPhase::Aborted => "ABORTED",
        }
    }

    pub fn parse(value: &str) -> Option<SessionPhase> {
        SessionPhase::ALL.iter().copied().find(|p| p.as_str() == value)
    }

    /// Phases covered by the single-active-session invariant.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionPhase::Running | SessionPhase::Validating)
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, SessionPhase::Closed | SessionPhase::Aborted)
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Warning,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Info => "info",
            EventLevel::Warning => "warning",
            EventLevel::Error => "error",
        }
    }
}

/// Closed set of event producers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Watcher,
    Worker,
    Inference,
    Resolver,
    Operator,
    OperatorEdit,
    Quota,
    System,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Watcher => "watcher",
            EventSource::Worker => "worker",
            EventSource::Inference => "inference",
            EventSource::Resolver => "resolver",
            EventSource::Operator => "operator",
            EventSource::OperatorEdit => "operator_edit",
            EventSource::Quota => "quota",
            EventSource::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperatorSession {
    pub id: SessionId,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub phase: SessionPhase,
    pub heartbeat_at: i64,
    pub baseline: bool,
    pub notes: Option<String>,
}

#[derive(Debug, FromRow)]
struct SessionRow {
    id: String,
    started_at: i64,
    ended_at: Option<i64>,
    phase: String,
    heartbeat_at: i64,
    baseline: i64,
    notes: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct SessionEvent {
    pub id: i64,
    pub session_id: String,
    pub created_at: i64,
    pub phase: String,
    pub level: String,
    pub source: String,
    pub message: String,
    pub payload: Option<String>,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("another session is already active")]
    AlreadyActive,
    #[error("session {0} not found")]
    NotFound(SessionId),
    #[error("phase change {0} -> {1} not allowed")]
    BadPhase(SessionPhase, SessionPhase),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

#[derive(Clone)]
pub struct SessionStore {
    pool: Pool<Sqlite>,
}

impl SessionStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Start a session in PREP.
    pub async fn create(&self, baseline: bool) -> Result<SessionId, SessionError> {
        let id = SessionId::new();
        let now = now_ms();
        sqlx::query(
            r#"
            INSERT INTO operator_sessions (id, started_at, phase, heartbeat_at, baseline)
            VALUES (?, ?, 'PREP', ?, ?)
            "#,
        )
        .bind(id.as_str())
        .bind(now)
        .bind(now)
        .bind(baseline as i64)
        .execute(&self.pool)
        .await?;
        info!("Operator session {id} created");
        Ok(id)
    }

    pub async fn get(&self, id: &SessionId) -> Result<OperatorSession, SessionError> {
        let row: Option<SessionRow> =
            sqlx::query_as("SELECT * FROM operator_sessions WHERE id = ?")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        let row = row.ok_or_else(|| SessionError::NotFound(id.clone()))?;
        Ok(OperatorSession {
            id: id.clone(),
            started_at: row.started_at,
            ended_at: row.ended_at,
            phase: SessionPhase::parse(&row.phase).unwrap_or(SessionPhase::Aborted),
            heartbeat_at: row.heartbeat_at,
            baseline: row.baseline != 0,
            notes: row.notes,
        })
    }

    /// Move a session to a new phase, holding the process-wide invariant:
    /// at most one session RUNNING or VALIDATING at any time.
    pub async fn set_phase(
        &self,
        id: &SessionId,
        next: SessionPhase,
    ) -> Result<(), SessionError> {
        let current = self.get(id).await?;
        if current.phase.is_ended() {
            return Err(SessionError::BadPhase(current.phase, next));
        }

        let mut tx = self.pool.begin().await?;
        if next.is_active() {
            let active: i64 = sqlx::query_scalar(
                r#"
                SELECT COUNT(*) FROM operator_sessions
                WHERE phase IN ('RUNNING', 'VALIDATING') AND id != ?
                "#,
            )
            .bind(id.as_str())
            .fetch_one(&mut *tx)
            .await?;
            if active > 0 {
                return Err(SessionError::AlreadyActive);
            }
        }

        let ended_at = next.is_ended().then(now_ms);
        sqlx::query(
            r#"
            UPDATE operator_sessions
            SET phase = ?, ended_at = COALESCE(?, ended_at), heartbeat_at = ?
            WHERE id = ?
            "#,
        )
        .bind(next.as_str())
        .bind(ended_at)
        .bind(now_ms())
        .bind(id.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        info!("Session {id} -> {}", next.as_str());
        Ok(())
    }

    pub async fn heartbeat(&self, id: &SessionId) -> Result<(), SessionError> {
        sqlx::query("UPDATE operator_sessions SET heartbeat_at = ? WHERE id = ?")
            .bind(now_ms())
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// A session whose heartbeat is older than the staleness window.
    pub async fn is_stale(&self, id: &SessionId) -> Result<bool, SessionError> {
        let session = self.get(id).await?;
        let cutoff = now_ms() - defaults::SESSION_HEARTBEAT_STALE_SECS * 1000;
        Ok(session.heartbeat_at < cutoff)
    }

    /// Append one event. Events are never updated or deleted individually.
    pub async fn append_event(
        &self,
        id: &SessionId,
        level: EventLevel,
        source: EventSource,
        message: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<(), SessionError> {
        let session = self.get(id).await?;
        sqlx::query(
            r#"
            INSERT INTO operator_session_events
                (session_id, created_at, phase, level, source, message, payload)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.as_str())
        .bind(now_ms())
        .bind(session.phase.as_str())
        .bind(level.as_str())
        .bind(source.as_str())
        .bind(message)
        .bind(payload.map(|p| p.to_string()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Events since a timestamp, ascending.
    pub async fn events_since(
        &self,
        id: &SessionId,
        since_ms: i64,
    ) -> Result<Vec<SessionEvent>, SessionError> {
        let events: Vec<SessionEvent> = sqlx::query_as(
            r#"
            SELECT * FROM operator_session_events
            WHERE session_id = ? AND created_at >= ?
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(id.as_str())
        .bind(since_ms)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    /// Drop ended sessions (and their events) older than the retention
    /// window.
    pub async fn prune_ended(&self, retention_ms: i64) -> Result<u64, SessionError> {
        let cutoff = now_ms() - retention_ms;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            DELETE FROM operator_session_events
            WHERE session_id IN (
                SELECT id FROM operator_sessions
                WHERE ended_at IS NOT NULL AND ended_at < ?
            )
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;
        let pruned = sqlx::query(
            "DELETE FROM operator_sessions WHERE ended_at IS NOT NULL AND ended_at < ?",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_pool;

    async fn store() -> SessionStore {
        SessionStore::new(test_pool().await)
    }

    #[tokio::test]
    async fn create_starts_in_prep() {
        let store = store().await;
        let id = store.create(false).await.unwrap();
        let session = store.get(&id).await.unwrap();
        assert_eq!(session.phase, SessionPhase::Prep);
        assert!(!session.baseline);
        assert!(session.ended_at.is_none());
    }

    #[tokio::test]
    async fn only_one_session_may_run() {
        let store = store().await;
        let first = store.create(false).await.unwrap();
        let second = store.create(false).await.unwrap();

        store.set_phase(&first, SessionPhase::Running).await.unwrap();
        let err = store
            .set_phase(&second, SessionPhase::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::AlreadyActive));

        // VALIDATING also counts against the invariant.
        store
            .set_phase(&first, SessionPhase::Validating)
            .await
            .unwrap();
        let err = store
            .set_phase(&second, SessionPhase::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::AlreadyActive));

        // Closing the first frees the slot.
        store.set_phase(&first, SessionPhase::Closed).await.unwrap();
        store.set_phase(&second, SessionPhase::Running).await.unwrap();
    }

    #[tokio::test]
    async fn ended_sessions_reject_phase_changes() {
        let store = store().await;
        let id = store.create(false).await.unwrap();
        store.set_phase(&id, SessionPhase::Aborted).await.unwrap();
        let err = store
            .set_phase(&id, SessionPhase::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::BadPhase(_, _)));
    }

    #[tokio::test]
    async fn events_are_append_only_and_range_scannable() {
        let store = store().await;
        let id = store.create(false).await.unwrap();
        store
            .append_event(&id, EventLevel::Info, EventSource::Worker, "scan started", None)
            .await
            .unwrap();
        store
            .append_event(
                &id,
                EventLevel::Warning,
                EventSource::Quota,
                "quota low",
                Some(&serde_json::json!({"remaining": 12})),
            )
            .await
            .unwrap();

        let all = store.events_since(&id, 0).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].message, "scan started");
        assert_eq!(all[1].source, "quota");
        assert!(all[1].payload.as_deref().unwrap().contains("12"));

        let future = store.events_since(&id, now_ms() + 10_000).await.unwrap();
        assert!(future.is_empty());
    }

    #[tokio::test]
    async fn stale_heartbeat_detection() {
        let store = store().await;
        let id = store.create(false).await.unwrap();
        assert!(!store.is_stale(&id).await.unwrap());

        sqlx::query("UPDATE operator_sessions SET heartbeat_at = heartbeat_at - 100000 WHERE id = ?")
            .bind(id.as_str())
            .execute(&store.pool)
            .await
            .unwrap();
        assert!(store.is_stale(&id).await.unwrap());

        store.heartbeat(&id).await.unwrap();
        assert!(!store.is_stale(&id).await.unwrap());
    }

    #[tokio::test]
    async fn prune_removes_old_ended_sessions_with_events() {
        let store = store().await;
        let id = store.create(false).await.unwrap();
        store
            .append_event(&id, EventLevel::Info, EventSource::System, "bye", None)
            .await
            .unwrap();
        store.set_phase(&id, SessionPhase::Closed).await.unwrap();

        sqlx::query("UPDATE operator_sessions SET ended_at = ended_at - 1000000 WHERE id = ?")
            .bind(id.as_str())
            .execute(&store.pool)
            .await
            .unwrap();

        assert_eq!(store.prune_ended(500_000).await.unwrap(), 1);
        assert!(matches!(
            store.get(&id).await.unwrap_err(),
            SessionError::NotFound(_)
        ));
    }
}
