//! Durable storage: migrations, scan jobs, work queue, operator sessions.

pub mod migrations;
pub mod queue;
pub mod scans;
pub mod sessions;

/// Current time as epoch milliseconds, the persisted timestamp format.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
