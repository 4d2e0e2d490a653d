//! Watcher event stream.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Minimal payload dispatched per detected capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureEvent {
    pub path: PathBuf,
    pub filename: String,
    /// Arrival timestamp, epoch milliseconds.
    pub arrived_at_ms: i64,
    /// Camera-assigned sequence number parsed from the basename.
    pub sequence: Option<u32>,
    pub fingerprint: Option<String>,
}

/// Broadcast events observers can subscribe to.
#[derive(Debug, Clone, PartialEq)]
pub enum WatcherEvent {
    Started,
    Stopped,
    Capture(CaptureEvent),
    Backpressure { depth: u64 },
    Error(String),
}
