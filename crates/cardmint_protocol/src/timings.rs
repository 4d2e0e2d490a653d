//! Per-stage timing records persisted alongside each scan job.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferencePath {
    Primary,
    Fallback,
}

impl InferencePath {
    pub fn as_str(&self) -> &'static str {
        match self {
            InferencePath::Primary => "primary",
            InferencePath::Fallback => "fallback",
        }
    }
}

/// Outcome of a Path C set-triangulation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathCAction {
    HardFilter,
    SoftRerank,
    Discard,
    Skipped,
    Error,
}

impl PathCAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PathCAction::HardFilter => "hard_filter",
            PathCAction::SoftRerank => "soft_rerank",
            PathCAction::Discard => "discard",
            PathCAction::Skipped => "skipped",
            PathCAction::Error => "error",
        }
    }
}

/// Telemetry recorded when set disambiguation executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathCTelemetry {
    pub ran: bool,
    pub action: PathCAction,
    pub confidence: f64,
    pub set_hint: Option<String>,
    pub signals: Vec<String>,
    pub latency_ms: u64,
}

/// Stage durations for one job, all in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StageTimings {
    pub capture_ms: Option<u64>,
    pub preprocess_ms: Option<u64>,
    pub infer_ms: Option<u64>,
    pub validation_ms: Option<u64>,
    pub ui_ms: Option<u64>,
    #[serde(default)]
    pub retried_once: bool,
    pub inference_path: Option<InferencePath>,
    pub path_c: Option<PathCTelemetry>,
}

impl StageTimings {
    /// End-to-end duration derived from the recorded stages.
    pub fn total_ms(&self) -> u64 {
        [
            self.capture_ms,
            self.preprocess_ms,
            self.infer_ms,
            self.validation_ms,
            self.ui_ms,
        ]
        .iter()
        .flatten()
        .sum()
    }
}
