//! Error taxonomy with stable string codes.
//!
//! Codes are the contract between stages, persistence and the operator UI;
//! they never change spelling once persisted.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error codes surfaced on jobs, metrics and session events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Primary inference call exceeded its per-call timeout. Transient.
    InferTimeout,
    /// Primary inference returned a 5xx-class error. Transient.
    Infer5xx,
    /// Primary inference returned a 4xx-class error. Non-retriable.
    Infer4xx,
    /// Image payload exceeded the pre-call guardrail. Non-retriable.
    InferOversize,
    /// Response violated the extraction schema. Non-retriable.
    InferParse,
    /// Both inference paths exhausted.
    FallbackFailed,
    /// Lease CAS failed; the worker abandons without mutation.
    LeaseLost,
    /// State machine rejected an edge; no mutation.
    InvalidTransition,
    /// Watcher dropped a capture at the depth bound.
    QueueBackpressure,
    /// No candidates above the acceptance floor.
    CatalogMiss,
    /// Downstream webhook returned non-2xx; local state unaffected.
    WebhookRejected,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InferTimeout => "INFER_TIMEOUT",
            ErrorCode::Infer5xx => "INFER_5XX",
            ErrorCode::Infer4xx => "INFER_4XX",
            ErrorCode::InferOversize => "INFER_OVERSIZE",
            ErrorCode::InferParse => "INFER_PARSE",
            ErrorCode::FallbackFailed => "FALLBACK_FAILED",
            ErrorCode::LeaseLost => "LEASE_LOST",
            ErrorCode::InvalidTransition => "INVALID_TRANSITION",
            ErrorCode::QueueBackpressure => "QUEUE_BACKPRESSURE",
            ErrorCode::CatalogMiss => "CATALOG_MISS",
            ErrorCode::WebhookRejected => "WEBHOOK_REJECTED",
        }
    }

    pub fn parse(value: &str) -> Option<ErrorCode> {
        [
            ErrorCode::InferTimeout,
            ErrorCode::Infer5xx,
            ErrorCode::Infer4xx,
            ErrorCode::InferOversize,
            ErrorCode::InferParse,
            ErrorCode::FallbackFailed,
            ErrorCode::LeaseLost,
            ErrorCode::InvalidTransition,
            ErrorCode::QueueBackpressure,
            ErrorCode::CatalogMiss,
            ErrorCode::WebhookRejected,
        ]
        .into_iter()
        .find(|c| c.as_str() == value)
    }

    /// Only transient primary-path failures are retried.
    pub fn is_retriable(&self) -> bool {
        matches!(self, ErrorCode::InferTimeout | ErrorCode::Infer5xx)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error attached to a job when a stage fails.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct StageError {
    pub code: ErrorCode,
    pub message: String,
}

impl StageError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.code.is_retriable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_strings() {
        assert_eq!(ErrorCode::InferOversize.as_str(), "INFER_OVERSIZE");
        assert_eq!(ErrorCode::parse("LEASE_LOST"), Some(ErrorCode::LeaseLost));
        assert_eq!(ErrorCode::parse("NOPE"), None);
    }

    #[test]
    fn only_transient_codes_retry() {
        assert!(ErrorCode::InferTimeout.is_retriable());
        assert!(ErrorCode::Infer5xx.is_retriable());
        assert!(!ErrorCode::Infer4xx.is_retriable());
        assert!(!ErrorCode::InferOversize.is_retriable());
        assert!(!ErrorCode::InferParse.is_retriable());
    }

    #[test]
    fn stage_error_displays_code_and_message() {
        let err = StageError::new(ErrorCode::InferParse, "missing field `name`");
        assert_eq!(err.to_string(), "INFER_PARSE: missing field `name`");
    }
}
