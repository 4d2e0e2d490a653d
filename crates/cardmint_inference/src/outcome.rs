//! Inference outcomes and the retry policy.
//!
//! The policy is a pure state machine over `(attempt, last_outcome)`, which
//! keeps the single-retry / fallback / fail rules unit-testable without a
//! network in sight.

use cardmint_protocol::defaults;
use cardmint_protocol::error::{ErrorCode, StageError};
use cardmint_protocol::fields::ExtractedFields;

/// Per-call statistics recorded for observability.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CallStats {
    pub upload_bytes: u64,
    pub upload_ms: u64,
    pub infer_ms: u64,
    pub model: String,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub retried: bool,
}

/// Result of one extraction call.
#[derive(Debug, Clone, PartialEq)]
pub enum InferenceOutcome {
    Ok(Box<Extraction>),
    /// 5xx-class or timeout; eligible for the single retry.
    TransientFail(StageError),
    /// 4xx, oversize or parse failure; never retried on the same path.
    PermanentFail(StageError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub fields: ExtractedFields,
    pub stats: CallStats,
}

/// What the orchestrator should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Retry the primary path after a jittered delay within these bounds.
    RetryPrimary { delay_min_ms: u64, delay_max_ms: u64 },
    /// Defer to the local fallback path.
    UseFallback,
    /// Surface the error; neither path can recover.
    Fail(ErrorCode),
}

/// Decide the next step after a failed primary attempt.
///
/// Exactly one retry, and only for transient failures. A 4xx falls through
/// to the fallback immediately; oversize and parse violations terminate the
/// job without touching the fallback, since neither path can fix the input.
pub fn decide(attempt: u32, last: &InferenceOutcome) -> Directive {
    match last {
        InferenceOutcome::Ok(_) => {
            unreachable!("policy is only consulted on failure")
        }
        InferenceOutcome::TransientFail(_) if attempt == 0 => Directive::RetryPrimary {
            delay_min_ms: defaults::PRIMARY_RETRY_MIN_MS,
            delay_max_ms: defaults::PRIMARY_RETRY_MAX_MS,
        },
        InferenceOutcome::TransientFail(_) => Directive::UseFallback,
        InferenceOutcome::PermanentFail(err) => match err.code {
            ErrorCode::Infer4xx => Directive::UseFallback,
            code => Directive::Fail(code),
        },
    }
}
