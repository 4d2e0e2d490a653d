//! Inference orchestrator.
//!
//! Dispatches image-to-fields extraction across the primary remote path and
//! the local fallback, applying the single-retry policy, the pre-call
//! guardrails and the daily quota.

pub mod fallback;
pub mod image;
pub mod outcome;
pub mod primary;
pub mod quota;
pub mod wire;

pub use fallback::LocalExtractor;
pub use image::{check_upload_guardrail, ImagePayload, ImagePipeline, PassthroughPipeline};
pub use outcome::{CallStats, Directive, Extraction, InferenceOutcome};
pub use primary::PrimaryExtractor;
pub use quota::{QuotaLedger, QuotaState};

use cardmint_protocol::error::{ErrorCode, StageError};
use cardmint_protocol::fields::ExtractedFields;
use cardmint_protocol::metrics::{Metrics, METRICS};
use cardmint_protocol::timings::InferencePath;
use rand::Rng;
use std::time::Duration;
use tracing::{info, warn};

/// Extraction backend. Both paths speak the same strict wire schema. The
/// returned future must be Send so calls can run on spawned worker tasks.
pub trait Extractor: Send + Sync {
    fn extract(
        &self,
        image: &ImagePayload,
    ) -> impl std::future::Future<Output = InferenceOutcome> + Send;
}

impl Extractor for PrimaryExtractor {
    async fn extract(&self, image: &ImagePayload) -> InferenceOutcome {
        PrimaryExtractor::extract(self, image).await
    }
}

impl Extractor for LocalExtractor {
    async fn extract(&self, image: &ImagePayload) -> InferenceOutcome {
        LocalExtractor::extract(self, image).await
    }
}

/// Successful extraction with its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResult {
    pub fields: ExtractedFields,
    pub path: InferencePath,
    pub stats: CallStats,
}

pub struct Orchestrator<P, F> {
    primary: Option<P>,
    fallback: F,
    quota: QuotaLedger,
}

impl<P: Extractor, F: Extractor> Orchestrator<P, F> {
    pub fn new(primary: Option<P>, fallback: F, quota: QuotaLedger) -> Self {
        Self {
            primary,
            fallback,
            quota,
        }
    }

    /// Extract fields from a processed image.
    ///
    /// Primary first (unless disabled or out of quota), one jittered retry
    /// on transient failure, then the fallback. Oversize and parse
    /// violations terminate immediately; both paths failing surfaces
    /// `FALLBACK_FAILED`.
    pub async fn extract(&self, image: &ImagePayload) -> Result<InferenceResult, StageError> {
        let primary = match &self.primary {
            Some(primary) => match self.quota.try_consume() {
                QuotaState::Exhausted => {
                    warn!("Primary quota exhausted; routing straight to fallback");
                    None
                }
                _ => Some(primary),
            },
            None => None,
        };

        if let Some(primary) = primary {
            let mut attempt: u32 = 0;
            loop {
                let outcome = primary.extract(image).await;
                match outcome {
                    InferenceOutcome::Ok(extraction) => {
                        Metrics::inc(&METRICS.inference_primary);
                        let mut stats = extraction.stats;
                        stats.retried = attempt > 0;
                        return Ok(InferenceResult {
                            fields: extraction.fields,
                            path: InferencePath::Primary,
                            stats,
                        });
                    }
                    failed => match outcome::decide(attempt, &failed) {
                        Directive::RetryPrimary {
                            delay_min_ms,
                            delay_max_ms,
                        } => {
                            let delay =
                                rand::thread_rng().gen_range(delay_min_ms..=delay_max_ms);
                            Metrics::inc(&METRICS.inference_retries);
                            info!(attempt, delay_ms = delay, "Retrying primary extraction");
                            tokio::time::sleep(Duration::from_millis(delay)).await;
                            attempt += 1;
                        }
                        Directive::UseFallback => {
                            warn!("Primary path exhausted; deferring to fallback");
                            break;
                        }
                        Directive::Fail(_) => {
                            let err = into_error(failed);
                            return Err(err);
                        }
                    },
                }
            }
        }

        Metrics::inc(&METRICS.inference_fallback);
        match self.fallback.extract(image).await {
            InferenceOutcome::Ok(extraction) => Ok(InferenceResult {
                fields: extraction.fields,
                path: InferencePath::Fallback,
                stats: extraction.stats,
            }),
            failed => {
                let inner = into_error(failed);
                Err(StageError::new(
                    ErrorCode::FallbackFailed,
                    format!("both inference paths exhausted; last error {inner}"),
                ))
            }
        }
    }
}

fn into_error(outcome: InferenceOutcome) -> StageError {
    match outcome {
        InferenceOutcome::TransientFail(err) | InferenceOutcome::PermanentFail(err) => err,
        InferenceOutcome::Ok(_) => unreachable!("success is handled before conversion"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardmint_protocol::fields::HoloType;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn ok_outcome() -> InferenceOutcome {
        InferenceOutcome::Ok(Box::new(Extraction {
            fields: ExtractedFields {
                name: Some("Pikachu".into()),
                holo_type: HoloType::Unknown,
                ..Default::default()
            },
            stats: CallStats {
                model: "stub".into(),
                ..Default::default()
            },
        }))
    }

    fn transient() -> InferenceOutcome {
        InferenceOutcome::TransientFail(StageError::new(ErrorCode::Infer5xx, "503"))
    }

    struct Script {
        outcomes: Mutex<VecDeque<InferenceOutcome>>,
        calls: AtomicU32,
    }

    impl Script {
        fn new(outcomes: Vec<InferenceOutcome>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Extractor for Script {
        async fn extract(&self, _image: &ImagePayload) -> InferenceOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .expect("script exhausted")
        }
    }

    fn payload() -> ImagePayload {
        ImagePayload::File {
            path: PathBuf::from("/tmp/DSC00001.JPG"),
            bytes: 100_000,
        }
    }

    fn orchestrator(primary: Script, fallback: Script) -> Orchestrator<Script, Script> {
        Orchestrator::new(Some(primary), fallback, QuotaLedger::new(None, 10))
    }

    #[tokio::test(start_paused = true)]
    async fn transient_then_success_records_retry() {
        let orch = orchestrator(
            Script::new(vec![transient(), ok_outcome()]),
            Script::new(vec![]),
        );
        let result = orch.extract(&payload()).await.unwrap();
        assert_eq!(result.path, InferencePath::Primary);
        assert!(result.stats.retried);
        assert_eq!(orch.primary.as_ref().unwrap().calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn two_transient_failures_use_fallback() {
        let orch = orchestrator(
            Script::new(vec![transient(), transient()]),
            Script::new(vec![ok_outcome()]),
        );
        let result = orch.extract(&payload()).await.unwrap();
        assert_eq!(result.path, InferencePath::Fallback);
        assert_eq!(orch.primary.as_ref().unwrap().calls(), 2);
        assert_eq!(orch.fallback.calls(), 1);
    }

    #[tokio::test]
    async fn client_error_goes_to_fallback_without_retry() {
        let orch = orchestrator(
            Script::new(vec![InferenceOutcome::PermanentFail(StageError::new(
                ErrorCode::Infer4xx,
                "400",
            ))]),
            Script::new(vec![ok_outcome()]),
        );
        let result = orch.extract(&payload()).await.unwrap();
        assert_eq!(result.path, InferencePath::Fallback);
        assert_eq!(orch.primary.as_ref().unwrap().calls(), 1);
    }

    #[tokio::test]
    async fn oversize_fails_without_touching_fallback() {
        let orch = orchestrator(
            Script::new(vec![InferenceOutcome::PermanentFail(StageError::new(
                ErrorCode::InferOversize,
                "450 KiB",
            ))]),
            Script::new(vec![]),
        );
        let err = orch.extract(&payload()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InferOversize);
        assert_eq!(orch.fallback.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn both_paths_failing_is_fallback_failed() {
        let orch = orchestrator(
            Script::new(vec![transient(), transient()]),
            Script::new(vec![InferenceOutcome::PermanentFail(StageError::new(
                ErrorCode::InferParse,
                "bad json",
            ))]),
        );
        let err = orch.extract(&payload()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::FallbackFailed);
    }

    #[tokio::test]
    async fn exhausted_quota_preempts_primary() {
        let quota = QuotaLedger::new(Some(0), 0);
        let orch = Orchestrator::new(
            Some(Script::new(vec![])),
            Script::new(vec![ok_outcome()]),
            quota,
        );
        let result = orch.extract(&payload()).await.unwrap();
        assert_eq!(result.path, InferencePath::Fallback);
        assert_eq!(orch.primary.as_ref().unwrap().calls(), 0);
    }

    #[tokio::test]
    async fn no_primary_configured_uses_fallback() {
        let orch: Orchestrator<Script, Script> =
            Orchestrator::new(None, Script::new(vec![ok_outcome()]), QuotaLedger::new(None, 1));
        let result = orch.extract(&payload()).await.unwrap();
        assert_eq!(result.path, InferencePath::Fallback);
    }
}
