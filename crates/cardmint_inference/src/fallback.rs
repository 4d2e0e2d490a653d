//! Local fallback extractor.
//!
//! Bridges to a local extraction runtime over a subprocess: the configured
//! command receives the image path as its final argument and prints one
//! JSON document matching the wire schema on stdout.

use crate::image::ImagePayload;
use crate::outcome::{CallStats, Extraction, InferenceOutcome};
use crate::wire::WireExtraction;
use cardmint_protocol::error::{ErrorCode, StageError};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

pub struct LocalExtractor {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl LocalExtractor {
    pub fn new(command: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            args,
            timeout,
        }
    }

    pub async fn extract(&self, image: &ImagePayload) -> InferenceOutcome {
        let ImagePayload::File { path, bytes } = image else {
            return InferenceOutcome::PermanentFail(StageError::new(
                ErrorCode::Infer4xx,
                "local extractor requires a file reference",
            ));
        };

        let started = Instant::now();
        let run = Command::new(&self.command)
            .args(&self.args)
            .arg(path)
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, run).await {
            Err(_) => {
                return InferenceOutcome::TransientFail(StageError::new(
                    ErrorCode::InferTimeout,
                    format!("local extractor exceeded {:?}", self.timeout),
                ))
            }
            Ok(Err(e)) => {
                return InferenceOutcome::PermanentFail(StageError::new(
                    ErrorCode::Infer4xx,
                    format!("failed to launch local extractor: {e}"),
                ))
            }
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return InferenceOutcome::PermanentFail(StageError::new(
                ErrorCode::Infer5xx,
                format!(
                    "local extractor exited with {}: {}",
                    output.status,
                    stderr.trim()
                ),
            ));
        }

        let value: serde_json::Value = match serde_json::from_slice(&output.stdout) {
            Ok(v) => v,
            Err(e) => {
                return InferenceOutcome::PermanentFail(StageError::new(
                    ErrorCode::InferParse,
                    format!("local extractor produced invalid JSON: {e}"),
                ))
            }
        };
        let fields = match WireExtraction::into_fields(value) {
            Ok(fields) => fields,
            Err(e) => {
                return InferenceOutcome::PermanentFail(StageError::new(
                    ErrorCode::InferParse,
                    e.to_string(),
                ))
            }
        };

        let infer_ms = started.elapsed().as_millis() as u64;
        debug!(infer_ms, command = %self.command, "Fallback extraction complete");
        InferenceOutcome::Ok(Box::new(Extraction {
            fields,
            stats: CallStats {
                upload_bytes: *bytes,
                upload_ms: 0,
                infer_ms,
                model: format!("local:{}", self.command),
                input_tokens: None,
                output_tokens: None,
                retried: false,
            },
        }))
    }
}
