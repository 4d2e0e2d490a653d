//! Primary inference path: remote, schema-constrained vision extraction.
//!
//! Upload the image, invoke the extractor with a deterministic instruction
//! and a strict response schema, then delete the uploaded artifact without
//! blocking the caller.

use crate::image::{check_upload_guardrail, ImagePayload};
use crate::outcome::{CallStats, Extraction, InferenceOutcome};
use crate::wire::WireExtraction;
use cardmint_protocol::config::InferenceConfig;
use cardmint_protocol::error::{ErrorCode, StageError};
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Deterministic system instruction: no creativity wanted, just fields.
const SYSTEM_INSTRUCTION: &str = "Extract the printed fields of the trading card in the image. \
Respond with exactly the requested JSON schema, nothing else. \
Use null for any field that is not printed or not legible. \
The rarity value must be one of the eight printed tiers or null.";

#[derive(Debug, Deserialize)]
struct UploadResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ExtractResponse {
    output: serde_json::Value,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}

pub struct PrimaryExtractor {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_upload_bytes: u64,
}

impl PrimaryExtractor {
    pub fn new(cfg: &InferenceConfig) -> anyhow::Result<PrimaryExtractor> {
        let api_key = std::env::var(&cfg.api_key_env).unwrap_or_default();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()?;
        Ok(PrimaryExtractor {
            client,
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            api_key,
            model: cfg.model.clone(),
            max_upload_bytes: cfg.max_upload_bytes,
        })
    }

    pub async fn extract(&self, image: &ImagePayload) -> InferenceOutcome {
        if let Err(err) = check_upload_guardrail(image, self.max_upload_bytes) {
            return InferenceOutcome::PermanentFail(err);
        }
        let ImagePayload::File { path, bytes } = image else {
            unreachable!("guardrail rejects inline payloads");
        };

        // Upload.
        let upload_started = Instant::now();
        let body = match tokio::fs::read(path).await {
            Ok(body) => body,
            Err(e) => {
                return InferenceOutcome::PermanentFail(StageError::new(
                    ErrorCode::Infer4xx,
                    format!("capture vanished before upload: {e}"),
                ))
            }
        };
        let part = reqwest::multipart::Part::bytes(body)
            .file_name(
                path.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "capture.jpg".to_string()),
            )
            .mime_str("image/jpeg")
            .expect("static mime type");
        let form = reqwest::multipart::Form::new().part("file", part);

        let upload = self
            .client
            .post(format!("{}/v1/files", self.endpoint))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await;
        let uploaded: UploadResponse = match self.read_json(upload).await {
            Ok(v) => v,
            Err(outcome) => return outcome,
        };
        let upload_ms = upload_started.elapsed().as_millis() as u64;

        // Invoke with the strict schema; streaming off, reasoning shallow.
        let infer_started = Instant::now();
        let request = json!({
            "model": self.model,
            "system": SYSTEM_INSTRUCTION,
            "file_id": uploaded.id,
            "stream": false,
            "reasoning_effort": "low",
            "response_schema": WireExtraction::schema(),
        });
        let response = self
            .client
            .post(format!("{}/v1/extract", self.endpoint))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await;
        let parsed: ExtractResponse = match self.read_json(response).await {
            Ok(v) => v,
            Err(outcome) => {
                self.cleanup(uploaded.id);
                return outcome;
            }
        };
        let infer_ms = infer_started.elapsed().as_millis() as u64;
        self.cleanup(uploaded.id);

        // Schema enforcement: a malformed body is a parse error, never
        // retried.
        let fields = match WireExtraction::into_fields(parsed.output) {
            Ok(fields) => fields,
            Err(e) => {
                return InferenceOutcome::PermanentFail(StageError::new(
                    ErrorCode::InferParse,
                    e.to_string(),
                ))
            }
        };

        let stats = CallStats {
            upload_bytes: *bytes,
            upload_ms,
            infer_ms,
            model: parsed.model.unwrap_or_else(|| self.model.clone()),
            input_tokens: parsed.usage.as_ref().and_then(|u| u.input_tokens),
            output_tokens: parsed.usage.as_ref().and_then(|u| u.output_tokens),
            retried: false,
        };
        debug!(upload_ms, infer_ms, model = %stats.model, "Primary extraction complete");
        InferenceOutcome::Ok(Box::new(Extraction { fields, stats }))
    }

    /// Classify transport/status failures and decode a JSON body.
    async fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        result: Result<reqwest::Response, reqwest::Error>,
    ) -> Result<T, InferenceOutcome> {
        let response = result.map_err(|e| {
            if e.is_timeout() {
                InferenceOutcome::TransientFail(StageError::new(
                    ErrorCode::InferTimeout,
                    format!("primary call timed out: {e}"),
                ))
            } else {
                // Connection-level failures behave like a 5xx.
                InferenceOutcome::TransientFail(StageError::new(
                    ErrorCode::Infer5xx,
                    format!("primary transport error: {e}"),
                ))
            }
        })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(InferenceOutcome::TransientFail(StageError::new(
                ErrorCode::Infer5xx,
                format!("primary returned {status}"),
            )));
        }
        if status.is_client_error() {
            return Err(InferenceOutcome::PermanentFail(StageError::new(
                ErrorCode::Infer4xx,
                format!("primary returned {status}"),
            )));
        }

        response.json::<T>().await.map_err(|e| {
            InferenceOutcome::PermanentFail(StageError::new(
                ErrorCode::InferParse,
                format!("primary response was not valid JSON: {e}"),
            ))
        })
    }

    /// Delete the uploaded artifact. Best effort, off the hot path.
    fn cleanup(&self, file_id: String) {
        let client = self.client.clone();
        let url = format!("{}/v1/files/{}", self.endpoint, file_id);
        let api_key = self.api_key.clone();
        tokio::spawn(async move {
            if let Err(e) = client.delete(&url).bearer_auth(&api_key).send().await {
                warn!("Failed to delete uploaded artifact {url}: {e}");
            }
        });
    }
}
