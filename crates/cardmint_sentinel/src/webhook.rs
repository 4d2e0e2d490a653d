//! Downstream inventory webhook.
//!
//! Terminal scans publish an inventory event to the configured URL, signed
//! with HMAC-SHA256 in the X-Signature header. Delivery is best effort:
//! a rejection is recorded but never touches local terminal state.

use crate::db::scans::ScanJob;
use cardmint_protocol::error::ErrorCode;
use cardmint_protocol::metrics::{Metrics, METRICS};
use cardmint_protocol::signing::{sign_webhook, SIGNATURE_HEADER};
use cardmint_protocol::status::JobStatus;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub uuid: String,
    pub sku: Option<String>,
    pub status: String,
    pub visibility: String,
    /// ISO-8601; receivers reject events older than their staleness window.
    pub updated_at: String,
    pub price: Option<f64>,
    pub name: Option<String>,
    pub qty: u32,
    pub category_name: String,
    pub variant_tags: Vec<String>,
}

/// Build the payload for a terminal scan.
pub fn build_payload(scan: &ScanJob, price: Option<f64>) -> WebhookPayload {
    let truth = scan.truth_core.as_ref();
    let visibility = match scan.status {
        JobStatus::Accepted => "visible",
        _ => "hidden",
    };
    WebhookPayload {
        uuid: scan.id.to_string(),
        sku: truth.and_then(|t| {
            t.accepted_set_name.as_ref().map(|set| {
                format!(
                    "{}-{}",
                    set.to_lowercase().replace(' ', "-"),
                    t.accepted_collector_no.as_deref().unwrap_or("na")
                )
            })
        }),
        status: scan.status.as_str().to_string(),
        visibility: visibility.to_string(),
        updated_at: chrono::Utc::now().to_rfc3339(),
        price,
        name: truth.map(|t| t.accepted_name.clone()),
        qty: 1,
        category_name: "trading-cards".to_string(),
        variant_tags: truth
            .map(|t| t.accepted_variant_tags.clone())
            .unwrap_or_default(),
    }
}

pub struct WebhookPublisher {
    client: reqwest::Client,
    url: String,
    secret: Vec<u8>,
}

impl WebhookPublisher {
    /// None when no URL is configured (delivery disabled).
    pub fn new(url: &str, secret: &[u8]) -> Option<WebhookPublisher> {
        if url.is_empty() {
            return None;
        }
        Some(WebhookPublisher {
            client: reqwest::Client::new(),
            url: url.to_string(),
            secret: secret.to_vec(),
        })
    }

    /// POST the signed payload. Non-2xx is WEBHOOK_REJECTED: counted,
    /// logged, and otherwise ignored.
    pub async fn deliver(&self, payload: &WebhookPayload) {
        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => {
                warn!("Webhook payload failed to serialize: {e}");
                return;
            }
        };
        let signature = sign_webhook(&self.secret, &body);

        let result = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(body)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                Metrics::inc(&METRICS.webhooks_delivered);
                info!("Webhook delivered for {}", payload.uuid);
            }
            Ok(response) => {
                Metrics::inc(&METRICS.webhooks_rejected);
                warn!(
                    code = %ErrorCode::WebhookRejected,
                    status = %response.status(),
                    "Webhook rejected for {}",
                    payload.uuid
                );
            }
            Err(e) => {
                Metrics::inc(&METRICS.webhooks_rejected);
                warn!(
                    code = %ErrorCode::WebhookRejected,
                    "Webhook delivery failed for {}: {e}",
                    payload.uuid
                );
            }
        }
    }
}
