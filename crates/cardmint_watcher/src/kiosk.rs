//! Kiosk HTTP callback surface.
//!
//! The kiosk posts a capture announcement; the response tells it where to
//! spool the image pair. A health probe reports watcher status and spool
//! depth for the operator console.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureRequest {
    pub uid: String,
    #[serde(default)]
    pub profile: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureResponse {
    pub ok: bool,
    pub uid: String,
    pub local: LocalPaths,
    pub profile: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LocalPaths {
    pub img: String,
    pub meta: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KioskStatus {
    Healthy,
    Degraded,
    Offline,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: KioskStatus,
    /// Queued capture pairs awaiting processing.
    pub spool_depth: u64,
    pub camera: CameraInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct CameraInfo {
    pub model: String,
    pub connected: bool,
}

/// Shared state behind the kiosk routes.
pub struct KioskState {
    pub drop_dir: PathBuf,
    pub running: Arc<AtomicBool>,
    pub spool_depth: Arc<AtomicU64>,
    pub degraded: Arc<AtomicBool>,
    pub camera_model: String,
}

pub fn kiosk_router(state: Arc<KioskState>) -> Router {
    Router::new()
        .route("/capture", post(capture))
        .route("/health", get(health))
        .with_state(state)
}

async fn capture(
    State(state): State<Arc<KioskState>>,
    Json(request): Json<CaptureRequest>,
) -> Result<Json<CaptureResponse>, StatusCode> {
    if request.uid.is_empty() || request.uid.contains(['/', '\\', '.']) {
        return Err(StatusCode::BAD_REQUEST);
    }
    if !state.running.load(Ordering::SeqCst) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    let img = state.drop_dir.join(format!("{}.JPG", request.uid));
    let meta = state.drop_dir.join(format!("{}.json", request.uid));
    Ok(Json(CaptureResponse {
        ok: true,
        uid: request.uid,
        local: LocalPaths {
            img: img.display().to_string(),
            meta: meta.display().to_string(),
        },
        profile: request.profile,
        timestamp: chrono::Utc::now().to_rfc3339(),
    }))
}

async fn health(State(state): State<Arc<KioskState>>) -> Json<HealthResponse> {
    let status = if !state.running.load(Ordering::SeqCst) {
        KioskStatus::Offline
    } else if state.degraded.load(Ordering::SeqCst) {
        KioskStatus::Degraded
    } else {
        KioskStatus::Healthy
    };
    Json(HealthResponse {
        status,
        spool_depth: state.spool_depth.load(Ordering::SeqCst),
        camera: CameraInfo {
            model: state.camera_model.clone(),
            connected: status != KioskStatus::Offline,
        },
    })
}
