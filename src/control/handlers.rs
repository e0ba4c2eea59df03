//! HTTP API handlers

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::audio::device::{list_devices, AudioDeviceInfo};
use crate::control::server::AppState;
use crate::error::{Error, SessionError};
use crate::session::{MetricsSnapshot, StreamSession, StreamState};

/// API response wrapper
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Adjustable session settings
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SettingsView {
    pub mic_gain: f32,
    pub dc_offset_removal: bool,
    pub aec_enabled: bool,
    pub aec_active: bool,
    pub volume: Option<f32>,
}

impl SettingsView {
    fn of(session: &StreamSession) -> Self {
        Self {
            mic_gain: session.mic_gain(),
            dc_offset_removal: session.dc_offset_removal(),
            aec_enabled: session.is_aec_enabled(),
            aec_active: session.is_aec_active(),
            volume: session.volume(),
        }
    }
}

/// Session status
#[derive(Debug, Serialize)]
pub struct StatusBody {
    pub state: StreamState,
    pub mode: String,
    pub peer: Option<String>,
    pub metrics: MetricsSnapshot,
    pub settings: SettingsView,
    pub uptime_seconds: u64,
}

/// Get session status
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<ApiResponse<StatusBody>> {
    let session = &state.session;
    let status = StatusBody {
        state: session.state(),
        mode: session.mode().to_string(),
        peer: session.peer().map(|p| p.to_string()),
        metrics: session.metrics(),
        settings: SettingsView::of(session),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    };

    Json(ApiResponse::ok(status))
}

/// Get available audio devices
pub async fn get_devices() -> Json<ApiResponse<Vec<AudioDeviceInfo>>> {
    let devices = list_devices();
    Json(ApiResponse::ok(devices))
}

/// Optional explicit peer for `POST /api/start`
#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Start streaming, to the given peer or the configured one
pub async fn start_stream(
    State(state): State<Arc<AppState>>,
    body: Option<Json<StartRequest>>,
) -> (StatusCode, Json<ApiResponse<String>>) {
    let request = body.map(|Json(req)| req).unwrap_or_default();
    let session = state.session.clone();
    let default_port = state.default_peer_port;

    // Peer resolution may hit DNS and start waits on the session lock
    let result = tokio::task::spawn_blocking(move || match request.host {
        Some(host) => session.start_to(&host, request.port.unwrap_or(default_port)),
        None => session.start_configured(),
    })
    .await;

    let result = match result {
        Ok(result) => result,
        Err(e) => {
            tracing::error!("Start task failed: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error("start task failed")),
            );
        }
    };

    match result {
        Ok(peer) => (StatusCode::OK, Json(ApiResponse::ok(peer.to_string()))),
        Err(e @ Error::Session(SessionError::AlreadyStreaming)) => {
            (StatusCode::CONFLICT, Json(ApiResponse::error(e.to_string())))
        }
        Err(e @ Error::Session(SessionError::Failed)) => {
            (StatusCode::SERVICE_UNAVAILABLE, Json(ApiResponse::error(e.to_string())))
        }
        Err(e) => (StatusCode::BAD_REQUEST, Json(ApiResponse::error(e.to_string()))),
    }
}

/// Stop streaming
pub async fn stop_stream(State(state): State<Arc<AppState>>) -> Json<ApiResponse<()>> {
    let session = state.session.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || session.stop()).await {
        tracing::error!("Stop task failed: {}", e);
        return Json(ApiResponse::error("stop task failed"));
    }
    Json(ApiResponse::ok(()))
}

/// Zero packet and drop counters
pub async fn reset_counters(State(state): State<Arc<AppState>>) -> Json<ApiResponse<()>> {
    state.session.reset_counters();
    Json(ApiResponse::ok(()))
}

/// Partial settings update
#[derive(Debug, Default, Deserialize)]
pub struct SettingsUpdate {
    pub mic_gain: Option<f32>,
    pub dc_offset_removal: Option<bool>,
    pub aec_enabled: Option<bool>,
    pub volume: Option<f32>,
}

/// Apply a settings update
pub async fn update_settings(
    State(state): State<Arc<AppState>>,
    Json(update): Json<SettingsUpdate>,
) -> (StatusCode, Json<ApiResponse<SettingsView>>) {
    let session = &state.session;

    if let Some(gain) = update.mic_gain {
        if !session.set_mic_gain(gain) {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::error(format!("Invalid mic gain: {}", gain))),
            );
        }
    }
    if let Some(volume) = update.volume {
        if !session.set_volume(volume) {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::error("Volume cannot be set without a speaker")),
            );
        }
    }
    if let Some(enabled) = update.dc_offset_removal {
        session.set_dc_offset_removal(enabled);
    }
    if let Some(enabled) = update.aec_enabled {
        session.set_aec_enabled(enabled);
    }

    (StatusCode::OK, Json(ApiResponse::ok(SettingsView::of(session))))
}
