use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State, rejection::JsonRejection},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use super::stream::ndjson_response;
use crate::errors::InputError;
use crate::pipeline::{AdmissionControl, PhaseOrchestrator, PipelineSettings};

/// Seconds a client is told to wait after an admission rejection.
pub const RETRY_AFTER_SECS: u64 = 5;

/// Room for the JSON envelope around `source`.
const ENVELOPE_BYTES: usize = 1024;

/// Largest request body `/api/convert` will buffer.
///
/// Four bytes per character covers any UTF-8 source at the character limit,
/// so oversize sources still reach the character check and its message.
pub fn body_limit(settings: &PipelineSettings) -> usize {
    settings.max_source_chars.saturating_mul(4).saturating_add(ENVELOPE_BYTES)
}

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: PhaseOrchestrator,
    pub admission: AdmissionControl,
}

pub type SharedState = Arc<AppState>;

// ── Request / response types ──────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct ConvertRequest {
    pub source: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub active_sessions: usize,
    pub max_sessions: usize,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    PayloadTooLarge(String),
    Busy,
}

impl From<InputError> for ApiError {
    fn from(e: InputError) -> Self {
        match e {
            InputError::TooLarge { .. } => ApiError::PayloadTooLarge(e.to_string()),
            InputError::Empty | InputError::TooShort { .. } => ApiError::BadRequest(e.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge("Request body is too large".to_string())
        } else {
            ApiError::BadRequest(rejection.body_text())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, retryable) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, false),
            ApiError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg, false),
            ApiError::Busy => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Too many conversions in progress; try again shortly".to_string(),
                true,
            ),
        };
        let mut response = (
            status,
            Json(serde_json::json!({"error": message, "retryable": retryable})),
        )
            .into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
        }
        response
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router(body_limit: usize) -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/api/convert",
            post(convert).layer(DefaultBodyLimit::max(body_limit)),
        )
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        active_sessions: state.admission.active(),
        max_sessions: state.admission.max(),
    })
}

async fn convert(
    State(state): State<SharedState>,
    payload: Result<Json<ConvertRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    state.orchestrator.check_input(&request.source)?;
    let permit = state.admission.try_admit().ok_or_else(|| {
        tracing::warn!(
            active = state.admission.active(),
            max = state.admission.max(),
            "conversion rejected at capacity"
        );
        ApiError::Busy
    })?;
    let handle = state.orchestrator.start(request.source, permit)?;
    tracing::info!(session_id = %handle.session_id, "conversion started");
    Ok(ndjson_response(handle))
}

// ── Tests ─────────────────────────────────────────────────────────────
