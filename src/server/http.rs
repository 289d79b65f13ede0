//! HTTP handlers

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

use crate::error::TelemetryError;
use crate::normalize::{is_reserved_label, ErrorEvent, InputEvent, OutputEvent};
use crate::server::ServerState;
use crate::tracker::Notice;

/// Start-session request
#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    pub app: String,
    /// Query-string parameters the app was opened with
    #[serde(default)]
    pub query: HashMap<String, String>,
}

/// Input change reported by the app
#[derive(Debug, Deserialize)]
pub struct InputRequest {
    pub name: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default, rename = "type")]
    pub input_type: String,
    #[serde(default)]
    pub binding: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct ErrorRequest {
    pub name: String,
    pub error: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct OutputRequest {
    pub name: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub binding: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub answer: Map<String, Value>,
    pub solution: Map<String, Value>,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct QuitParams {
    /// Seconds before the idle check; -1 disables it
    pub delay: Option<i64>,
}

/// Status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub version: String,
    pub active_sessions: usize,
}

#[derive(Debug, Serialize)]
pub struct RecordResponse {
    pub recorded: bool,
}

#[derive(Debug, Serialize)]
pub struct QuitResponse {
    pub notice: Notice,
    pub shutdown_scheduled: bool,
}

/// Error wrapper mapping telemetry errors onto status codes
pub struct ApiError(TelemetryError);

impl From<TelemetryError> for ApiError {
    fn from(e: TelemetryError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            TelemetryError::InvalidArgument(msg) if msg.starts_with("unknown session") => StatusCode::NOT_FOUND,
            TelemetryError::InvalidArgument(_) | TelemetryError::Parse(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub async fn status_handler(State(state): State<ServerState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok".to_string(),
        version: crate::VERSION.to_string(),
        active_sessions: state.tracker.active_sessions().await,
    })
}

pub async fn start_session_handler(
    State(state): State<ServerState>,
    Json(req): Json<StartSessionRequest>,
) -> impl IntoResponse {
    let start = state.tracker.start_session(&req.app, &req.query).await;
    (StatusCode::CREATED, Json(start))
}

pub async fn end_session_handler(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> Response {
    match state.tracker.end_session(&id).await {
        Some(transferred) => Json(json!({ "transferred": transferred })).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown session '{}'", id) })),
        ).into_response(),
    }
}

pub async fn input_handler(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Json(req): Json<InputRequest>,
) -> Result<Json<RecordResponse>, ApiError> {
    // Results and quits only enter through their own routes
    if is_reserved_label(&req.name) {
        return Err(TelemetryError::invalid(format!("input name '{}' is reserved", req.name)).into());
    }

    let event = InputEvent {
        name: req.name,
        timestamp: req.timestamp.unwrap_or_else(Utc::now),
        value: req.value,
        input_type: req.input_type,
        binding: req.binding,
    };
    let recorded = state.tracker.record_input(&id, event).await?;
    Ok(Json(RecordResponse { recorded }))
}

pub async fn error_handler(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Json(req): Json<ErrorRequest>,
) -> Result<Json<RecordResponse>, ApiError> {
    let event = ErrorEvent {
        name: req.name,
        timestamp: req.timestamp.unwrap_or_else(Utc::now),
        error: req.error,
    };
    let recorded = state.tracker.record_error(&id, event).await?;
    Ok(Json(RecordResponse { recorded }))
}

pub async fn output_handler(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Json(req): Json<OutputRequest>,
) -> Result<Json<RecordResponse>, ApiError> {
    let event = OutputEvent {
        name: req.name,
        timestamp: req.timestamp.unwrap_or_else(Utc::now),
        value: req.value,
        binding: req.binding,
    };
    let recorded = state.tracker.record_output(&id, event).await?;
    Ok(Json(RecordResponse { recorded }))
}

pub async fn submit_handler(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Json(req): Json<SubmitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let submission = state.tracker
        .track_submit(&id, &req.answer, &req.solution, req.comment.as_deref())
        .await?;
    Ok(Json(submission))
}

pub async fn quit_handler(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Query(params): Query<QuitParams>,
) -> Result<Json<QuitResponse>, ApiError> {
    let outcome = state.tracker.track_quit(&id, params.delay).await?;
    Ok(Json(QuitResponse {
        notice: outcome.notice,
        shutdown_scheduled: outcome.shutdown_check.is_some(),
    }))
}
