//! HTTP request handlers.

use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use parley_protocol::{
    ContinueChatRequest, GenerateNarrationRequest, SessionSnapshot, StartChatRequest,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use super::error::{ApiError, ApiResult, ErrorResponse};
use super::state::AppState;
use crate::narration::NARRATION_KEY_HEADER;
use crate::relay::{frame_stream, sse_response};
use crate::session::ChatStream;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct CwdResponse {
    pub cwd: String,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Start a new conversation and stream the agent's reply.
pub async fn start_chat(
    State(state): State<AppState>,
    payload: Result<Json<StartChatRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(request) = payload?;
    let stream = state.registry.begin(
        &request.prompt,
        None,
        request.options.unwrap_or_default(),
    )?;

    info!(session_id = %stream.session_id, "chat started");
    stream_response(stream)
}

/// Continue an existing conversation and stream the agent's reply.
pub async fn continue_chat(
    State(state): State<AppState>,
    payload: Result<Json<ContinueChatRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(request) = payload?;
    if request.session_id.trim().is_empty() || request.prompt.trim().is_empty() {
        return Err(ApiError::bad_request("sessionId and prompt are required"));
    }

    let stream = state.registry.begin(
        &request.prompt,
        Some(&request.session_id),
        request.options.unwrap_or_default(),
    )?;

    info!(
        session_id = %stream.session_id,
        requested = %request.session_id,
        "chat continued"
    );
    stream_response(stream)
}

fn stream_response(stream: ChatStream) -> ApiResult<Response> {
    sse_response(frame_stream(stream.messages))
        .map_err(|_| ApiError::internal("Failed to build stream response"))
}

/// List all sessions, oldest first.
pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSnapshot>> {
    Json(state.registry.list())
}

/// Get one session by its current or a previous id.
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionSnapshot>> {
    state
        .registry
        .get(&session_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Session not found"))
}

/// Abort the in-flight stream of a session.
pub async fn abort_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<MessageResponse>> {
    if state.registry.cancel(&session_id) {
        info!(session_id = %session_id, "session aborted");
        Ok(Json(MessageResponse {
            message: "Session aborted".to_string(),
        }))
    } else {
        Err(ApiError::not_found("Session not found or already completed"))
    }
}

/// The server's working directory, used by clients as the default agent cwd.
pub async fn get_cwd() -> ApiResult<Json<CwdResponse>> {
    let cwd = std::env::current_dir().map_err(|e| ApiError::Internal {
        message: "Failed to read working directory".to_string(),
        details: Some(e.to_string()),
    })?;
    Ok(Json(CwdResponse {
        cwd: cwd.display().to_string(),
    }))
}

fn narration_key(headers: &HeaderMap) -> ApiResult<String> {
    headers
        .get(NARRATION_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| ApiError::unauthorized("Narration API key is required"))
}

/// Voice-actor catalog from the narration service.
pub async fn list_actors(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let api_key = narration_key(&headers)?;
    let catalog = state
        .narration
        .list_actors(&api_key)
        .await
        .map_err(|e| ApiError::narration("Failed to fetch voice actors", e))?;
    Ok(Json(catalog))
}

/// Generate narration audio through the narration service.
pub async fn generate_narration(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<GenerateNarrationRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let api_key = narration_key(&headers)?;
    let Json(request) = payload?;
    if request.actor_id.trim().is_empty() || request.text.trim().is_empty() {
        return Err(ApiError::bad_request("actorId and text are required"));
    }

    debug!(
        actor_id = %request.actor_id,
        chars = request.text.chars().count(),
        "generating narration"
    );
    let generated = state
        .narration
        .generate(&api_key, &request)
        .await
        .map_err(|e| ApiError::narration("Failed to generate voice", e))?;
    Ok(Json(generated))
}

/// Fallback for unknown routes.
pub async fn not_found(uri: Uri) -> Response {
    let body = ErrorResponse {
        error: "Not found".to_string(),
        code: "NOT_FOUND",
        details: Some(uri.path().to_string()),
    };
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}
