use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use tracing::info;

use braid_core::types::{SessionId, SessionRecord};

use crate::error::ApiError;
use crate::protocol::{sse_response, EventSse, SseFrame};
use crate::state::AppState;

type ApiResult<T> = Result<T, ApiError>;

// GET /api/health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Deserialize)]
pub struct ChatBody {
    #[serde(default)]
    pub session_id: Option<String>,
    pub message: String,
}

// POST /api/chat — starts or continues a session, streams the run
pub async fn chat(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChatBody>,
) -> ApiResult<EventSse> {
    let session_id = body
        .session_id
        .filter(|s| !s.trim().is_empty())
        .map(|s| SessionId::from_string(s.trim()));
    let handle = state.runtime.submit(session_id, &body.message).await?;
    info!(session_id = %handle.session_id, "Chat run started");
    let opening = SseFrame::session(&handle.session_id);
    Ok(sse_response(handle, Some(opening)))
}

#[derive(Deserialize, Default)]
pub struct CreateSessionBody {
    #[serde(default)]
    pub name: Option<String>,
}

// POST /api/sessions — body is optional
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<Json<SessionRecord>> {
    let body: CreateSessionBody = if body.is_empty() {
        CreateSessionBody::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };
    let record = state.runtime.create_session(body.name.as_deref()).await?;
    Ok(Json(record))
}

// GET /api/sessions
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> ApiResult<Json<serde_json::Value>> {
    let sessions = state.runtime.list_sessions().await?;
    Ok(Json(serde_json::json!({ "sessions": sessions })))
}

#[derive(Deserialize)]
pub struct RenameBody {
    pub name: String,
}

// PATCH /api/sessions/{id}
pub async fn rename_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<RenameBody>,
) -> ApiResult<Json<SessionRecord>> {
    let record = state
        .runtime
        .rename_session(&SessionId::from_string(&id), &body.name)
        .await?;
    Ok(Json(record))
}

// DELETE /api/sessions/{id}
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.runtime.delete_session(&SessionId::from_string(&id)).await? {
        return Err(ApiError::NotFound(format!("session {}", id)));
    }
    Ok(Json(serde_json::json!({ "deleted": true })))
}

// GET /api/sessions/{id}/history
pub async fn session_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let turns = state.runtime.history(&SessionId::from_string(&id)).await?;
    let messages: Vec<serde_json::Value> = turns
        .iter()
        .map(|t| {
            serde_json::json!({
                "role": t.role,
                "content": t.content,
                "summary": t.summary,
                "timestamp": t.timestamp,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({ "session_id": id, "messages": messages })))
}

#[derive(Deserialize)]
pub struct SendMessageBody {
    pub message: String,
}

// POST /api/sessions/{id}/messages — the session must exist
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<SendMessageBody>,
) -> ApiResult<EventSse> {
    let session_id = SessionId::from_string(&id);
    let known = state.runtime.registry().contains(&session_id)
        || state.runtime.session(&session_id).await?.is_some();
    if !known {
        return Err(ApiError::NotFound(format!("session {}", id)));
    }
    let handle = state.runtime.submit(Some(session_id), &body.message).await?;
    Ok(sse_response(handle, None))
}

// POST /api/sessions/{id}/cancel
pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<serde_json::Value> {
    let cancelled = state.runtime.cancel(&SessionId::from_string(&id));
    if cancelled {
        info!(session_id = %id, "Run cancelled by client");
    }
    Json(serde_json::json!({ "cancelled": cancelled }))
}

#[derive(Deserialize)]
pub struct TitleBody {
    pub first_message: String,
}

// POST /api/titles
pub async fn generate_title(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TitleBody>,
) -> ApiResult<EventSse> {
    let handle = state.runtime.generate_title(&body.first_message)?;
    Ok(sse_response(handle, None))
}
