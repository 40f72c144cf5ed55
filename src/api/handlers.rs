//! Edge request handlers.

use std::convert::Infallible;

use axum::{
    Json,
    extract::{Path, State},
    response::sse::{Event, Sse},
};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::info;

use crate::session::models::{SessionRecord, SessionSpec};

use super::error::{ApiError, ApiResult, Envelope};
use super::state::AppState;

/// Chat request body.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub content: String,
    #[serde(default)]
    pub task_tag: Option<String>,
}

/// Service health.
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "backend": state.backend.mode(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn session_payload(record: &SessionRecord, created: Option<bool>) -> serde_json::Value {
    let mut value = serde_json::to_value(record).unwrap_or_default();
    if let (Some(created), Some(map)) = (created, value.as_object_mut()) {
        map.insert("created".to_string(), json!(created));
    }
    value
}

/// POST /sessions — get-or-create a session.
pub async fn create_session(
    State(state): State<AppState>,
    Json(spec): Json<SessionSpec>,
) -> ApiResult<Json<Envelope>> {
    if let Some(ref id) = spec.session_id {
        if id.is_empty() || id.len() > 128 {
            return Err(ApiError::bad_request("session_id must be 1-128 characters"));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ApiError::bad_request(
                "session_id may only contain alphanumerics, '-', '_'",
            ));
        }
    }

    let (record, created) = state.backend.open_session(spec).await?;
    info!(session_id = %record.id, created, "session opened");
    Ok(Envelope::ok(session_payload(&record, Some(created))))
}

/// GET /sessions — snapshot of live sessions.
pub async fn list_sessions(State(state): State<AppState>) -> Json<Envelope> {
    let sessions = state.backend.list_sessions().await;
    let items: Vec<_> = sessions.iter().map(|s| session_payload(s, None)).collect();
    Envelope::ok(json!({ "items": items, "total": items.len() }))
}

/// GET /sessions/{id}.
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Envelope>> {
    let record = state
        .backend
        .get_session(&session_id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("session {session_id}")))?;
    Ok(Envelope::ok(session_payload(&record, None)))
}

/// DELETE /sessions/{id} — explicit deletion destroys the workspace.
pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Envelope>> {
    state.backend.delete_session(&session_id).await?;
    Ok(Envelope::ok(json!({ "id": session_id, "deleted": true })))
}

/// POST /chat/{session_id} — buffered turn for short operations.
pub async fn chat(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<ChatRequest>,
) -> ApiResult<Json<Envelope>> {
    let events = state
        .backend
        .chat(&session_id, &request.content, request.task_tag.as_deref())
        .await?;

    Ok(Envelope::ok(json!({
        "session_id": session_id,
        "events": events,
    })))
}

/// POST /chat/stream/{session_id} — server-sent event stream.
///
/// One `data: <json-event>` frame per event; the final frame is a terminal
/// `result`, `error`, or `interrupted` event.
pub async fn chat_stream(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<ChatRequest>,
) -> ApiResult<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>> {
    let stream = state
        .backend
        .chat_stream(&session_id, &request.content, request.task_tag.as_deref())
        .await?;

    let sse_stream = stream.map(|event| {
        let frame = serde_json::to_string(&event)
            .unwrap_or_else(|_| r#"{"type":"error","content":"serialization failure"}"#.to_string());
        Ok(Event::default().data(frame))
    });

    Ok(Sse::new(sse_stream))
}

/// POST /chat/interrupt/{session_id} — synchronous cancellation ack.
pub async fn interrupt_chat(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Envelope>> {
    let cancelled = state.backend.interrupt(&session_id).await?;
    Ok(Envelope::ok(json!({
        "session_id": session_id,
        "interrupted": cancelled,
    })))
}

/// GET /chat/container/{session_id}/status — container port/status info.
pub async fn container_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Envelope>> {
    let record = state
        .backend
        .get_session(&session_id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("session {session_id}")))?;

    let payload = match (record.api_port, record.code_port) {
        (Some(api_port), Some(code_port)) => json!({
            "status": record.status,
            "container_name": record.container_name,
            "api_port": api_port,
            "code_port": code_port,
            "api_url": format!("http://127.0.0.1:{api_port}"),
            "code_url": format!("http://127.0.0.1:{code_port}"),
        }),
        _ => json!({ "status": record.status }),
    };

    Ok(Envelope::ok(payload))
}

/// GET /chat/container/{session_id}/health — one health probe.
pub async fn container_health(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Envelope>> {
    let record = state
        .backend
        .get_session(&session_id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("session {session_id}")))?;

    let healthy =
        record.status.is_live() && state.backend.probe_session(&session_id).await.is_ok();
    let status = state
        .backend
        .get_session(&session_id)
        .await
        .map(|r| r.status)
        .unwrap_or(record.status);

    Ok(Envelope::ok(json!({
        "healthy": healthy,
        "status": status,
    })))
}

/// POST /internal/menu/{session_id} — container→core callback channel.
pub async fn register_menu(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(payload): Json<serde_json::Value>,
) -> ApiResult<Json<Envelope>> {
    if state.backend.get_session(&session_id).await.is_none() {
        return Err(ApiError::not_found(format!("session {session_id}")));
    }

    state
        .menu
        .register(&session_id, payload)
        .await
        .map_err(|e| ApiError::BadGateway(format!("menu registration failed: {e:#}")))?;

    Ok(Envelope::ok(json!({ "registered": true })))
}
