//! HTTP reverse proxy for the per-session preview/code service.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{Request, StatusCode, Uri},
    response::Response,
};
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use tracing::{debug, error, warn};

use crate::session::models::SessionStatus;

use super::state::AppState;

/// Proxy requests to a session's preview/code service.
///
/// Routes: /preview/{session_id}/{*path}
pub async fn proxy_preview(
    State(state): State<AppState>,
    Path((session_id, path)): Path<(String, String)>,
    req: Request<Body>,
) -> Result<Response, StatusCode> {
    let session = state
        .backend
        .get_session(&session_id)
        .await
        .ok_or(StatusCode::NOT_FOUND)?;

    if !session.status.is_live() {
        warn!(session_id, status = %session.status, "preview requested for inactive session");
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    let code_port = session.code_port.ok_or(StatusCode::NOT_FOUND)?;
    let starting = matches!(session.status, SessionStatus::Starting);

    proxy_request(
        state.http_client.clone(),
        req,
        code_port as u16,
        &path,
        starting,
    )
    .await
}

/// Generic HTTP proxy to a localhost port.
async fn proxy_request(
    client: Client<HttpConnector, Body>,
    mut req: Request<Body>,
    target_port: u16,
    target_path: &str,
    connect_errors_as_unavailable: bool,
) -> Result<Response, StatusCode> {
    let query = req.uri().query().unwrap_or("");
    let mut target_uri = format!("http://127.0.0.1:{}/{}", target_port, target_path);
    if !query.is_empty() {
        target_uri.push('?');
        target_uri.push_str(query);
    }

    debug!("proxying request to {}", target_uri);

    let uri: Uri = target_uri.parse().map_err(|e| {
        error!("invalid target URI {}: {:?}", target_uri, e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    *req.uri_mut() = uri;

    // Ensure the Host header matches the target authority
    if let Some(authority) = req.uri().authority() {
        let value = axum::http::HeaderValue::from_str(authority.as_str()).map_err(|e| {
            error!("invalid Host header value {}: {:?}", authority.as_str(), e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
        req.headers_mut().insert(axum::http::header::HOST, value);
    }

    let response = client.request(req).await.map_err(|e| {
        error!("proxy request failed: {:?}", e);
        if connect_errors_as_unavailable && e.is_connect() {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::BAD_GATEWAY
        }
    })?;

    let (parts, body) = response.into_parts();
    Ok(Response::from_parts(parts, Body::new(body)))
}
