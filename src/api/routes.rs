//! Route table.

use axum::{
    Router,
    routing::{any, get, post},
};
use tower_http::trace::TraceLayer;

use super::handlers;
use super::proxy;
use super::state::AppState;

/// Build the edge router over the shared state.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        // Session lifecycle
        .route(
            "/sessions",
            get(handlers::list_sessions).post(handlers::create_session),
        )
        .route(
            "/sessions/{session_id}",
            get(handlers::get_session).delete(handlers::delete_session),
        )
        // Chat traffic
        .route("/chat/{session_id}", post(handlers::chat))
        .route("/chat/stream/{session_id}", post(handlers::chat_stream))
        .route(
            "/chat/interrupt/{session_id}",
            post(handlers::interrupt_chat),
        )
        .route(
            "/chat/container/{session_id}/status",
            get(handlers::container_status),
        )
        .route(
            "/chat/container/{session_id}/health",
            get(handlers::container_health),
        )
        // Preview pass-through to the session's code service
        .route("/preview/{session_id}/{*path}", any(proxy::proxy_preview))
        // Container → core callback channel
        .route("/internal/menu/{session_id}", post(handlers::register_menu))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
