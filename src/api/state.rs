//! Shared application state for the API layer.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::TokioExecutor;
use serde_json::Value;
use tracing::info;

use crate::sandbox::ChatBackend;

/// Narrow outbound interface for container→core menu registration.
///
/// The edge layer supplies the real client; the core never reaches into
/// collaborator-owned storage itself.
#[async_trait]
pub trait MenuSink: Send + Sync {
    async fn register(&self, session_id: &str, payload: Value) -> anyhow::Result<()>;
}

/// Default sink used when no collaborator client is wired in.
pub struct LogMenuSink;

#[async_trait]
impl MenuSink for LogMenuSink {
    async fn register(&self, session_id: &str, payload: Value) -> anyhow::Result<()> {
        info!(session_id, %payload, "menu registration received");
        Ok(())
    }
}

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// The active execution backend (sandbox or local).
    pub backend: Arc<dyn ChatBackend>,
    /// Pooled HTTP client for the preview reverse proxy.
    pub http_client: Client<HttpConnector, Body>,
    /// Sink for container callbacks.
    pub menu: Arc<dyn MenuSink>,
}

impl AppState {
    pub fn new(backend: Arc<dyn ChatBackend>, menu: Arc<dyn MenuSink>) -> Self {
        let http_client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            backend,
            http_client,
            menu,
        }
    }
}
