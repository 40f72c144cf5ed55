//! Shared test harness: a fake container runtime whose "containers" are
//! in-process stub agent servers bound on the mapped host ports.
#![allow(dead_code)]

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crucible::container::{
    Container, ContainerConfig, ContainerError, ContainerResult, ContainerRuntimeApi,
};
use crucible::db::Database;
use crucible::sandbox::TurnPolicy;
use crucible::sandbox::manager::{ContainerManager, ContainerManagerConfig};
use crucible::sandbox::ports::{PortAllocator, PortRange};
use crucible::sandbox::proxy::{ChatProxy, ChatProxyConfig};
use crucible::sandbox::registry::{SandboxBackend, SessionRegistry};
use crucible::sandbox::workspace::WorkspaceProvisioner;
use crucible::session::SessionRepository;
use crucible::session::models::SessionSpec;

// ============================================================================
// Stub agent
// ============================================================================

/// Shared switchboard for stub agent behavior.
#[derive(Clone)]
pub struct AgentBehavior {
    pub healthy: Arc<AtomicBool>,
}

impl AgentBehavior {
    pub fn new() -> Self {
        Self {
            healthy: Arc::new(AtomicBool::new(true)),
        }
    }
}

async fn stub_health(State(behavior): State<AgentBehavior>) -> StatusCode {
    if behavior.healthy.load(Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

async fn stub_execute(Json(_body): Json<Value>) -> Json<Value> {
    Json(json!({
        "events": [
            {"type": "text", "content": "done quickly"},
            {"type": "result", "content": "Task completed",
             "metadata": {"duration_ms": 5, "num_turns": 1}},
        ]
    }))
}

async fn stub_cancel() -> Json<Value> {
    Json(json!({"status": "success"}))
}

async fn stub_stream(
    Json(body): Json<Value>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let prompt = body
        .get("prompt")
        .and_then(|p| p.as_str())
        .unwrap_or_default()
        .to_string();

    let (tx, rx) = tokio::sync::mpsc::channel::<Value>(16);
    tokio::spawn(async move {
        if prompt.contains("hang forever") {
            let _ = tx
                .send(json!({"type": "text_delta", "content": "working"}))
                .await;
            tokio::time::sleep(Duration::from_secs(120)).await;
            return;
        }

        let script = [
            json!({"type": "text_delta", "content": "Listing"}),
            json!({"type": "text_delta", "content": " files"}),
            json!({"type": "tool_use", "content": "Using tool: Bash",
                   "tool_name": "Bash", "tool_input": {"command": "ls"},
                   "metadata": {"tool_use_id": "toolu_01"}}),
            json!({"type": "tool_result", "content": "README.md\nsrc",
                   "metadata": {"tool_use_id": "toolu_01", "is_error": false}}),
            json!({"type": "text", "content": "Listing files"}),
            json!({"type": "result", "content": "Task completed",
                   "metadata": {"duration_ms": 42, "num_turns": 1}}),
        ];
        for event in script {
            if tx.send(event).await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });

    let stream = ReceiverStream::new(rx).map(|value| Ok(Event::default().data(value.to_string())));
    Sse::new(stream)
}

fn stub_agent_router(behavior: AgentBehavior) -> axum::Router {
    use axum::routing::{get, post};
    axum::Router::new()
        .route("/health", get(stub_health))
        .route("/api/tasks/execute", post(stub_execute))
        .route("/api/tasks/stream", post(stub_stream))
        .route("/api/tasks/cancel", post(stub_cancel))
        .with_state(behavior)
}

// ============================================================================
// Fake container runtime
// ============================================================================

struct FakeContainer {
    name: String,
    session_id: String,
    server: tokio::task::JoinHandle<()>,
}

/// Container runtime fake: "starting a container" binds a stub agent server
/// on the mapped host API port; removal shuts it down again.
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, FakeContainer>>,
    behavior: AgentBehavior,
    created: AtomicUsize,
    next_id: AtomicUsize,
}

impl FakeRuntime {
    pub fn new(behavior: AgentBehavior) -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            behavior,
            created: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
        }
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    pub async fn running_count(&self) -> usize {
        self.containers.lock().await.len()
    }
}

#[async_trait]
impl ContainerRuntimeApi for FakeRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        let api_port = config
            .ports
            .iter()
            .find(|p| p.container_port == 8080)
            .map(|p| p.host_port)
            .ok_or_else(|| ContainerError::InvalidInput("no api port mapping".to_string()))?;

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", api_port))
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: "run".to_string(),
                message: format!("bind for 127.0.0.1:{api_port}: address already in use: {e}"),
            })?;

        let app = stub_agent_router(self.behavior.clone());
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        let id = format!("fake{:04}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let container = FakeContainer {
            name: config.name.clone().unwrap_or_else(|| id.clone()),
            session_id: config
                .labels
                .get("session_id")
                .cloned()
                .unwrap_or_default(),
            server,
        };

        self.containers.lock().await.insert(id.clone(), container);
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    async fn start_container(&self, _container_id: &str) -> ContainerResult<()> {
        Ok(())
    }

    async fn stop_container(
        &self,
        _container_id: &str,
        _timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> ContainerResult<()> {
        let mut containers = self.containers.lock().await;
        let by_name = containers
            .iter()
            .find(|(id, c)| *id == container_id || c.name == container_id)
            .map(|(id, _)| id.clone());
        if let Some(id) = by_name {
            if let Some(container) = containers.remove(&id) {
                container.server.abort();
            }
        }
        Ok(())
    }

    async fn list_owned(&self, _all: bool) -> ContainerResult<Vec<Container>> {
        let containers = self.containers.lock().await;
        Ok(containers
            .iter()
            .map(|(id, c)| Container {
                id: id.clone(),
                names: vec![c.name.clone()],
                image: "fake".to_string(),
                state: "running".to_string(),
                labels: HashMap::from([("session_id".to_string(), c.session_id.clone())]),
            })
            .collect())
    }

    async fn container_state_status(&self, id_or_name: &str) -> ContainerResult<Option<String>> {
        let containers = self.containers.lock().await;
        let found = containers
            .iter()
            .any(|(id, c)| id == id_or_name || c.name == id_or_name);
        Ok(found.then(|| "running".to_string()))
    }

    async fn image_exists(&self, _image: &str) -> ContainerResult<bool> {
        Ok(true)
    }
}

// ============================================================================
// Harness
// ============================================================================

pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
    listener.local_addr().unwrap().port()
}

/// Find a contiguous run of currently-free ports.
pub fn free_range(len: u16, search_from: u16) -> PortRange {
    let mut base = search_from;
    for _ in 0..5000 {
        let all_free =
            (0..len).all(|i| std::net::TcpListener::bind(("127.0.0.1", base + i)).is_ok());
        if all_free {
            return PortRange::new(base, base + len - 1);
        }
        base += len;
    }
    panic!("no free port range of {len} found");
}

pub struct Harness {
    pub backend: Arc<SandboxBackend>,
    pub runtime: Arc<FakeRuntime>,
    pub behavior: AgentBehavior,
    pub allocator: Arc<PortAllocator>,
    pub workspace_root: tempfile::TempDir,
}

pub async fn harness_with_pool(pool_size: u16) -> Harness {
    let behavior = AgentBehavior::new();
    let runtime = Arc::new(FakeRuntime::new(behavior.clone()));

    // A fresh free range per pool; another process can still grab a port in
    // the window, which surfaces as the same port-skip behavior the
    // allocator is built for.
    let api_range = free_range(pool_size, 42000);
    let code_range = free_range(pool_size, api_range.hi + 1);
    let allocator = Arc::new(PortAllocator::new(api_range, code_range));

    let manager = ContainerManager::new(
        runtime.clone(),
        allocator.clone(),
        ContainerManagerConfig {
            image: "crucible-agent:test".to_string(),
            mem_limit: "512m".to_string(),
            cpu_limit: 1.0,
            host_loopback: "http://127.0.0.1:1".to_string(),
            agent_api_key: None,
            agent_base_url: None,
            agent_model: None,
            health_check_timeout: Duration::from_secs(5),
        },
    );

    let workspace_root = tempfile::TempDir::new().unwrap();
    let workspaces = WorkspaceProvisioner::new(workspace_root.path().to_path_buf(), None, None);

    let db = Database::in_memory().await.unwrap();
    let registry = Arc::new(SessionRegistry::new(SessionRepository::new(
        db.pool().clone(),
    )));

    let backend = Arc::new(SandboxBackend::new(
        registry,
        workspaces,
        manager,
        ChatProxy::new(ChatProxyConfig {
            request_timeout: Duration::from_secs(5),
            stream_timeout: Duration::from_secs(10),
        }),
        TurnPolicy::FailFast,
        3,
    ));

    Harness {
        backend,
        runtime,
        behavior,
        allocator,
        workspace_root,
    }
}

pub async fn harness() -> Harness {
    harness_with_pool(4).await
}

pub fn spec(session_id: &str) -> SessionSpec {
    SessionSpec {
        session_id: Some(session_id.to_string()),
        name: Some(format!("test {session_id}")),
        repo_url: None,
        branch: None,
    }
}
