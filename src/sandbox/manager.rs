//! Container lifecycle management for sandbox sessions.
//!
//! Drives one container per session from creation through health-checked
//! readiness to removal, against the bounded host port pools.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::container::{ContainerConfig, ContainerRuntimeApi};

use super::ports::{PoolKind, PortAllocator};
use super::{SandboxError, SandboxResult};

/// Fixed ports inside the container image.
pub const INTERNAL_API_PORT: u16 = 8080;
pub const INTERNAL_CODE_PORT: u16 = 3000;

/// Where the workspace is mounted inside the container.
pub const WORKSPACE_MOUNT_PATH: &str = "/workspace";

/// Container create retry budget for transient runtime failures.
const CREATE_RETRIES: u32 = 3;
/// Re-lease budget for port collisions discovered at container start.
const PORT_COLLISION_RETRIES: u32 = 3;

/// Settings for sandbox containers, immutable after startup.
#[derive(Debug, Clone)]
pub struct ContainerManagerConfig {
    /// Image every session container is created from.
    pub image: String,
    /// Per-container memory ceiling (e.g. "2g").
    pub mem_limit: String,
    /// Per-container CPU quota in cores.
    pub cpu_limit: f64,
    /// Address the container can use to call back into this service.
    pub host_loopback: String,
    /// Agent credentials and endpoint overrides passed into the container.
    pub agent_api_key: Option<String>,
    pub agent_base_url: Option<String>,
    pub agent_model: Option<String>,
    /// How long provisioning waits for the agent health endpoint.
    pub health_check_timeout: Duration,
}

/// Handle to a provisioned container.
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub container_id: String,
    pub container_name: String,
    pub api_port: u16,
    pub code_port: u16,
}

impl ContainerHandle {
    /// Base URL for the agent API inside this container.
    pub fn api_base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.api_port)
    }

    /// Base URL for the preview/code service inside this container.
    pub fn code_base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.code_port)
    }
}

/// Manager for sandbox container lifecycle.
pub struct ContainerManager {
    runtime: Arc<dyn ContainerRuntimeApi>,
    allocator: Arc<PortAllocator>,
    http: reqwest::Client,
    config: ContainerManagerConfig,
}

impl ContainerManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntimeApi>,
        allocator: Arc<PortAllocator>,
        config: ContainerManagerConfig,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .expect("building health probe client");

        Self {
            runtime,
            allocator,
            http,
            config,
        }
    }

    pub fn allocator(&self) -> &Arc<PortAllocator> {
        &self.allocator
    }

    /// Provision a container for a session: lease ports, create, start, and
    /// wait for the agent health endpoint. On any failure the ports are
    /// released and the container removed best-effort.
    pub async fn provision(
        &self,
        session_id: &str,
        workspace_path: &str,
    ) -> SandboxResult<ContainerHandle> {
        let mut api_port = self.allocator.lease(PoolKind::Api).await?;
        let mut code_port = self.allocator.lease(PoolKind::Code).await?;

        let container_name = container_name_for(session_id);

        let mut create_attempts = 0;
        let mut collision_attempts = 0;

        let container_id = loop {
            let config = self.build_config(
                session_id,
                &container_name,
                workspace_path,
                api_port,
                code_port,
            );

            match self.runtime.create_container(&config).await {
                Ok(id) => break id,
                Err(e) if e.is_port_collision() && collision_attempts < PORT_COLLISION_RETRIES => {
                    collision_attempts += 1;
                    warn!(
                        session_id,
                        api_port, code_port, attempt = collision_attempts,
                        "port collision at container start, re-leasing"
                    );
                    // The old container may exist half-created under our name
                    let _ = self.runtime.remove_container(&container_name, true).await;

                    self.allocator.release(PoolKind::Api, api_port).await;
                    self.allocator.release(PoolKind::Code, code_port).await;
                    api_port = match self.allocator.lease(PoolKind::Api).await {
                        Ok(p) => p,
                        Err(err) => return Err(err),
                    };
                    code_port = match self.allocator.lease(PoolKind::Code).await {
                        Ok(p) => p,
                        Err(err) => {
                            self.allocator.release(PoolKind::Api, api_port).await;
                            return Err(err);
                        }
                    };
                }
                Err(e) if e.is_transient() && create_attempts < CREATE_RETRIES => {
                    create_attempts += 1;
                    warn!(
                        session_id,
                        attempt = create_attempts,
                        error = %e,
                        "transient container create failure, retrying"
                    );
                    let _ = self.runtime.remove_container(&container_name, true).await;
                    tokio::time::sleep(Duration::from_millis(500 * create_attempts as u64)).await;
                }
                Err(e) => {
                    let _ = self.runtime.remove_container(&container_name, true).await;
                    self.release_ports(api_port, code_port).await;
                    return Err(SandboxError::Provisioning(format!(
                        "creating container for session {}: {}",
                        session_id, e
                    )));
                }
            }
        };

        info!(
            session_id,
            container = %container_name,
            api_port,
            code_port,
            "container started, waiting for agent health"
        );

        if let Err(e) = self.wait_for_ready(api_port).await {
            // Cleanup: the container never became healthy
            if let Err(stop_err) = self.runtime.stop_container(&container_id, Some(5)).await {
                warn!(container = %container_name, error = %stop_err, "failed to stop unhealthy container");
            }
            if let Err(rm_err) = self.runtime.remove_container(&container_id, true).await {
                warn!(container = %container_name, error = %rm_err, "failed to remove unhealthy container");
            }
            self.release_ports(api_port, code_port).await;
            return Err(e);
        }

        Ok(ContainerHandle {
            container_id,
            container_name,
            api_port,
            code_port,
        })
    }

    fn build_config(
        &self,
        session_id: &str,
        container_name: &str,
        workspace_path: &str,
        api_port: u16,
        code_port: u16,
    ) -> ContainerConfig {
        let mut config = ContainerConfig::new(&self.config.image)
            .name(container_name)
            .label("session_id", session_id)
            .port(api_port, INTERNAL_API_PORT)
            .port(code_port, INTERNAL_CODE_PORT)
            .volume(workspace_path, WORKSPACE_MOUNT_PATH)
            .env("PORT", INTERNAL_API_PORT.to_string())
            .env("SESSION_ID", session_id)
            .env("WORKSPACE_PATH", WORKSPACE_MOUNT_PATH)
            .env("HOST_CALLBACK_URL", &self.config.host_loopback)
            .memory_limit(&self.config.mem_limit)
            .cpu_limit(self.config.cpu_limit);

        if let Some(ref key) = self.config.agent_api_key {
            config = config.env("ANTHROPIC_API_KEY", key);
        }
        if let Some(ref base_url) = self.config.agent_base_url {
            config = config.env("ANTHROPIC_BASE_URL", base_url);
        }
        if let Some(ref model) = self.config.agent_model {
            config = config.env("ANTHROPIC_MODEL", model);
        }

        config
    }

    /// Poll the in-container agent health endpoint until it answers or the
    /// configured timeout elapses.
    async fn wait_for_ready(&self, api_port: u16) -> SandboxResult<()> {
        let url = format!("http://127.0.0.1:{}/health", api_port);
        let deadline = tokio::time::Instant::now() + self.config.health_check_timeout;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let ok = self
                .http
                .get(&url)
                .send()
                .await
                .map(|res| res.status().is_success())
                .unwrap_or(false);

            if ok {
                debug!(api_port, attempts, "agent healthy");
                return Ok(());
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(SandboxError::Unhealthy(format!(
                    "agent on port {} not ready after {} attempts over {:?}",
                    api_port, attempts, self.config.health_check_timeout
                )));
            }

            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Single health probe against a running session container.
    pub async fn health(&self, handle: &ContainerHandle) -> Result<(), String> {
        let url = format!("{}/health", handle.api_base_url());
        match self.http.get(&url).send().await {
            Ok(res) if res.status().is_success() => Ok(()),
            Ok(res) => Err(format!("health endpoint returned {}", res.status())),
            Err(e) => Err(format!("health probe failed: {e}")),
        }
    }

    /// Graceful stop then forced removal; releases the ports afterwards.
    pub async fn stop(&self, handle: &ContainerHandle, grace: Duration) {
        if let Err(e) = self
            .runtime
            .stop_container(&handle.container_id, Some(grace.as_secs() as u32))
            .await
        {
            warn!(container = %handle.container_name, error = %e, "failed to stop container");
        }

        if let Err(e) = self.runtime.remove_container(&handle.container_id, true).await {
            warn!(container = %handle.container_name, error = %e, "failed to remove container");
        }

        self.release_ports(handle.api_port, handle.code_port).await;
    }

    /// Remove containers carrying our owner label whose session id is not in
    /// the live set. Returns how many were reaped.
    pub async fn reap_orphans(&self, live_session_ids: &[String]) -> usize {
        let containers = match self.runtime.list_owned(true).await {
            Ok(containers) => containers,
            Err(e) => {
                warn!(error = %e, "failed to list containers for reconciliation");
                return 0;
            }
        };

        let mut reaped = 0;
        for container in containers {
            let Some(session_id) = container.labels.get("session_id") else {
                continue;
            };
            if live_session_ids.iter().any(|id| id == session_id) {
                continue;
            }

            info!(
                container = %container.id,
                session_id,
                "removing orphan container"
            );
            if self.runtime.remove_container(&container.id, true).await.is_ok() {
                reaped += 1;
            }
        }

        reaped
    }

    async fn release_ports(&self, api_port: u16, code_port: u16) {
        self.allocator.release(PoolKind::Api, api_port).await;
        self.allocator.release(PoolKind::Code, code_port).await;
    }
}

/// Container name for a session, sanitized for the runtime's naming rules.
pub fn container_name_for(session_id: &str) -> String {
    let safe: String = session_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(12)
        .collect();
    format!("sandbox_{}", safe)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_name_sanitization() {
        assert_eq!(
            container_name_for("550e8400-e29b-41d4-a716-446655440000"),
            "sandbox_550e8400e29b"
        );
        assert_eq!(container_name_for("S1"), "sandbox_S1");
        assert_eq!(container_name_for("a_b-c.d"), "sandbox_abcd");
    }

    #[test]
    fn test_handle_urls() {
        let handle = ContainerHandle {
            container_id: "abc".to_string(),
            container_name: "sandbox_s1".to_string(),
            api_port: 10001,
            code_port: 20001,
        };
        assert_eq!(handle.api_base_url(), "http://127.0.0.1:10001");
        assert_eq!(handle.code_base_url(), "http://127.0.0.1:20001");
    }
}
