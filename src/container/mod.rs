//! Container runtime management module.
//!
//! Provides an async interface to manage sandbox containers via the Docker or
//! Podman CLI. The runtime is auto-detected or can be configured explicitly.

mod config;
mod error;

pub use config::{Container, ContainerConfig, PortMapping};
pub use config::{validate_container_name, validate_image_name};
pub use error::{ContainerError, ContainerResult};

use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

/// Label identifying containers owned by this service.
pub const OWNER_LABEL: &str = "crucible";

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Docker runtime (default for macOS/Windows dev)
    #[default]
    Docker,
    /// Podman runtime
    Podman,
}

impl RuntimeType {
    /// Get the default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }

    /// Whether this runtime requires SELinux volume labels (:Z suffix).
    pub fn needs_selinux_labels(&self) -> bool {
        matches!(self, RuntimeType::Podman)
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeType::Docker => write!(f, "docker"),
            RuntimeType::Podman => write!(f, "podman"),
        }
    }
}

/// Validate a container ID or name before passing it to the CLI.
fn validate_container_id_or_name(id: &str) -> ContainerResult<()> {
    if id.is_empty() {
        return Err(ContainerError::InvalidInput(
            "container ID or name cannot be empty".to_string(),
        ));
    }

    if id.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container ID or name exceeds maximum length".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !id.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "container ID or name '{}' contains invalid characters",
            id
        )));
    }

    Ok(())
}

/// Container runtime abstraction for testability.
///
/// The production implementation shells out to docker/podman; tests inject a
/// fake.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// Create and start a container, returning its ID.
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String>;

    /// Start a stopped container.
    async fn start_container(&self, container_id: &str) -> ContainerResult<()>;

    /// Gracefully stop a container.
    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()>;

    /// Remove a container.
    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()>;

    /// List containers carrying this service's owner label.
    async fn list_owned(&self, all: bool) -> ContainerResult<Vec<Container>>;

    /// Get the container state status string, `None` when it does not exist.
    async fn container_state_status(&self, id_or_name: &str) -> ContainerResult<Option<String>>;

    /// Check if an image exists locally.
    async fn image_exists(&self, image: &str) -> ContainerResult<bool>;
}

/// Container runtime client for managing sandbox containers.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    runtime_type: RuntimeType,
    binary: String,
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime {
    /// Create a new container runtime with auto-detection.
    ///
    /// Tries Docker first, then falls back to Podman.
    pub fn new() -> Self {
        if Self::is_binary_available("docker") {
            Self {
                runtime_type: RuntimeType::Docker,
                binary: "docker".to_string(),
            }
        } else if Self::is_binary_available("podman") {
            Self {
                runtime_type: RuntimeType::Podman,
                binary: "podman".to_string(),
            }
        } else {
            // Will fail at runtime with a clear error
            Self {
                runtime_type: RuntimeType::Docker,
                binary: "docker".to_string(),
            }
        }
    }

    /// Create a container runtime with a specific type.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            binary: runtime_type.default_binary().to_string(),
            runtime_type,
        }
    }

    /// Create a container runtime with a custom binary path.
    pub fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
        }
    }

    /// Get the runtime type.
    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn run(&self, command: &str, args: &[String]) -> ContainerResult<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: command.to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::CommandFailed {
                command: command.to_string(),
                message: stderr.to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Check if the container runtime is available and working.
    pub async fn health_check(&self) -> ContainerResult<String> {
        self.run(
            "version",
            &["version".to_string(), "--format".to_string(), "json".to_string()],
        )
        .await
    }
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;

        let mut args: Vec<String> = vec!["run".to_string(), "-d".to_string()];

        if let Some(ref name) = config.name {
            args.push("--name".to_string());
            args.push(name.clone());
        }

        // Owner label first so reconciliation can always filter on it
        args.push("--label".to_string());
        args.push(format!("owner={}", OWNER_LABEL));
        for (key, value) in &config.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        for port in &config.ports {
            args.push("-p".to_string());
            args.push(format!("{}:{}", port.host_port, port.container_port));
        }

        for (host, container) in &config.volumes {
            args.push("-v".to_string());
            if self.runtime_type.needs_selinux_labels() {
                args.push(format!("{}:{}:Z", host, container));
            } else {
                args.push(format!("{}:{}", host, container));
            }
        }

        for (key, value) in &config.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        if let Some(ref memory) = config.memory_limit {
            args.push("--memory".to_string());
            args.push(memory.clone());
        }

        if let Some(cpus) = config.cpu_limit {
            args.push("--cpus".to_string());
            args.push(cpus.to_string());
        }

        // No restart policy: the supervisor drives restarts explicitly
        args.push("--restart".to_string());
        args.push("no".to_string());

        args.push(config.image.clone());

        let stdout = self.run("run", &args).await?;
        Ok(stdout.trim().to_string())
    }

    async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;
        self.run(
            "start",
            &["start".to_string(), container_id.to_string()],
        )
        .await?;
        Ok(())
    }

    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let mut args: Vec<String> = vec!["stop".to_string()];
        if let Some(t) = timeout_seconds {
            args.push("-t".to_string());
            args.push(t.to_string());
        }
        args.push(container_id.to_string());

        self.run("stop", &args).await?;
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let mut args: Vec<String> = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(container_id.to_string());

        self.run("rm", &args).await?;
        Ok(())
    }

    async fn list_owned(&self, all: bool) -> ContainerResult<Vec<Container>> {
        let mut args: Vec<String> = vec![
            "ps".to_string(),
            "--filter".to_string(),
            format!("label=owner={}", OWNER_LABEL),
            "--format".to_string(),
            "json".to_string(),
        ];
        if all {
            args.push("-a".to_string());
        }

        let stdout = self.run("ps", &args).await?;
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Ok(vec![]);
        }

        // Podman emits a JSON array; docker emits one JSON object per line.
        if trimmed.starts_with('[') {
            serde_json::from_str(trimmed).map_err(|e| ContainerError::ParseError(e.to_string()))
        } else {
            trimmed
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(|line| {
                    serde_json::from_str(line)
                        .map_err(|e| ContainerError::ParseError(e.to_string()))
                })
                .collect()
        }
    }

    async fn container_state_status(&self, id_or_name: &str) -> ContainerResult<Option<String>> {
        validate_container_id_or_name(id_or_name)?;

        let output = Command::new(&self.binary)
            .args([
                "inspect",
                "--format",
                "{{.State.Status}}",
                id_or_name,
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: "inspect".to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            // Container not found is not an error; callers treat it as missing.
            return Ok(None);
        }

        let status = String::from_utf8_lossy(&output.stdout)
            .trim()
            .trim_matches('"')
            .to_string();
        if status.is_empty() {
            return Ok(None);
        }

        Ok(Some(status))
    }

    async fn image_exists(&self, image: &str) -> ContainerResult<bool> {
        validate_image_name(image)?;

        let output = Command::new(&self.binary)
            .args(["image", "inspect", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: "image inspect".to_string(),
                message: e.to_string(),
            })?;

        Ok(output.status.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_container_runtime_health_check() {
        let runtime = ContainerRuntime::new();
        // This test will only pass if docker or podman is installed
        if let Ok(version) = runtime.health_check().await {
            assert!(!version.is_empty());
        }
    }

    #[test]
    fn test_runtime_type_selinux() {
        assert!(!RuntimeType::Docker.needs_selinux_labels());
        assert!(RuntimeType::Podman.needs_selinux_labels());
    }

    #[test]
    fn test_validate_container_id_or_name() {
        assert!(validate_container_id_or_name("abc123def456").is_ok());
        assert!(validate_container_id_or_name("sandbox_s1-x").is_ok());
        assert!(validate_container_id_or_name("").is_err());
        assert!(validate_container_id_or_name("bad;id").is_err());
    }
}
