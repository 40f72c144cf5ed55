//! Container configuration types and input validation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::error::{ContainerError, ContainerResult};

/// Port mapping configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port on the host.
    pub host_port: u16,
    /// Port in the container.
    pub container_port: u16,
}

impl PortMapping {
    /// Create a new TCP port mapping.
    pub fn new(host_port: u16, container_port: u16) -> Self {
        Self {
            host_port,
            container_port,
        }
    }
}

/// Configuration for creating a new sandbox container.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    /// Container name (optional).
    pub name: Option<String>,
    /// OCI image to use.
    pub image: String,
    /// Environment variables.
    pub env: HashMap<String, String>,
    /// Port mappings.
    pub ports: Vec<PortMapping>,
    /// Volume mounts (host_path -> container_path).
    pub volumes: Vec<(String, String)>,
    /// Labels for external reconciliation.
    pub labels: HashMap<String, String>,
    /// Memory ceiling (e.g. "2g").
    pub memory_limit: Option<String>,
    /// CPU quota (e.g. 2.0 cores).
    pub cpu_limit: Option<f64>,
}

impl ContainerConfig {
    /// Create a new container config with the given image.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Validate all container configuration fields.
    ///
    /// Must be called before creating a container so no unvetted input
    /// reaches the runtime CLI.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image)?;

        if let Some(ref name) = self.name {
            validate_container_name(name)?;
        }

        for key in self.env.keys() {
            validate_env_var_key(key)?;
        }

        for (host_path, container_path) in &self.volumes {
            validate_volume_path(host_path, "host")?;
            validate_volume_path(container_path, "container")?;
        }

        if let Some(ref memory) = self.memory_limit {
            validate_memory_limit(memory)?;
        }

        if let Some(cpus) = self.cpu_limit {
            if !(cpus > 0.0) {
                return Err(ContainerError::InvalidInput(
                    "cpu limit must be positive".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Set the container name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add a port mapping.
    pub fn port(mut self, host_port: u16, container_port: u16) -> Self {
        self.ports.push(PortMapping::new(host_port, container_port));
        self
    }

    /// Add a volume mount.
    pub fn volume(
        mut self,
        host_path: impl Into<String>,
        container_path: impl Into<String>,
    ) -> Self {
        self.volumes.push((host_path.into(), container_path.into()));
        self
    }

    /// Add a label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Set the memory ceiling.
    pub fn memory_limit(mut self, limit: impl Into<String>) -> Self {
        self.memory_limit = Some(limit.into());
        self
    }

    /// Set the CPU quota.
    pub fn cpu_limit(mut self, cpus: f64) -> Self {
        self.cpu_limit = Some(cpus);
        self
    }
}

/// Container information from `ps --format json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Container {
    /// Container ID.
    #[serde(alias = "Id", alias = "ID")]
    pub id: String,

    /// Container names. Docker emits a single string, podman a list.
    #[serde(default, deserialize_with = "deserialize_names")]
    pub names: Vec<String>,

    /// Image used.
    #[serde(default)]
    pub image: String,

    /// State string (e.g. "running", "exited").
    #[serde(default)]
    pub state: String,

    /// Labels attached at creation.
    #[serde(default, deserialize_with = "deserialize_labels")]
    pub labels: HashMap<String, String>,
}

fn deserialize_names<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Names {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Names::deserialize(deserializer)? {
        Names::One(name) => name.split(',').map(|s| s.trim().to_string()).collect(),
        Names::Many(names) => names,
    })
}

// Docker emits labels as one "k=v,k2=v2" string, podman as a map.
fn deserialize_labels<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Labels {
        Joined(String),
        Map(HashMap<String, String>),
    }

    Ok(match Option::<Labels>::deserialize(deserializer)? {
        Some(Labels::Map(map)) => map,
        Some(Labels::Joined(joined)) => joined
            .split(',')
            .filter_map(|pair| {
                let (key, value) = pair.split_once('=')?;
                Some((key.trim().to_string(), value.trim().to_string()))
            })
            .collect(),
        None => HashMap::new(),
    })
}

// ============================================================================
// Input validation
// ============================================================================

/// Validate an OCI image name.
///
/// Image names follow the pattern: `[registry/][namespace/]name[:tag][@digest]`
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    if image.is_empty() {
        return Err(ContainerError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }

    if image.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }

    let valid_chars = |c: char| {
        c.is_ascii_alphanumeric()
            || c == '.'
            || c == '-'
            || c == '_'
            || c == '/'
            || c == ':'
            || c == '@'
    };

    if !image.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{}' contains invalid characters; only alphanumeric, '.', '-', '_', '/', ':', '@' are allowed",
            image
        )));
    }

    if image.contains("..") {
        return Err(ContainerError::InvalidInput(
            "image name cannot contain '..'".to_string(),
        ));
    }

    Ok(())
}

/// Validate a container name.
///
/// Container names must be alphanumeric with hyphens and underscores and
/// start with a letter, digit, or underscore.
pub fn validate_container_name(name: &str) -> ContainerResult<()> {
    if name.is_empty() {
        return Err(ContainerError::InvalidInput(
            "container name cannot be empty".to_string(),
        ));
    }

    if name.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container name exceeds maximum length of 128 characters".to_string(),
        ));
    }

    let first_char = name.chars().next().unwrap();
    if !first_char.is_ascii_alphanumeric() && first_char != '_' {
        return Err(ContainerError::InvalidInput(
            "container name must start with an alphanumeric character or underscore".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !name.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "container name '{}' contains invalid characters; only alphanumeric, '-', '_' are allowed",
            name
        )));
    }

    Ok(())
}

/// Validate an environment variable key per POSIX conventions.
fn validate_env_var_key(key: &str) -> ContainerResult<()> {
    if key.is_empty() {
        return Err(ContainerError::InvalidInput(
            "environment variable key cannot be empty".to_string(),
        ));
    }

    let first_char = key.chars().next().unwrap();
    if !first_char.is_ascii_alphabetic() && first_char != '_' {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{}' must start with a letter or underscore",
            key
        )));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '_';
    if !key.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{}' contains invalid characters; only alphanumeric and '_' are allowed",
            key
        )));
    }

    Ok(())
}

/// Validate a volume path (host or container side).
fn validate_volume_path(path: &str, side: &str) -> ContainerResult<()> {
    if path.is_empty() {
        return Err(ContainerError::InvalidInput(format!(
            "{} volume path cannot be empty",
            side
        )));
    }

    if path.len() > 4096 {
        return Err(ContainerError::InvalidInput(format!(
            "{} volume path exceeds maximum length of 4096 characters",
            side
        )));
    }

    if path.contains('\0') {
        return Err(ContainerError::InvalidInput(format!(
            "{} volume path cannot contain null bytes",
            side
        )));
    }

    let dangerous_chars = [
        '$', '`', '!', '&', '|', ';', '<', '>', '(', ')', '{', '}', '[', ']', '*', '?', '\\', '"',
        '\'', '\n', '\r',
    ];
    for c in dangerous_chars.iter() {
        if path.contains(*c) {
            return Err(ContainerError::InvalidInput(format!(
                "{} volume path contains dangerous character '{}'",
                side, c
            )));
        }
    }

    Ok(())
}

/// Validate a memory limit string like "512m", "2g", "4096k".
fn validate_memory_limit(limit: &str) -> ContainerResult<()> {
    if limit.is_empty() {
        return Err(ContainerError::InvalidInput(
            "memory limit cannot be empty".to_string(),
        ));
    }

    let (digits, suffix) = limit.split_at(limit.len() - 1);
    let suffix_ok = matches!(suffix, "b" | "k" | "m" | "g") || suffix.chars().all(|c| c.is_ascii_digit());
    let digits_ok = if suffix.chars().all(|c| c.is_ascii_digit()) {
        limit.chars().all(|c| c.is_ascii_digit())
    } else {
        !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
    };

    if !suffix_ok || !digits_ok {
        return Err(ContainerError::InvalidInput(format!(
            "invalid memory limit '{}'; expected digits with optional b/k/m/g suffix",
            limit
        )));
    }

    Ok(())
}

#[cfg(test)]
mod validation_tests {
    use super::*;

    #[test]
    fn test_validate_image_name_valid() {
        assert!(validate_image_name("ubuntu").is_ok());
        assert!(validate_image_name("ubuntu:latest").is_ok());
        assert!(validate_image_name("sandbox-agent:v1.2").is_ok());
        assert!(validate_image_name("myregistry.io/team/image:v1.0").is_ok());
        assert!(validate_image_name("gcr.io/project/image@sha256:abc123").is_ok());
    }

    #[test]
    fn test_validate_image_name_invalid() {
        assert!(validate_image_name("").is_err());
        assert!(validate_image_name("image with spaces").is_err());
        assert!(validate_image_name("image;rm -rf /").is_err());
        assert!(validate_image_name("image$(whoami)").is_err());
        assert!(validate_image_name("../../../etc/passwd").is_err());
    }

    #[test]
    fn test_validate_container_name() {
        assert!(validate_container_name("sandbox_abc123").is_ok());
        assert!(validate_container_name("my-container").is_ok());
        assert!(validate_container_name("").is_err());
        assert!(validate_container_name("-starts-with-dash").is_err());
        assert!(validate_container_name("has;semicolon").is_err());
    }

    #[test]
    fn test_validate_env_var_key() {
        assert!(validate_env_var_key("ANTHROPIC_API_KEY").is_ok());
        assert!(validate_env_var_key("_PRIVATE").is_ok());
        assert!(validate_env_var_key("123VAR").is_err());
        assert!(validate_env_var_key("MY-VAR").is_err());
        assert!(validate_env_var_key("").is_err());
    }

    #[test]
    fn test_validate_volume_path() {
        assert!(validate_volume_path("/srv/workspaces/s1", "host").is_ok());
        assert!(validate_volume_path("/workspace", "container").is_ok());
        assert!(validate_volume_path("", "host").is_err());
        assert!(validate_volume_path("/path;rm -rf /", "host").is_err());
        assert!(validate_volume_path("/path\0null", "host").is_err());
    }

    #[test]
    fn test_validate_memory_limit() {
        assert!(validate_memory_limit("2g").is_ok());
        assert!(validate_memory_limit("512m").is_ok());
        assert!(validate_memory_limit("4096").is_ok());
        assert!(validate_memory_limit("").is_err());
        assert!(validate_memory_limit("2gb").is_err());
        assert!(validate_memory_limit("lots").is_err());
    }

    #[test]
    fn test_container_config_validate() {
        let config = ContainerConfig::new("sandbox-agent:latest")
            .name("sandbox_s1")
            .env("SESSION_ID", "s1")
            .volume("/srv/workspaces/s1", "/workspace")
            .memory_limit("2g")
            .cpu_limit(2.0);

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_container_config_validate_invalid_image() {
        let config = ContainerConfig::new("invalid$(whoami)");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_container_names_from_docker_string() {
        let json = r#"{"ID": "abc", "Names": "sandbox_s1", "Image": "img", "State": "running",
                       "Labels": "owner=crucible,session_id=s1"}"#;
        let container: Container = serde_json::from_str(json).unwrap();
        assert_eq!(container.names, vec!["sandbox_s1"]);
        assert_eq!(container.labels.get("session_id").map(String::as_str), Some("s1"));
    }

    #[test]
    fn test_container_names_from_podman_list() {
        let json = r#"{"Id": "abc", "Names": ["sandbox_s1"], "Image": "img", "State": "running",
                       "Labels": {"owner": "crucible", "session_id": "s1"}}"#;
        let container: Container = serde_json::from_str(json).unwrap();
        assert_eq!(container.names, vec!["sandbox_s1"]);
        assert_eq!(container.labels.get("owner").map(String::as_str), Some("crucible"));
    }
}
