//! Service configuration.
//!
//! Loaded once at startup from a TOML file plus `CRUCIBLE_*` environment
//! overrides; immutable afterwards. Unknown keys are rejected.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::container::RuntimeType;
use crate::sandbox::TurnPolicy;
use crate::sandbox::ports::PortRange;
use crate::session::models::BackendKind;

/// Top-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub server: ServerSettings,
    pub backend: BackendSettings,
    pub container: ContainerSettings,
    pub ports: PortSettings,
    pub workspace: WorkspaceSettings,
    pub agent: AgentSettings,
    pub git: GitSettings,
    pub timeouts: TimeoutSettings,
    pub lifecycle: LifecycleSettings,
    pub database: DatabaseSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            backend: BackendSettings::default(),
            container: ContainerSettings::default(),
            ports: PortSettings::default(),
            workspace: WorkspaceSettings::default(),
            agent: AgentSettings::default(),
            git: GitSettings::default(),
            timeouts: TimeoutSettings::default(),
            lifecycle: LifecycleSettings::default(),
            database: DatabaseSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSettings {
    /// Host address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendSettings {
    /// Execution mode: `sandbox` (containers) or `local` (in-process).
    pub mode: BackendKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContainerSettings {
    /// Container image reference for session sandboxes.
    pub image: String,
    /// Container runtime type (auto-detected if not set).
    pub runtime: Option<RuntimeType>,
    /// Custom path to the container runtime binary.
    pub binary: Option<String>,
    /// Per-container memory ceiling.
    pub mem_limit: String,
    /// Per-container CPU quota in cores.
    pub cpu_limit: f64,
    /// Address containers use to call back into this service. On Linux there
    /// is no platform alias, so it must be configured explicitly.
    pub host_loopback: Option<String>,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            image: "crucible-agent:latest".to_string(),
            runtime: None,
            binary: None,
            mem_limit: "2g".to_string(),
            cpu_limit: 2.0,
            host_loopback: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PortSettings {
    /// Host port pool for the agent API port.
    pub api_range: PortRange,
    /// Host port pool for the preview/code port.
    pub code_range: PortRange,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            api_range: PortRange::new(10001, 10100),
            code_range: PortRange::new(20001, 20100),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkspaceSettings {
    /// Host base path under which per-session workspaces live.
    pub root: String,
    /// Agent configuration template copied into new workspaces.
    pub template_dir: Option<String>,
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self {
            root: "./workspaces".to_string(),
            template_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentSettings {
    /// Credential passed into containers (or the local agent process).
    pub api_key: Option<String>,
    /// Endpoint override.
    pub base_url: Option<String>,
    /// Model override.
    pub model: Option<String>,
    /// Agent CLI binary for the local backend.
    pub binary: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            model: None,
            binary: "claude".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GitSettings {
    /// Token injected into clone URLs; scrubbed before persistence.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutSettings {
    /// Per non-stream RPC, seconds.
    pub request_secs: u64,
    /// Per streamed chat turn, seconds.
    pub stream_secs: u64,
    /// Provisioning health-check budget, seconds.
    pub health_check_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            request_secs: 60,
            stream_secs: 600,
            health_check_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LifecycleSettings {
    /// Idle eviction threshold, seconds.
    pub idle_secs: u64,
    /// Supervisor pass period, seconds.
    pub sweep_secs: u64,
    /// Consecutive failed probes before a session is closed.
    pub degraded_threshold: u32,
    /// Policy for concurrent turn attempts on one session.
    pub turn_policy: TurnPolicy,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            idle_secs: 1800,
            sweep_secs: 300,
            degraded_threshold: 3,
            turn_policy: TurnPolicy::FailFast,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseSettings {
    /// SQLite file for the session repository; defaults to
    /// `{workspace.root}/sessions.db`.
    pub path: Option<String>,
}

impl Settings {
    /// Load settings from an optional TOML file plus environment overrides.
    ///
    /// Unknown keys in the file fail the load.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                File::from(path.to_path_buf())
                    .format(FileFormat::Toml)
                    .required(true),
            );
        }

        let config = builder
            .add_source(Environment::with_prefix("CRUCIBLE").separator("__"))
            .build()
            .context("loading configuration")?;

        let settings: Settings = config
            .try_deserialize()
            .context("parsing configuration (unknown keys are rejected)")?;

        settings.validate()?;
        Ok(settings)
    }

    /// Reject invalid configurations before any resource is touched.
    pub fn validate(&self) -> Result<()> {
        if self.ports.api_range.lo > self.ports.api_range.hi {
            return Err(anyhow!(
                "ports.api_range is empty: [{}, {}]",
                self.ports.api_range.lo,
                self.ports.api_range.hi
            ));
        }
        if self.ports.code_range.lo > self.ports.code_range.hi {
            return Err(anyhow!(
                "ports.code_range is empty: [{}, {}]",
                self.ports.code_range.lo,
                self.ports.code_range.hi
            ));
        }
        if self.ports.api_range.overlaps(&self.ports.code_range) {
            return Err(anyhow!(
                "ports.api_range and ports.code_range must be disjoint"
            ));
        }

        if !(self.container.cpu_limit > 0.0) {
            return Err(anyhow!("container.cpu_limit must be positive"));
        }

        if self.timeouts.request_secs == 0
            || self.timeouts.stream_secs == 0
            || self.timeouts.health_check_secs == 0
        {
            return Err(anyhow!("timeouts must be positive"));
        }

        if self.lifecycle.degraded_threshold == 0 {
            return Err(anyhow!("lifecycle.degraded_threshold must be at least 1"));
        }

        Ok(())
    }

    /// Workspace root with `~` and environment variables expanded.
    pub fn workspace_root(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.workspace.root).to_string())
    }

    /// Template directory, expanded.
    pub fn template_dir(&self) -> Option<PathBuf> {
        self.workspace
            .template_dir
            .as_ref()
            .map(|p| PathBuf::from(shellexpand::tilde(p).to_string()))
    }

    /// Session database path, expanded.
    pub fn database_path(&self) -> PathBuf {
        match self.database.path {
            Some(ref path) => PathBuf::from(shellexpand::tilde(path).to_string()),
            None => self.workspace_root().join("sessions.db"),
        }
    }

    /// Container→host callback address.
    ///
    /// macOS and Windows have a platform alias; on Linux the address is
    /// brittle to infer, so it must be set explicitly.
    pub fn host_loopback(&self) -> Result<String> {
        if let Some(ref address) = self.container.host_loopback {
            return Ok(address.clone());
        }

        if cfg!(any(target_os = "macos", target_os = "windows")) {
            Ok("http://host.docker.internal".to_string())
        } else {
            Err(anyhow!(
                "container.host_loopback must be configured on Linux (e.g. the docker bridge gateway address); it is not inferred"
            ))
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.request_secs)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.stream_secs)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.health_check_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.lifecycle.idle_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.lifecycle.sweep_secs)
    }
}
