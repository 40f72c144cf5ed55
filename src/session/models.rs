//! Session data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Execution backend tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Each session runs inside its own container.
    #[default]
    Sandbox,
    /// Each session runs in-process in the host service.
    Local,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Sandbox => write!(f, "sandbox"),
            BackendKind::Local => write!(f, "local"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sandbox" => Ok(BackendKind::Sandbox),
            "local" => Ok(BackendKind::Local),
            _ => Err(format!("unknown backend: {}", s)),
        }
    }
}

impl TryFrom<String> for BackendKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Workspace and ports are being set up.
    Provisioning,
    /// Container created, waiting for the agent to pass health checks.
    Starting,
    /// Serving turns.
    Ready,
    /// A health probe failed; still serving but suspect.
    Degraded,
    /// Teardown in progress.
    Stopping,
    /// Torn down; removed from the live map.
    Stopped,
    /// Provisioning or execution failed.
    Failed,
}

impl SessionStatus {
    /// Whether the session accepts reuse by `open_session`.
    pub fn is_live(&self) -> bool {
        matches!(self, SessionStatus::Ready | SessionStatus::Degraded)
    }

    /// Whether the session is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Stopped | SessionStatus::Failed)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Provisioning => "provisioning",
            SessionStatus::Starting => "starting",
            SessionStatus::Ready => "ready",
            SessionStatus::Degraded => "degraded",
            SessionStatus::Stopping => "stopping",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "provisioning" => Ok(SessionStatus::Provisioning),
            "starting" => Ok(SessionStatus::Starting),
            "ready" => Ok(SessionStatus::Ready),
            "degraded" => Ok(SessionStatus::Degraded),
            "stopping" => Ok(SessionStatus::Stopping),
            "stopped" => Ok(SessionStatus::Stopped),
            "failed" => Ok(SessionStatus::Failed),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

impl TryFrom<String> for SessionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A session record: the authoritative description of one isolated
/// workspace + agent instance.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SessionRecord {
    /// Opaque session ID (client-supplied or generated).
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Execution backend tag.
    #[sqlx(try_from = "String")]
    pub backend: BackendKind,
    /// Current status.
    #[sqlx(try_from = "String")]
    pub status: SessionStatus,
    /// Container ID (sandbox backend, once created).
    pub container_id: Option<String>,
    /// Container name (sandbox backend).
    pub container_name: Option<String>,
    /// Host port mapped to the agent API inside the container.
    pub api_port: Option<i64>,
    /// Host port mapped to the preview/code service inside the container.
    pub code_port: Option<i64>,
    /// Absolute workspace path on the host.
    pub workspace_path: String,
    /// Git repository URL cloned into the workspace, if any.
    pub repo_url: Option<String>,
    /// Base branch the feature branch was cut from.
    pub branch: Option<String>,
    /// When the session was created (RFC 3339).
    pub created_at: String,
    /// Last activity timestamp (RFC 3339).
    pub last_activity_at: String,
    /// When the session stopped, if it did.
    pub stopped_at: Option<String>,
    /// Error cause if the session failed.
    pub error_message: Option<String>,
}

impl SessionRecord {
    /// The feature branch checked out in the workspace clone.
    pub fn feature_branch(&self) -> Option<String> {
        self.branch
            .as_ref()
            .map(|base| format!("{}-{}", base, self.id))
    }
}

/// Request to open (get-or-create) a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSpec {
    /// Client-supplied session id; generated when absent.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Human name.
    #[serde(default)]
    pub name: Option<String>,
    /// Git repository to clone into the workspace.
    #[serde(default)]
    pub repo_url: Option<String>,
    /// Base branch to clone; the workspace checks out `{branch}-{session_id}`.
    #[serde(default)]
    pub branch: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            SessionStatus::Provisioning,
            SessionStatus::Starting,
            SessionStatus::Ready,
            SessionStatus::Degraded,
            SessionStatus::Stopping,
            SessionStatus::Stopped,
            SessionStatus::Failed,
        ] {
            let parsed: SessionStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn test_status_classification() {
        assert!(SessionStatus::Ready.is_live());
        assert!(SessionStatus::Degraded.is_live());
        assert!(!SessionStatus::Provisioning.is_live());
        assert!(SessionStatus::Stopped.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(!SessionStatus::Ready.is_terminal());
    }

    #[test]
    fn test_feature_branch_naming() {
        let record = SessionRecord {
            id: "S1".to_string(),
            name: "demo".to_string(),
            backend: BackendKind::Sandbox,
            status: SessionStatus::Ready,
            container_id: None,
            container_name: None,
            api_port: None,
            code_port: None,
            workspace_path: "/srv/workspaces/S1".to_string(),
            repo_url: Some("https://git.example/x.git".to_string()),
            branch: Some("main".to_string()),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            last_activity_at: "2026-01-01T00:00:00Z".to_string(),
            stopped_at: None,
            error_message: None,
        };
        assert_eq!(record.feature_branch().as_deref(), Some("main-S1"));
    }
}
