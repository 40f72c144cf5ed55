//! The sandbox session executor core.
//!
//! Components: session registry, port allocator, workspace provisioner,
//! container manager, chat proxy, lifecycle supervisor, and the legacy local
//! executor. Both execution backends implement the same [`ChatBackend`]
//! surface so edge handlers never branch on the deployment mode.

pub mod events;
pub mod local;
pub mod manager;
pub mod ports;
pub mod proxy;
pub mod registry;
pub mod supervisor;
pub mod workspace;

use std::pin::Pin;

use async_trait::async_trait;
use thiserror::Error;
use tokio_stream::Stream;

use crate::session::models::{SessionRecord, SessionSpec};
use events::ChatEvent;

/// Result type for sandbox operations.
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Lazy, finite stream of chat events. Non-restartable; ends after the
/// terminal event.
pub type EventStream = Pin<Box<dyn Stream<Item = ChatEvent> + Send>>;

/// Error taxonomy for the executor core.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Session id unknown.
    #[error("session not found: {0}")]
    NotFound(String),

    /// Concurrent turn attempt on the same session.
    #[error("session {0} has a turn in flight")]
    Busy(String),

    /// Port pool fully leased.
    #[error("port pool '{0}' exhausted")]
    PoolExhausted(&'static str),

    /// Workspace or container setup failed.
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    /// Container failed health probes.
    #[error("session unhealthy: {0}")]
    Unhealthy(String),

    /// Agent inside the container returned an error mid-turn.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Request or stream timeout.
    #[error("timed out: {0}")]
    Timeout(String),

    /// User interrupted the turn.
    #[error("cancelled")]
    Cancelled,

    /// Invalid configuration, fatal at startup.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Anything else.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Class of prompt, controlling prompt transformation before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskTag {
    /// Prompt is the absolute path of a PRD file to decompose.
    PrdDecompose,
    /// Prompt is a flag-string for module analysis.
    AnalyzePrd,
    /// Prompt is a user review instruction against an earlier decomposition.
    PrdChange,
    /// Empty prompt; confirm pending PRD edits.
    ConfirmPrd,
    /// Free-form chat, passed through untouched.
    FreeForm,
}

impl TaskTag {
    /// Parse a wire tag. Unknown or absent tags are free-form chat.
    pub fn parse(tag: Option<&str>) -> Self {
        match tag {
            Some("prd-decompose") => TaskTag::PrdDecompose,
            Some("analyze-prd") => TaskTag::AnalyzePrd,
            Some("prd-change") => TaskTag::PrdChange,
            Some("confirm-prd") => TaskTag::ConfirmPrd,
            _ => TaskTag::FreeForm,
        }
    }

    /// Rewrite the user prompt into the agent command for this task class.
    ///
    /// This is a pure command-construction step; PRD semantics live in the
    /// agent's command library, not here.
    pub fn build_prompt(&self, prompt: &str) -> String {
        match self {
            TaskTag::PrdDecompose => format!("/prd-decompose {}", prompt),
            TaskTag::AnalyzePrd => format!("/analyze-prd {}", prompt),
            TaskTag::PrdChange => format!("/prd-change {}", prompt),
            TaskTag::ConfirmPrd => "/confirm-prd".to_string(),
            TaskTag::FreeForm => prompt.to_string(),
        }
    }
}

/// How concurrent turn attempts on one session are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnPolicy {
    /// Reject the second turn with `Busy`.
    #[default]
    FailFast,
    /// Queue behind the in-flight turn.
    Queue,
}

/// The unified execution surface consumed by the edge layer.
///
/// Implemented by the sandbox (container) backend and the legacy local
/// executor.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Get an existing live session or provision a new one.
    ///
    /// Returns the session record and whether it was newly created. The whole
    /// step is serialized per session id.
    async fn open_session(&self, spec: SessionSpec) -> SandboxResult<(SessionRecord, bool)>;

    /// Look up a live (or recently failed) session.
    async fn get_session(&self, session_id: &str) -> Option<SessionRecord>;

    /// Snapshot of live sessions.
    async fn list_sessions(&self) -> Vec<SessionRecord>;

    /// Close a session: cancel any in-flight turn, tear down execution
    /// resources, release ports. Idempotent; the workspace is retained.
    async fn close_session(&self, session_id: &str, reason: &str) -> SandboxResult<()>;

    /// Explicitly delete a session: close it and destroy its workspace.
    async fn delete_session(&self, session_id: &str) -> SandboxResult<()>;

    /// Run a turn and buffer all events. For short operations only.
    async fn chat(
        &self,
        session_id: &str,
        prompt: &str,
        task_tag: Option<&str>,
    ) -> SandboxResult<Vec<ChatEvent>>;

    /// Run a turn, streaming events as they arrive. The stream always ends
    /// with exactly one terminal event.
    async fn chat_stream(
        &self,
        session_id: &str,
        prompt: &str,
        task_tag: Option<&str>,
    ) -> SandboxResult<EventStream>;

    /// Cancel the in-flight turn, if any. Returns whether one was cancelled.
    async fn interrupt(&self, session_id: &str) -> SandboxResult<bool>;

    /// Probe one session's execution health and drive degradation
    /// bookkeeping. No-op for backends without an external process.
    async fn probe_session(&self, session_id: &str) -> SandboxResult<()>;

    /// Backend mode tag.
    fn mode(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_tag_parse() {
        assert_eq!(TaskTag::parse(Some("prd-decompose")), TaskTag::PrdDecompose);
        assert_eq!(TaskTag::parse(Some("analyze-prd")), TaskTag::AnalyzePrd);
        assert_eq!(TaskTag::parse(Some("prd-change")), TaskTag::PrdChange);
        assert_eq!(TaskTag::parse(Some("confirm-prd")), TaskTag::ConfirmPrd);
        assert_eq!(TaskTag::parse(Some("chat")), TaskTag::FreeForm);
        assert_eq!(TaskTag::parse(Some("")), TaskTag::FreeForm);
        assert_eq!(TaskTag::parse(None), TaskTag::FreeForm);
    }

    #[test]
    fn test_task_tag_prompt_construction() {
        assert_eq!(
            TaskTag::PrdDecompose.build_prompt("/workspace/s1/prd.md"),
            "/prd-decompose /workspace/s1/prd.md"
        );
        assert_eq!(
            TaskTag::AnalyzePrd
                .build_prompt(r#"--module "auth" --feature-tree "/w/FEATURE_TREE.md" --prd "/w/prd.md""#),
            r#"/analyze-prd --module "auth" --feature-tree "/w/FEATURE_TREE.md" --prd "/w/prd.md""#
        );
        assert_eq!(
            TaskTag::PrdChange.build_prompt("drop the reporting module"),
            "/prd-change drop the reporting module"
        );
        assert_eq!(TaskTag::ConfirmPrd.build_prompt(""), "/confirm-prd");
        assert_eq!(
            TaskTag::FreeForm.build_prompt("explain this repo"),
            "explain this repo"
        );
    }

    #[test]
    fn test_prompt_preserves_special_characters() {
        let prompt = "path/with spaces/说明.md";
        assert!(TaskTag::PrdDecompose.build_prompt(prompt).contains(prompt));
    }
}
