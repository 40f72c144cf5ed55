//! Legacy local execution backend.
//!
//! Runs the agent CLI directly on the host, one process per turn, reusing the
//! session id for conversation continuity. Exposes exactly the same surface
//! as the sandbox backend so edge handlers never care which one is active.
//! No container boundary and no port allocator; isolation is only the
//! on-disk workspace directory.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::session::models::{BackendKind, SessionRecord, SessionSpec, SessionStatus};

use super::events::{ChatEvent, ChatEventKind, EventSequencer};
use super::registry::SessionRegistry;
use super::workspace::WorkspaceProvisioner;
use super::{ChatBackend, EventStream, SandboxError, SandboxResult, TaskTag, TurnPolicy};

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Settings for the local executor.
#[derive(Debug, Clone)]
pub struct LocalExecutorConfig {
    /// Path to the agent CLI binary.
    pub agent_binary: String,
    /// Model override passed to the CLI.
    pub agent_model: Option<String>,
    /// Credentials exported into the agent process environment.
    pub agent_api_key: Option<String>,
    pub agent_base_url: Option<String>,
    /// Per non-stream RPC.
    pub request_timeout: Duration,
    /// Per chat turn.
    pub stream_timeout: Duration,
}

/// Per-turn agent process launcher, shared with spawned producer tasks.
#[derive(Clone)]
struct AgentLauncher {
    config: LocalExecutorConfig,
    /// Sessions that already ran a turn resume their CLI conversation.
    has_history: Arc<DashMap<String, ()>>,
}

impl AgentLauncher {
    fn build_command(&self, session_id: &str, workspace_path: &str, prompt: &str) -> Command {
        let mut cmd = Command::new(&self.config.agent_binary);
        cmd.arg("-p")
            .arg(prompt)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--include-partial-messages")
            .arg("--permission-mode")
            .arg("bypassPermissions");

        if self.has_history.contains_key(session_id) {
            cmd.arg("--resume").arg(session_id);
        } else {
            cmd.arg("--session-id").arg(session_id);
        }

        if let Some(ref model) = self.config.agent_model {
            cmd.arg("--model").arg(model);
        }

        if let Some(ref key) = self.config.agent_api_key {
            cmd.env("ANTHROPIC_API_KEY", key);
        }
        if let Some(ref base_url) = self.config.agent_base_url {
            cmd.env("ANTHROPIC_BASE_URL", base_url);
        }

        cmd.current_dir(workspace_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        cmd
    }

    async fn run_turn(
        &self,
        session_id: String,
        workspace_path: String,
        prompt: String,
        deadline: Duration,
        mut cancel_rx: watch::Receiver<bool>,
        tx: mpsc::Sender<ChatEvent>,
    ) {
        let mut sequencer = EventSequencer::new();

        macro_rules! emit {
            ($kind:expr, $content:expr) => {
                if let Some(event) = sequencer.emit($kind, $content) {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            };
        }

        if *cancel_rx.borrow() {
            emit!(ChatEventKind::Interrupted, "Task cancelled");
            return;
        }

        let mut child = match self
            .build_command(&session_id, &workspace_path, &prompt)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                emit!(
                    ChatEventKind::Error,
                    format!("failed to start agent process: {e}")
                );
                return;
            }
        };

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill().await;
                emit!(ChatEventKind::Error, "agent process has no stdout");
                return;
            }
        };

        self.has_history.insert(session_id.clone(), ());
        debug!(session_id = %session_id, "agent process started");

        let mut lines = BufReader::new(stdout).lines();
        let turn_deadline = tokio::time::Instant::now() + deadline;

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            let trimmed = line.trim();
                            if trimmed.is_empty() {
                                continue;
                            }
                            let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
                                continue;
                            };
                            for event in translate_agent_message(&value) {
                                let Some(event) = sequencer.stamp(event) else {
                                    continue;
                                };
                                let terminal = event.is_terminal();
                                if tx.send(event).await.is_err() {
                                    let _ = child.kill().await;
                                    return;
                                }
                                if terminal {
                                    let _ = child.wait().await;
                                    return;
                                }
                            }
                        }
                        Ok(None) => {
                            // Process closed stdout without a result message
                            let _ = child.wait().await;
                            emit!(ChatEventKind::Error, "agent exited before completing the turn");
                            return;
                        }
                        Err(e) => {
                            let _ = child.kill().await;
                            emit!(ChatEventKind::Error, format!("reading agent output: {e}"));
                            return;
                        }
                    }
                }
                _ = cancel_rx.changed() => {
                    info!(session_id = %session_id, "local turn interrupted");
                    let _ = child.kill().await;
                    emit!(ChatEventKind::Interrupted, "Task cancelled");
                    return;
                }
                _ = tokio::time::sleep_until(turn_deadline) => {
                    warn!(session_id = %session_id, "local turn timeout");
                    let _ = child.kill().await;
                    emit!(ChatEventKind::Error, "Stream timeout");
                    return;
                }
            }
        }
    }
}

/// The in-process execution backend.
pub struct LocalBackend {
    registry: Arc<SessionRegistry>,
    workspaces: WorkspaceProvisioner,
    launcher: AgentLauncher,
    turn_policy: TurnPolicy,
}

impl LocalBackend {
    pub fn new(
        registry: Arc<SessionRegistry>,
        workspaces: WorkspaceProvisioner,
        config: LocalExecutorConfig,
        turn_policy: TurnPolicy,
    ) -> Self {
        Self {
            registry,
            workspaces,
            launcher: AgentLauncher {
                config,
                has_history: Arc::new(DashMap::new()),
            },
            turn_policy,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    async fn live_session(&self, session_id: &str) -> SandboxResult<SessionRecord> {
        let entry = self
            .registry
            .entry(session_id)
            .ok_or_else(|| SandboxError::NotFound(session_id.to_string()))?;
        let record = entry.record().await;
        if !record.status.is_live() {
            return Err(SandboxError::Unhealthy(format!(
                "session {} is {}",
                session_id, record.status
            )));
        }
        Ok(record)
    }

    async fn stream_with_deadline(
        &self,
        session_id: &str,
        prompt: &str,
        task_tag: Option<&str>,
        deadline: Duration,
    ) -> SandboxResult<EventStream> {
        let record = self.live_session(session_id).await?;
        self.registry.touch(session_id).await;

        let (guard, cancel_rx) = self.registry.begin_turn(session_id, self.turn_policy).await?;
        let command = TaskTag::parse(task_tag).build_prompt(prompt);

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let launcher = self.launcher.clone();
        let session_id = session_id.to_string();

        tokio::spawn(async move {
            let _guard = guard;
            launcher
                .run_turn(
                    session_id,
                    record.workspace_path,
                    command,
                    deadline,
                    cancel_rx,
                    tx,
                )
                .await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Translate one agent CLI stream-json message into chat events.
///
/// The CLI emits assistant/user/system/result messages plus raw stream
/// events for partial output.
pub fn translate_agent_message(value: &Value) -> Vec<ChatEvent> {
    let mut events = Vec::new();

    match value.get("type").and_then(|t| t.as_str()) {
        Some("assistant") => {
            let blocks = value
                .pointer("/message/content")
                .and_then(|c| c.as_array())
                .cloned()
                .unwrap_or_default();
            for block in blocks {
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        let text = block.get("text").and_then(|t| t.as_str()).unwrap_or_default();
                        events.push(ChatEvent::new(0, ChatEventKind::Text, text));
                    }
                    Some("thinking") => {
                        let text = block
                            .get("thinking")
                            .and_then(|t| t.as_str())
                            .unwrap_or_default();
                        events.push(ChatEvent::new(0, ChatEventKind::Thinking, text));
                    }
                    Some("tool_use") => {
                        let name = block
                            .get("name")
                            .and_then(|n| n.as_str())
                            .unwrap_or_default()
                            .to_string();
                        let mut event = ChatEvent::new(
                            0,
                            ChatEventKind::ToolUse,
                            format!("Using tool: {name}"),
                        );
                        event.tool_name = Some(name);
                        event.tool_input = block.get("input").cloned();
                        event.metadata = block
                            .get("id")
                            .map(|id| serde_json::json!({ "tool_use_id": id }));
                        events.push(event);
                    }
                    _ => {}
                }
            }
        }
        Some("user") => {
            let blocks = value
                .pointer("/message/content")
                .and_then(|c| c.as_array())
                .cloned()
                .unwrap_or_default();
            for block in blocks {
                if block.get("type").and_then(|t| t.as_str()) == Some("tool_result") {
                    let content = match block.get("content") {
                        Some(Value::String(s)) => s.clone(),
                        Some(other) => other.to_string(),
                        None => String::new(),
                    };
                    let content = truncate_result(content, 500);
                    let mut event = ChatEvent::new(0, ChatEventKind::ToolResult, content);
                    event.metadata = Some(serde_json::json!({
                        "tool_use_id": block.get("tool_use_id"),
                        "is_error": block.get("is_error"),
                    }));
                    events.push(event);
                }
            }
        }
        Some("system") => {
            let subtype = value
                .get("subtype")
                .and_then(|s| s.as_str())
                .unwrap_or("system");
            events.push(
                ChatEvent::new(0, ChatEventKind::System, subtype)
                    .with_metadata(serde_json::json!({ "subtype": subtype })),
            );
        }
        Some("result") => {
            let content = value
                .get("result")
                .and_then(|r| r.as_str())
                .unwrap_or("Task completed");
            events.push(
                ChatEvent::new(0, ChatEventKind::Result, content).with_metadata(
                    serde_json::json!({
                        "duration_ms": value.get("duration_ms"),
                        "num_turns": value.get("num_turns"),
                        "session_id": value.get("session_id"),
                        "total_cost_usd": value.get("total_cost_usd"),
                        "is_error": value.get("is_error"),
                    }),
                ),
            );
        }
        Some("stream_event") => {
            if value.pointer("/event/type").and_then(|t| t.as_str())
                == Some("content_block_delta")
                && value.pointer("/event/delta/type").and_then(|t| t.as_str())
                    == Some("text_delta")
            {
                if let Some(text) = value.pointer("/event/delta/text").and_then(|t| t.as_str()) {
                    events.push(ChatEvent::new(0, ChatEventKind::TextDelta, text));
                }
            }
        }
        _ => {}
    }

    events
}

fn truncate_result(content: String, limit: usize) -> String {
    if content.len() <= limit {
        return content;
    }
    let mut cut = limit;
    while cut > 0 && !content.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &content[..cut])
}

#[async_trait]
impl ChatBackend for LocalBackend {
    async fn open_session(&self, spec: SessionSpec) -> SandboxResult<(SessionRecord, bool)> {
        let session_id = spec
            .session_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        // Serialize the whole get-or-create step per session id
        let lock = self.registry.creation_lock(&session_id);
        let _guard = lock.lock().await;

        if let Some(entry) = self.registry.entry(&session_id) {
            let record = entry.record().await;
            if record.status.is_live() {
                self.registry.touch(&session_id).await;
                return Ok((record, false));
            }
            self.registry.remove_entry(&session_id);
        }

        let fresh_workspace = !self.workspaces.exists(&session_id);
        let workspace_path = if fresh_workspace {
            let path = self.workspaces.create(&session_id).await?;
            if let Some(ref repo_url) = spec.repo_url {
                let branch = spec.branch.clone().unwrap_or_else(|| "main".to_string());
                self.workspaces
                    .clone_repo(&path, &session_id, repo_url, &branch)
                    .await?;
            }
            path
        } else {
            info!(session_id = %session_id, "reusing retained workspace");
            self.workspaces.path_for(&session_id)
        };

        let now = Utc::now().to_rfc3339();
        let record = SessionRecord {
            id: session_id.clone(),
            name: spec
                .name
                .clone()
                .unwrap_or_else(|| format!("session-{}", session_id.chars().take(8).collect::<String>())),
            backend: BackendKind::Local,
            status: SessionStatus::Ready,
            container_id: None,
            container_name: None,
            api_port: None,
            code_port: None,
            workspace_path: workspace_path.to_string_lossy().to_string(),
            repo_url: spec.repo_url.clone(),
            branch: spec.branch.clone(),
            created_at: now.clone(),
            last_activity_at: now,
            stopped_at: None,
            error_message: None,
        };

        self.registry.insert_entry(&session_id, record.clone());
        info!(session_id = %session_id, "local session ready");
        Ok((record, true))
    }

    async fn get_session(&self, session_id: &str) -> Option<SessionRecord> {
        if let Some(entry) = self.registry.entry(session_id) {
            return Some(entry.record().await);
        }
        self.registry.repo().get(session_id).await.ok().flatten()
    }

    async fn list_sessions(&self) -> Vec<SessionRecord> {
        self.registry.list().await
    }

    async fn close_session(&self, session_id: &str, reason: &str) -> SandboxResult<()> {
        // Idempotent: closing an unknown session is an acknowledged no-op
        let Some(entry) = self.registry.remove_entry(session_id) else {
            return Ok(());
        };

        entry.fire_cancel();
        let now = Utc::now().to_rfc3339();
        if let Err(e) = self.registry.repo().mark_stopped(session_id, &now).await {
            warn!(session_id, error = %e, "failed to persist stopped status");
        }
        self.launcher.has_history.remove(session_id);

        info!(session_id, reason, "local session closed");
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> SandboxResult<()> {
        self.close_session(session_id, "deleted").await?;
        let path = self.workspaces.path_for(session_id);
        self.workspaces.destroy(&path).await?;
        if let Err(e) = self.registry.repo().delete(session_id).await {
            warn!(session_id, error = %e, "failed to delete session row");
        }
        Ok(())
    }

    async fn chat(
        &self,
        session_id: &str,
        prompt: &str,
        task_tag: Option<&str>,
    ) -> SandboxResult<Vec<ChatEvent>> {
        let mut stream = self
            .stream_with_deadline(
                session_id,
                prompt,
                task_tag,
                self.launcher.config.request_timeout,
            )
            .await?;

        use tokio_stream::StreamExt;
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        Ok(events)
    }

    async fn chat_stream(
        &self,
        session_id: &str,
        prompt: &str,
        task_tag: Option<&str>,
    ) -> SandboxResult<EventStream> {
        self.stream_with_deadline(
            session_id,
            prompt,
            task_tag,
            self.launcher.config.stream_timeout,
        )
        .await
    }

    async fn interrupt(&self, session_id: &str) -> SandboxResult<bool> {
        self.registry.interrupt(session_id)
    }

    async fn probe_session(&self, _session_id: &str) -> SandboxResult<()> {
        // No external process to probe between turns
        Ok(())
    }

    fn mode(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_translate_assistant_text_and_tool_use() {
        let events = translate_agent_message(&json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "text", "text": "Let me look."},
                {"type": "tool_use", "id": "toolu_01", "name": "Bash",
                 "input": {"command": "ls"}}
            ]}
        }));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, ChatEventKind::Text);
        assert_eq!(events[1].kind, ChatEventKind::ToolUse);
        assert_eq!(events[1].tool_name.as_deref(), Some("Bash"));
        assert_eq!(events[1].tool_use_id(), Some("toolu_01"));
    }

    #[test]
    fn test_translate_tool_result_links_to_tool_use() {
        let events = translate_agent_message(&json!({
            "type": "user",
            "message": {"content": [
                {"type": "tool_result", "tool_use_id": "toolu_01",
                 "content": "README.md\nsrc", "is_error": false}
            ]}
        }));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChatEventKind::ToolResult);
        assert_eq!(events[0].tool_use_id(), Some("toolu_01"));
    }

    #[test]
    fn test_translate_result_metadata() {
        let events = translate_agent_message(&json!({
            "type": "result",
            "result": "done",
            "duration_ms": 912,
            "num_turns": 1,
            "total_cost_usd": 0.004,
            "is_error": false
        }));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChatEventKind::Result);
        let meta = events[0].metadata.as_ref().unwrap();
        assert_eq!(meta["duration_ms"], 912);
    }

    #[test]
    fn test_translate_text_delta_stream_event() {
        let events = translate_agent_message(&json!({
            "type": "stream_event",
            "event": {
                "type": "content_block_delta",
                "delta": {"type": "text_delta", "text": "chu"}
            }
        }));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChatEventKind::TextDelta);
        assert_eq!(events[0].content, "chu");
    }

    #[test]
    fn test_translate_ignores_unknown_messages() {
        assert!(translate_agent_message(&json!({"type": "ping"})).is_empty());
        assert!(translate_agent_message(&json!({"no_type": true})).is_empty());
    }

    #[test]
    fn test_truncate_result_respects_char_boundaries() {
        let long = "界".repeat(400);
        let truncated = truncate_result(long, 500);
        assert!(truncated.ends_with("..."));
        assert!(truncated.len() <= 503);
    }
}
