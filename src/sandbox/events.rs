//! Chat event types emitted during a turn.
//!
//! Every turn produces an ordered sequence of events ending in exactly one
//! terminal event (`result`, `error`, or `interrupted`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatEventKind {
    /// Session housekeeping.
    System,
    /// Complete assistant text block.
    Text,
    /// Incremental fragment of the current assistant block.
    TextDelta,
    /// Assistant reasoning trace.
    Thinking,
    /// Agent is invoking a tool.
    ToolUse,
    /// Outcome of a tool invocation.
    ToolResult,
    /// Turn complete.
    Result,
    /// Turn failed.
    Error,
    /// Cancellation honored.
    Interrupted,
}

impl ChatEventKind {
    /// Whether this event ends the turn.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChatEventKind::Result | ChatEventKind::Error | ChatEventKind::Interrupted
        )
    }
}

/// A single chat event within a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEvent {
    /// Monotonically increasing ordinal within the turn.
    pub seq: u64,
    /// Event type tag.
    #[serde(rename = "type")]
    pub kind: ChatEventKind,
    /// Text payload (meaning depends on kind).
    #[serde(default)]
    pub content: String,
    /// Tool name for `tool_use` events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Structured tool input for `tool_use` events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
    /// Structured metadata: `tool_use_id`, `duration_ms`, cost, token counts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ChatEvent {
    /// Create an event with the given kind and text content.
    pub fn new(seq: u64, kind: ChatEventKind, content: impl Into<String>) -> Self {
        Self {
            seq,
            kind,
            content: content.into(),
            tool_name: None,
            tool_input: None,
            metadata: None,
        }
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// The `tool_use_id` linking a `tool_result` to its `tool_use`, if any.
    pub fn tool_use_id(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("tool_use_id"))
            .and_then(|v| v.as_str())
    }

    /// Whether this event ends the turn.
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

/// Assigns per-turn ordinals and tracks whether a terminal event was issued.
#[derive(Debug, Default)]
pub struct EventSequencer {
    next_seq: u64,
    terminated: bool,
}

impl EventSequencer {
    /// Create a fresh sequencer for a new turn.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a terminal event has already been issued.
    pub fn terminated(&self) -> bool {
        self.terminated
    }

    /// Stamp the next ordinal onto a raw upstream event.
    ///
    /// Returns `None` for events arriving after the terminal event; a turn
    /// carries exactly one terminal event, so late arrivals are dropped.
    pub fn stamp(&mut self, mut event: ChatEvent) -> Option<ChatEvent> {
        if self.terminated {
            return None;
        }
        event.seq = self.next_seq;
        self.next_seq += 1;
        if event.kind.is_terminal() {
            self.terminated = true;
        }
        Some(event)
    }

    /// Build and stamp an event in one step.
    pub fn emit(&mut self, kind: ChatEventKind, content: impl Into<String>) -> Option<ChatEvent> {
        self.stamp(ChatEvent::new(0, kind, content))
    }
}

/// Parse a JSON event payload from the upstream agent into a `ChatEvent`.
///
/// The ordinal is assigned by the caller's `EventSequencer`; unknown type tags
/// are treated as system events so no payload is lost.
pub fn parse_upstream_event(value: Value) -> ChatEvent {
    let kind = match value.get("type").and_then(|t| t.as_str()) {
        Some("system") => ChatEventKind::System,
        Some("text") => ChatEventKind::Text,
        Some("text_delta") => ChatEventKind::TextDelta,
        Some("thinking") => ChatEventKind::Thinking,
        Some("tool_use") => ChatEventKind::ToolUse,
        Some("tool_result") => ChatEventKind::ToolResult,
        Some("result") => ChatEventKind::Result,
        Some("error") => ChatEventKind::Error,
        Some("interrupted") => ChatEventKind::Interrupted,
        _ => ChatEventKind::System,
    };

    let content = value
        .get("content")
        .and_then(|c| c.as_str())
        .or_else(|| value.get("message").and_then(|m| m.as_str()))
        .unwrap_or_default()
        .to_string();

    ChatEvent {
        seq: 0,
        kind,
        content,
        tool_name: value
            .get("tool_name")
            .and_then(|t| t.as_str())
            .map(String::from),
        tool_input: value.get("tool_input").filter(|v| !v.is_null()).cloned(),
        metadata: value.get("metadata").filter(|v| !v.is_null()).cloned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_terminal_kinds() {
        assert!(ChatEventKind::Result.is_terminal());
        assert!(ChatEventKind::Error.is_terminal());
        assert!(ChatEventKind::Interrupted.is_terminal());
        assert!(!ChatEventKind::Text.is_terminal());
        assert!(!ChatEventKind::ToolUse.is_terminal());
    }

    #[test]
    fn test_sequencer_assigns_monotonic_ordinals() {
        let mut seq = EventSequencer::new();
        let a = seq.emit(ChatEventKind::TextDelta, "he").unwrap();
        let b = seq.emit(ChatEventKind::TextDelta, "llo").unwrap();
        let c = seq.emit(ChatEventKind::Text, "hello").unwrap();
        assert_eq!(a.seq, 0);
        assert_eq!(b.seq, 1);
        assert_eq!(c.seq, 2);
    }

    #[test]
    fn test_sequencer_drops_events_after_terminal() {
        let mut seq = EventSequencer::new();
        assert!(seq.emit(ChatEventKind::Text, "hi").is_some());
        assert!(seq.emit(ChatEventKind::Result, "done").is_some());
        assert!(seq.terminated());
        assert!(seq.emit(ChatEventKind::Text, "late").is_none());
        assert!(seq.emit(ChatEventKind::Error, "late error").is_none());
    }

    #[test]
    fn test_parse_upstream_tool_use() {
        let event = parse_upstream_event(json!({
            "type": "tool_use",
            "content": "Using tool: Read",
            "tool_name": "Read",
            "tool_input": {"file_path": "/workspace/README.md"},
            "metadata": {"tool_use_id": "toolu_01"}
        }));
        assert_eq!(event.kind, ChatEventKind::ToolUse);
        assert_eq!(event.tool_name.as_deref(), Some("Read"));
        assert_eq!(event.tool_use_id(), Some("toolu_01"));
    }

    #[test]
    fn test_parse_upstream_result_metadata() {
        let event = parse_upstream_event(json!({
            "type": "result",
            "content": "Task completed",
            "metadata": {"duration_ms": 1234, "total_cost_usd": 0.02}
        }));
        assert_eq!(event.kind, ChatEventKind::Result);
        let duration = event
            .metadata
            .as_ref()
            .and_then(|m| m.get("duration_ms"))
            .and_then(|d| d.as_i64())
            .unwrap();
        assert!(duration >= 0);
    }

    #[test]
    fn test_parse_upstream_unknown_type_becomes_system() {
        let event = parse_upstream_event(json!({"type": "keepalive", "content": "ping"}));
        assert_eq!(event.kind, ChatEventKind::System);
        assert_eq!(event.content, "ping");
    }

    #[test]
    fn test_parse_upstream_interrupted_message_field() {
        let event = parse_upstream_event(json!({"type": "interrupted", "message": "Stream cancelled"}));
        assert_eq!(event.kind, ChatEventKind::Interrupted);
        assert_eq!(event.content, "Stream cancelled");
    }

    #[test]
    fn test_event_serialization_shape() {
        let mut seq = EventSequencer::new();
        let event = seq.emit(ChatEventKind::TextDelta, "chunk").unwrap();
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "text_delta");
        assert_eq!(value["content"], "chunk");
        assert_eq!(value["seq"], 0);
        assert!(value.get("tool_name").is_none());
    }
}
