//! Chat proxy: translates edge chat requests into container-side calls.
//!
//! Two traffic classes: non-streaming JSON RPC (`execute_turn`) and streaming
//! event feeds (`stream_turn`) with server-initiated cancellation. The
//! streaming path suspends at every chunk boundary; the bounded channel to
//! the consumer propagates edge back-pressure upstream.

use std::time::Duration;

use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use super::events::{ChatEvent, ChatEventKind, EventSequencer, parse_upstream_event};
use super::manager::WORKSPACE_MOUNT_PATH;
use super::{EventStream, SandboxError, SandboxResult};

/// Endpoints exposed by the agent service inside each container.
const EXECUTE_ENDPOINT: &str = "/api/tasks/execute";
const STREAM_ENDPOINT: &str = "/api/tasks/stream";
const CANCEL_ENDPOINT: &str = "/api/tasks/cancel";

/// Capacity of the event channel between producer and edge consumer. When
/// the edge cannot accept, sends suspend, which suspends reading upstream.
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Timeouts for the two traffic classes.
#[derive(Debug, Clone, Copy)]
pub struct ChatProxyConfig {
    /// Per non-stream RPC.
    pub request_timeout: Duration,
    /// Per chat turn on the streaming path.
    pub stream_timeout: Duration,
}

/// Proxy for agent traffic into one session's container.
#[derive(Clone)]
pub struct ChatProxy {
    http: reqwest::Client,
    config: ChatProxyConfig,
}

impl ChatProxy {
    pub fn new(config: ChatProxyConfig) -> Self {
        // No client-level timeout: the streaming path outlives any fixed
        // request timeout and enforces its own deadline.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("building chat proxy client");

        Self { http, config }
    }

    /// Run a turn through the non-streaming JSON RPC endpoint and return all
    /// events. Used only for short operations.
    pub async fn execute_turn(
        &self,
        api_port: u16,
        session_id: &str,
        prompt: &str,
    ) -> SandboxResult<Vec<ChatEvent>> {
        let url = format!("http://127.0.0.1:{}{}", api_port, EXECUTE_ENDPOINT);
        let body = turn_request(session_id, prompt);

        let response = tokio::time::timeout(
            self.config.request_timeout,
            self.http.post(&url).json(&body).send(),
        )
        .await
        .map_err(|_| SandboxError::Timeout("request timeout".to_string()))?
        .map_err(|e| SandboxError::Upstream(format!("request to agent failed: {e}")))?;

        if !response.status().is_success() {
            return Err(SandboxError::Upstream(format!(
                "agent returned {}",
                response.status()
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| SandboxError::Upstream(format!("parsing agent response: {e}")))?;

        let mut sequencer = EventSequencer::new();
        let mut events = Vec::new();
        if let Some(raw_events) = payload.get("events").and_then(|e| e.as_array()) {
            for raw in raw_events {
                if let Some(event) = sequencer.stamp(parse_upstream_event(raw.clone())) {
                    events.push(event);
                }
            }
        }

        // Every turn ends in exactly one terminal event
        if !sequencer.terminated() {
            if let Some(event) = sequencer.emit(ChatEventKind::Result, "Task completed") {
                events.push(event);
            }
        }

        Ok(events)
    }

    /// Run a turn through the streaming endpoint.
    ///
    /// Returns a lazy, finite, non-restartable event stream. The stream ends
    /// with exactly one terminal event no matter how the upstream behaves:
    /// upstream errors and disconnects surface as `error`, exceeding the
    /// stream timeout surfaces as `error` (cause timeout) and cancels the
    /// upstream call, and observed cancellation surfaces as `interrupted`.
    ///
    /// `turn_guard` is held by the producer for the lifetime of the turn and
    /// dropped when it ends, however it ends.
    pub fn stream_turn(
        &self,
        api_port: u16,
        session_id: String,
        prompt: String,
        cancel_rx: watch::Receiver<bool>,
        turn_guard: impl Send + 'static,
    ) -> EventStream {
        let (tx, rx) = mpsc::channel::<ChatEvent>(EVENT_CHANNEL_CAPACITY);
        let proxy = self.clone();

        tokio::spawn(async move {
            let _guard = turn_guard;
            proxy
                .run_stream_turn(api_port, &session_id, &prompt, cancel_rx, tx)
                .await;
        });

        Box::pin(ReceiverStream::new(rx))
    }

    async fn run_stream_turn(
        &self,
        api_port: u16,
        session_id: &str,
        prompt: &str,
        mut cancel_rx: watch::Receiver<bool>,
        tx: mpsc::Sender<ChatEvent>,
    ) {
        let url = format!("http://127.0.0.1:{}{}", api_port, STREAM_ENDPOINT);
        let body = turn_request(session_id, prompt);
        let deadline = tokio::time::Instant::now() + self.config.stream_timeout;

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

        // Pre-dispatch cancellation check: the caller may have interrupted
        // between registering the turn and the producer starting.
        if *cancel_rx.borrow() {
            emit!(ChatEventKind::Interrupted, "Task cancelled");
            return;
        }

        let response = tokio::select! {
            result = self.http
                .post(&url)
                .header("Accept", "text/event-stream")
                .json(&body)
                .send() => result,
            _ = cancel_rx.changed() => {
                self.send_cancel(api_port, session_id).await;
                emit!(ChatEventKind::Interrupted, "Task cancelled");
                return;
            }
            _ = tokio::time::sleep_until(deadline) => {
                emit!(ChatEventKind::Error, "Stream timeout");
                return;
            }
        };

        let response = match response {
            Ok(res) if res.status().is_success() => res,
            Ok(res) => {
                emit!(
                    ChatEventKind::Error,
                    format!("Stream request failed: {}", res.status())
                );
                return;
            }
            Err(e) => {
                emit!(ChatEventKind::Error, format!("Connection error: {e}"));
                return;
            }
        };

        debug!(session_id, api_port, "stream connected");

        let mut upstream = Box::pin(response.bytes_stream());
        let mut parser = SseParser::default();

        loop {
            tokio::select! {
                chunk = upstream.next() => {
                    match chunk {
                        Some(Ok(bytes)) => {
                            for payload in parser.feed(&String::from_utf8_lossy(&bytes)) {
                                let event = match serde_json::from_str::<Value>(&payload) {
                                    Ok(value) => parse_upstream_event(value),
                                    // Non-JSON payloads surface as system events
                                    Err(_) => ChatEvent::new(0, ChatEventKind::System, payload),
                                };

                                let Some(event) = sequencer.stamp(event) else {
                                    continue;
                                };
                                let terminal = event.is_terminal();
                                if tx.send(event).await.is_err() {
                                    // Consumer went away; stop the agent too
                                    self.send_cancel(api_port, session_id).await;
                                    return;
                                }
                                if terminal {
                                    return;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            warn!(session_id, error = %e, "upstream stream error");
                            emit!(ChatEventKind::Error, format!("Upstream error: {e}"));
                            return;
                        }
                        None => {
                            // Upstream closed without a terminal event
                            emit!(ChatEventKind::Error, "Upstream closed before completing the turn");
                            return;
                        }
                    }
                }
                _ = cancel_rx.changed() => {
                    info!(session_id, "turn interrupted");
                    self.send_cancel(api_port, session_id).await;
                    emit!(ChatEventKind::Interrupted, "Task cancelled");
                    return;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(session_id, "stream timeout");
                    self.send_cancel(api_port, session_id).await;
                    emit!(ChatEventKind::Error, "Stream timeout");
                    return;
                }
            }
        }
    }

    /// Ask the in-container agent to stop the running task.
    pub async fn send_cancel(&self, api_port: u16, session_id: &str) {
        let url = format!("http://127.0.0.1:{}{}", api_port, CANCEL_ENDPOINT);
        let result = self
            .http
            .post(&url)
            .query(&[("session_id", session_id)])
            .timeout(Duration::from_secs(2))
            .send()
            .await;

        if let Err(e) = result {
            warn!(session_id, error = %e, "cancel request to agent failed");
        }
    }
}

fn turn_request(session_id: &str, prompt: &str) -> Value {
    json!({
        "session_id": session_id,
        "workspace_path": WORKSPACE_MOUNT_PATH,
        "prompt": prompt,
    })
}

/// Incremental SSE parser.
///
/// Buffers until a blank line, then joins the `data:` lines of the completed
/// event. `event:` and comment lines are ignored; the payload carries its own
/// type tag.
#[derive(Debug, Default)]
struct SseParser {
    buffer: String,
}

impl SseParser {
    /// Feed a chunk, returning the data payloads of all completed events.
    fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);

        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let raw_event = self.buffer[..pos].to_string();
            self.buffer.drain(..pos + 2);

            let data_lines: Vec<&str> = raw_event
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|data| data.trim_start())
                .collect();

            if !data_lines.is_empty() {
                payloads.push(data_lines.join(""));
            }
        }

        payloads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_parser_single_event() {
        let mut parser = SseParser::default();
        let payloads = parser.feed("data: {\"type\":\"text\"}\n\n");
        assert_eq!(payloads, vec!["{\"type\":\"text\"}"]);
    }

    #[test]
    fn test_sse_parser_split_across_chunks() {
        let mut parser = SseParser::default();
        assert!(parser.feed("data: {\"type\":").is_empty());
        assert!(parser.feed("\"text_delta\",\"content\":\"hi\"}").is_empty());
        let payloads = parser.feed("\n\n");
        assert_eq!(payloads, vec!["{\"type\":\"text_delta\",\"content\":\"hi\"}"]);
    }

    #[test]
    fn test_sse_parser_multiple_events_one_chunk() {
        let mut parser = SseParser::default();
        let payloads = parser.feed("data: one\n\ndata: two\n\ndata: partial");
        assert_eq!(payloads, vec!["one", "two"]);
        assert_eq!(parser.feed("\n\n"), vec!["partial"]);
    }

    #[test]
    fn test_sse_parser_joins_multiline_data() {
        let mut parser = SseParser::default();
        let payloads = parser.feed("event: message\ndata: {\"a\":\ndata: 1}\n\n");
        assert_eq!(payloads, vec!["{\"a\":1}"]);
    }

    #[test]
    fn test_sse_parser_ignores_dataless_events() {
        let mut parser = SseParser::default();
        assert!(parser.feed(": keepalive comment\n\n").is_empty());
        assert!(parser.feed("event: ping\n\n").is_empty());
    }

    #[tokio::test]
    async fn test_stream_turn_connection_error_yields_single_terminal() {
        // Nothing is listening on this port, so the connect fails and the
        // stream must end with exactly one error event.
        let proxy = ChatProxy::new(ChatProxyConfig {
            request_timeout: Duration::from_secs(2),
            stream_timeout: Duration::from_secs(5),
        });
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let mut stream = proxy.stream_turn(1, "s1".to_string(), "hi".to_string(), cancel_rx, ());

        let first = stream.next().await.expect("one event");
        assert_eq!(first.kind, ChatEventKind::Error);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_turn_pre_cancelled() {
        let proxy = ChatProxy::new(ChatProxyConfig {
            request_timeout: Duration::from_secs(2),
            stream_timeout: Duration::from_secs(5),
        });
        let (cancel_tx, cancel_rx) = watch::channel(false);
        cancel_tx.send(true).unwrap();

        let mut stream = proxy.stream_turn(1, "s1".to_string(), "hi".to_string(), cancel_rx, ());

        let first = stream.next().await.expect("one event");
        assert_eq!(first.kind, ChatEventKind::Interrupted);
        assert!(stream.next().await.is_none());
    }
}
