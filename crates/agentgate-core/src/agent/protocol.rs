//! Stream-JSON protocol handling for the agent CLI
//!
//! Outbound: user turns and interrupt control requests, one JSON object per line.
//! Inbound: `assistant`, `user` (tool results) and `result` messages are turned
//! into [`AgentEvent`]s; `system`, `stream_event` and `control_response` are
//! bookkeeping and produce nothing.

use crate::error::{AgentError, Error, Result};
use crate::types::{AgentEvent, TerminalEvent, TurnOutcome};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

/// Cap on a JSON message still being assembled across lines
const MAX_BUFFERED_BYTES: usize = 1024 * 1024;

/// Protocol handler for the agent's stream-json dialect
pub struct ProtocolHandler {
    request_id: AtomicU64,
}

impl ProtocolHandler {
    pub fn new() -> Self {
        Self {
            request_id: AtomicU64::new(1),
        }
    }

    /// Generate next control request ID
    pub fn next_request_id(&self) -> String {
        let n = self.request_id.fetch_add(1, Ordering::SeqCst);
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("req_{}_{}", n, &suffix[..8])
    }

    /// Create a user turn message
    pub fn create_user_message(&self, text: &str) -> Value {
        json!({
            "type": "user",
            "message": { "role": "user", "content": text },
            "parent_tool_use_id": null,
            "session_id": "default",
        })
    }

    /// Create an interrupt control request
    pub fn create_interrupt_request(&self) -> Value {
        json!({
            "type": "control_request",
            "request_id": self.next_request_id(),
            "request": { "subtype": "interrupt" },
        })
    }

    /// Parse one inbound message into zero or more events
    pub fn parse_message(&self, value: &Value) -> Result<Vec<AgentEvent>> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::Agent(AgentError::Protocol(format!(
                    "Message without type: {}",
                    truncate(&value.to_string())
                )))
            })?;

        match kind {
            "assistant" => Ok(self.parse_assistant(value)),
            "user" => Ok(self.parse_tool_results(value)),
            "result" => Ok(vec![AgentEvent::Terminal(self.parse_result(value))]),
            "system" | "stream_event" | "control_response" | "keep_alive" => {
                trace!("Ignoring {} message", kind);
                Ok(Vec::new())
            }
            other => {
                warn!("Unknown agent message type: {}", other);
                Ok(Vec::new())
            }
        }
    }

    fn parse_assistant(&self, value: &Value) -> Vec<AgentEvent> {
        content_blocks(value)
            .iter()
            .filter_map(|block| match block.get("type").and_then(Value::as_str) {
                Some("text") => block
                    .get("text")
                    .and_then(Value::as_str)
                    .filter(|t| !t.is_empty())
                    .map(AgentEvent::text),
                Some("tool_use") => Some(AgentEvent::ToolInvocation {
                    id: str_field(block, "id"),
                    name: str_field(block, "name"),
                    input: block.get("input").cloned().unwrap_or_else(|| json!({})),
                }),
                Some("thinking") => None,
                other => {
                    debug!("Skipping assistant block {:?}", other);
                    None
                }
            })
            .collect()
    }

    fn parse_tool_results(&self, value: &Value) -> Vec<AgentEvent> {
        content_blocks(value)
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_result"))
            .map(|block| AgentEvent::ToolResult {
                tool_use_id: str_field(block, "tool_use_id"),
                content: tool_result_text(block.get("content")),
                is_error: block
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            })
            .collect()
    }

    fn parse_result(&self, value: &Value) -> TerminalEvent {
        let subtype = value
            .get("subtype")
            .and_then(Value::as_str)
            .unwrap_or("success");
        let is_error = value
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let outcome = match subtype {
            "success" if !is_error => TurnOutcome::Success,
            "error_max_structured_output_retries" => TurnOutcome::ErrorMaxStructuredOutputRetries,
            _ => TurnOutcome::Error,
        };

        let result = value
            .get("result")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| {
                if outcome.is_success() {
                    String::new()
                } else {
                    subtype.to_string()
                }
            });

        let mut terminal = TerminalEvent::new(outcome, result);
        terminal.cost_usd = value.get("total_cost_usd").and_then(Value::as_f64);
        terminal.duration_ms = value.get("duration_ms").and_then(Value::as_u64);
        terminal.structured_output = value
            .get("structured_output")
            .filter(|v| !v.is_null())
            .cloned();
        terminal
    }
}

impl Default for ProtocolHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn content_blocks(value: &Value) -> &[Value] {
    value
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Tool results arrive as a plain string or a list of text blocks
fn tool_result_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn truncate(s: &str) -> String {
    s.chars().take(300).collect()
}

/// Reassembles JSON values from agent stdout lines.
///
/// Tolerates JSON split across lines and leading non-JSON noise before an
/// object on the same line.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: String,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line; returns a value once a complete one is buffered.
    ///
    /// The size cap applies only to JSON still waiting for more lines; a
    /// complete value of any size is decoded. Exceeding the cap discards the
    /// partial value and fails with `AgentError::Protocol`.
    pub fn push(&mut self, line: &str) -> Result<Option<Value>> {
        if !self.buffer.is_empty() {
            self.buffer.push('\n');
        }
        self.buffer.push_str(line);

        match serde_json::from_str::<Value>(&self.buffer) {
            Ok(v) => {
                self.buffer.clear();
                Ok(Some(v))
            }
            Err(e) if e.is_eof() => self.check_overflow(),
            Err(e) => {
                debug!("Ignoring non-JSON agent output ({}): {}", e, truncate(&self.buffer));
                self.buffer.clear();

                let trimmed = line.trim_start();
                let Some(idx) = json_start_index(trimmed) else {
                    return Ok(None);
                };
                self.buffer.push_str(&trimmed[idx..]);
                match serde_json::from_str::<Value>(&self.buffer) {
                    Ok(v) => {
                        self.buffer.clear();
                        Ok(Some(v))
                    }
                    Err(e) if e.is_eof() => self.check_overflow(),
                    Err(_) => {
                        self.buffer.clear();
                        Ok(None)
                    }
                }
            }
        }
    }

    fn check_overflow(&mut self) -> Result<Option<Value>> {
        if self.buffer.len() <= MAX_BUFFERED_BYTES {
            return Ok(None);
        }
        let size = self.buffer.len();
        self.buffer.clear();
        warn!("Discarding incomplete agent message of {} bytes", size);
        Err(Error::Agent(AgentError::Protocol(format!(
            "incomplete agent message exceeded {} bytes",
            MAX_BUFFERED_BYTES
        ))))
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

fn json_start_index(s: &str) -> Option<usize> {
    match (s.find('{'), s.find('[')) {
        (Some(o), Some(a)) => Some(o.min(a)),
        (Some(o), None) => Some(o),
        (None, Some(a)) => Some(a),
        (None, None) => None,
    }
}
