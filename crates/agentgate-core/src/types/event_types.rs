//! Agent events, terminal outcomes and wire events

use super::SessionId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Final outcome of a turn
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    Success,
    Error,
    Interrupted,
    Timeout,
    ErrorMaxStructuredOutputRetries,
}

impl TurnOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Interrupted => "interrupted",
            Self::Timeout => "timeout",
            Self::ErrorMaxStructuredOutputRetries => "error_max_structured_output_retries",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Outcomes produced by stopping a turn early
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Interrupted | Self::Timeout)
    }
}

impl fmt::Display for TurnOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal event payload as produced by an agent handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalEvent {
    pub outcome: TurnOutcome,
    pub result: String,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub structured_output: Option<serde_json::Value>,
}

impl TerminalEvent {
    pub fn new(outcome: TurnOutcome, result: impl Into<String>) -> Self {
        Self {
            outcome,
            result: result.into(),
            cost_usd: None,
            duration_ms: None,
            structured_output: None,
        }
    }

    pub fn success(result: impl Into<String>) -> Self {
        Self::new(TurnOutcome::Success, result)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(TurnOutcome::Error, message)
    }

    pub fn interrupted() -> Self {
        Self::new(TurnOutcome::Interrupted, "Turn interrupted")
    }

    pub fn timed_out() -> Self {
        Self::new(TurnOutcome::Timeout, "Turn exceeded the maximum duration")
    }

    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = Some(cost_usd);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_structured_output(mut self, value: serde_json::Value) -> Self {
        self.structured_output = Some(value);
        self
    }

    /// Attach the owning session and unwrap into the caller-facing result
    pub fn into_result(self, session_id: SessionId) -> TurnResult {
        TurnResult {
            outcome: self.outcome,
            result: self.result,
            session_id,
            cost_usd: self.cost_usd,
            duration_ms: self.duration_ms,
            structured_output: self.structured_output,
        }
    }
}

/// One event produced by an agent handle during a turn
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    TextDelta {
        text: String,
    },
    ToolInvocation {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    Terminal(TerminalEvent),
}

impl AgentEvent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::TextDelta { text: text.into() }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        Self::ToolInvocation {
            id: id.into(),
            name: name.into(),
            input,
        }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal(_))
    }
}

/// Caller-facing result of one turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnResult {
    pub outcome: TurnOutcome,
    pub result: String,
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_output: Option<serde_json::Value>,
}

impl TurnResult {
    pub fn is_error(&self) -> bool {
        !self.outcome.is_success()
    }
}

/// Event as delivered to streaming callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireEvent {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        input: serde_json::Value,
        id: String,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
    Result(TurnResult),
}

impl WireEvent {
    /// Project an agent event onto the wire vocabulary
    pub fn from_agent_event(event: AgentEvent, session_id: &SessionId) -> Self {
        match event {
            AgentEvent::TextDelta { text } => Self::Text { text },
            AgentEvent::ToolInvocation { id, name, input } => Self::ToolUse { name, input, id },
            AgentEvent::ToolResult {
                tool_use_id,
                content,
                ..
            } => Self::ToolResult {
                tool_use_id,
                content,
            },
            AgentEvent::Terminal(terminal) => Self::Result(terminal.into_result(session_id.clone())),
        }
    }

    pub fn is_result(&self) -> bool {
        matches!(self, Self::Result(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_outcome_wire_names() {
        let value = serde_json::to_value(TurnOutcome::ErrorMaxStructuredOutputRetries).unwrap();
        assert_eq!(value, json!("error_max_structured_output_retries"));
        assert_eq!(TurnOutcome::Interrupted.to_string(), "interrupted");
        assert!(TurnOutcome::Timeout.is_cancellation());
        assert!(!TurnOutcome::Error.is_cancellation());
    }

    #[test]
    fn test_result_wire_event_omits_absent_fields() {
        let event = WireEvent::from_agent_event(
            AgentEvent::Terminal(TerminalEvent::success("done")),
            &SessionId::new("s-1"),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "kind": "result",
                "outcome": "success",
                "result": "done",
                "session_id": "s-1"
            })
        );
    }

    #[test]
    fn test_tool_events_on_the_wire() {
        let session = SessionId::new("s");
        let use_event = WireEvent::from_agent_event(
            AgentEvent::tool_use("tu_1", "Read", json!({"path": "a.txt"})),
            &session,
        );
        assert_eq!(
            serde_json::to_value(&use_event).unwrap(),
            json!({"kind": "tool_use", "name": "Read", "input": {"path": "a.txt"}, "id": "tu_1"})
        );

        let result_event =
            WireEvent::from_agent_event(AgentEvent::tool_result("tu_1", "hello"), &session);
        assert_eq!(
            serde_json::to_value(&result_event).unwrap(),
            json!({"kind": "tool_result", "tool_use_id": "tu_1", "content": "hello"})
        );
    }

    #[test]
    fn test_terminal_builders() {
        let terminal = TerminalEvent::success("ok")
            .with_cost(0.25)
            .with_duration_ms(1200)
            .with_structured_output(json!({"a": 1}));
        let result = terminal.into_result(SessionId::new("x"));
        assert_eq!(result.cost_usd, Some(0.25));
        assert_eq!(result.duration_ms, Some(1200));
        assert!(!result.is_error());
        assert!(TerminalEvent::interrupted().outcome.is_cancellation());
    }
}
