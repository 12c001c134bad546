//! Scripted agent backend
//!
//! Replays pre-recorded turns instead of running a real agent. Each `send`
//! consumes the next [`ScriptedTurn`] from a queue shared by every handle the
//! backend starts; an exhausted queue answers `"ok"`. Sent messages and start
//! counts are recorded so tests can assert on what a session did.

use super::{AgentBackend, AgentHandle};
use crate::error::{AgentError, Error, Result};
use crate::types::{AgentEvent, SessionConfig, TerminalEvent};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
enum Step {
    Event(AgentEvent),
    Delay(Duration),
    /// Never produce another event on its own
    Hang,
    /// Die with `HandleClosed`
    Fail(String),
}

/// Script for the response to one sent message
#[derive(Debug, Clone, Default)]
pub struct ScriptedTurn {
    steps: Vec<Step>,
    ignore_cancel: bool,
}

impl ScriptedTurn {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text followed by a success terminal with the same text
    pub fn reply(text: &str) -> Self {
        Self::new().text(text).success(text)
    }

    pub fn text(mut self, text: &str) -> Self {
        self.steps.push(Step::Event(AgentEvent::text(text)));
        self
    }

    pub fn tool_use(mut self, id: &str, name: &str, input: serde_json::Value) -> Self {
        self.steps.push(Step::Event(AgentEvent::tool_use(id, name, input)));
        self
    }

    pub fn tool_result(mut self, tool_use_id: &str, content: &str) -> Self {
        self.steps
            .push(Step::Event(AgentEvent::tool_result(tool_use_id, content)));
        self
    }

    pub fn success(self, result: &str) -> Self {
        self.terminal(TerminalEvent::success(result))
    }

    pub fn terminal(mut self, terminal: TerminalEvent) -> Self {
        self.steps.push(Step::Event(AgentEvent::Terminal(terminal)));
        self
    }

    pub fn delay(mut self, duration: Duration) -> Self {
        self.steps.push(Step::Delay(duration));
        self
    }

    pub fn hang(mut self) -> Self {
        self.steps.push(Step::Hang);
        self
    }

    pub fn fail(mut self, message: &str) -> Self {
        self.steps.push(Step::Fail(message.to_string()));
        self
    }

    /// Keep going after `cancel()` instead of answering `interrupted`
    pub fn ignore_cancel(mut self) -> Self {
        self.ignore_cancel = true;
        self
    }
}

#[derive(Default)]
struct ScriptState {
    turns: VecDeque<ScriptedTurn>,
    sent: Vec<String>,
    started: Vec<SessionConfig>,
    cancels: usize,
    closes: usize,
    fail_starts: usize,
}

/// Backend that replays [`ScriptedTurn`]s. Clones share state.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_turn(self, turn: ScriptedTurn) -> Self {
        self.push_turn(turn);
        self
    }

    pub fn push_turn(&self, turn: ScriptedTurn) {
        self.state.lock().turns.push_back(turn);
    }

    /// Make the next `count` calls to `start` fail with `BackendUnavailable`
    pub fn fail_next_starts(&self, count: usize) {
        self.state.lock().fail_starts = count;
    }

    /// Every message sent to any handle, in order
    pub fn sent_messages(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    pub fn start_count(&self) -> usize {
        self.state.lock().started.len()
    }

    pub fn started_configs(&self) -> Vec<SessionConfig> {
        self.state.lock().started.clone()
    }

    pub fn cancel_count(&self) -> usize {
        self.state.lock().cancels
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().closes
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    async fn start(&self, config: &SessionConfig) -> Result<Box<dyn AgentHandle>> {
        let mut state = self.state.lock();
        if state.fail_starts > 0 {
            state.fail_starts -= 1;
            return Err(Error::Agent(AgentError::BackendUnavailable(
                "scripted backend refused to start".into(),
            )));
        }
        state.started.push(config.clone());
        Ok(Box::new(ScriptedHandle {
            state: Arc::clone(&self.state),
            steps: VecDeque::new(),
            ready_at: None,
            in_turn: false,
            cancelled: false,
            ignore_cancel: false,
            closed: false,
        }))
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

struct ScriptedHandle {
    state: Arc<Mutex<ScriptState>>,
    steps: VecDeque<Step>,
    /// Deadline of the delay in progress; survives a dropped `next_event`
    ready_at: Option<Instant>,
    in_turn: bool,
    cancelled: bool,
    ignore_cancel: bool,
    closed: bool,
}

impl ScriptedHandle {
    fn finish(&mut self, event: AgentEvent) -> Option<AgentEvent> {
        if event.is_terminal() {
            self.in_turn = false;
            self.steps.clear();
        }
        Some(event)
    }
}

#[async_trait]
impl AgentHandle for ScriptedHandle {
    async fn send(&mut self, message: &str) -> Result<()> {
        if self.closed {
            return Err(Error::Agent(AgentError::HandleClosed(
                "scripted handle is closed".into(),
            )));
        }
        let turn = {
            let mut state = self.state.lock();
            state.sent.push(message.to_string());
            state
                .turns
                .pop_front()
                .unwrap_or_else(|| ScriptedTurn::reply("ok"))
        };
        self.steps = turn.steps.into_iter().collect();
        self.ignore_cancel = turn.ignore_cancel;
        self.ready_at = None;
        self.in_turn = true;
        self.cancelled = false;
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<AgentEvent>> {
        loop {
            if !self.in_turn {
                return Ok(None);
            }
            if self.cancelled && !self.ignore_cancel {
                return Ok(self.finish(AgentEvent::Terminal(TerminalEvent::interrupted())));
            }

            let Some(step) = self.steps.front().cloned() else {
                // Script ran out without a terminal event
                self.in_turn = false;
                return Ok(None);
            };

            match step {
                Step::Delay(duration) => {
                    let deadline = *self.ready_at.get_or_insert_with(|| Instant::now() + duration);
                    tokio::time::sleep_until(deadline).await;
                    self.ready_at = None;
                    self.steps.pop_front();
                }
                Step::Hang => futures::future::pending::<()>().await,
                Step::Fail(message) => {
                    self.steps.clear();
                    self.in_turn = false;
                    self.closed = true;
                    return Err(Error::Agent(AgentError::HandleClosed(message)));
                }
                Step::Event(event) => {
                    self.steps.pop_front();
                    return Ok(self.finish(event));
                }
            }
        }
    }

    async fn cancel(&mut self) -> Result<()> {
        self.state.lock().cancels += 1;
        if self.in_turn {
            self.cancelled = true;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.in_turn = false;
            self.state.lock().closes += 1;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
