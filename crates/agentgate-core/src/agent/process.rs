//! Agent CLI process backend
//!
//! One child process per session, speaking stream-json over stdio.

use super::protocol::{LineDecoder, ProtocolHandler};
use super::transport::Transport;
use super::{AgentBackend, AgentHandle};
use crate::config::GatewayConfig;
use crate::error::{AgentError, Error, Result};
use crate::structured::schema_instructions;
use crate::types::{AgentEvent, SessionConfig, TurnOutcome, BUILTIN_TOOLS};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Child;
use tracing::{debug, info, warn};

/// Time allowed for the process to exit after being killed
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Launches the agent CLI as a child process
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    mcp_config: Option<PathBuf>,
}

impl ProcessBackend {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            mcp_config: None,
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            command: config.agent_command.clone(),
            args: config.agent_args.clone(),
            env: config.agent_env.clone(),
            mcp_config: config.mcp_config.clone(),
        }
    }

    /// MCP server configuration that provides the built-in tools
    pub fn with_mcp_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.mcp_config = Some(path.into());
        self
    }

    /// Extra arguments appended after the generated flags
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
impl AgentBackend for ProcessBackend {
    async fn start(&self, config: &SessionConfig) -> Result<Box<dyn AgentHandle>> {
        let mut args = build_agent_args(config, self.mcp_config.as_deref());
        args.extend(self.args.iter().cloned());

        let (transport, child) =
            Transport::spawn(&self.command, &args, &self.env, config.cwd.as_deref()).await?;
        info!(
            "Started agent process {} (pid {:?})",
            self.command,
            child.id()
        );
        Ok(Box::new(ProcessHandle::new(transport, child)))
    }

    fn describe(&self) -> String {
        format!("process:{}", self.command)
    }
}

/// CLI flags for a session configuration.
///
/// Built-in tools are only advertised when `mcp_config` names the server
/// that provides them.
pub fn build_agent_args(config: &SessionConfig, mcp_config: Option<&Path>) -> Vec<String> {
    let mut args: Vec<String> = [
        "--output-format",
        "stream-json",
        "--input-format",
        "stream-json",
        "--verbose",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    if let Some(prompt) = &config.system_prompt {
        args.push("--system-prompt".into());
        args.push(prompt.clone());
    }

    let mut tools = config.effective_allowed_tools();
    match mcp_config {
        Some(path) if config.include_custom_tools => {
            args.push("--mcp-config".into());
            args.push(path.to_string_lossy().to_string());
            tools.extend(BUILTIN_TOOLS.iter().map(|t| t.to_string()));
        }
        None if config.include_custom_tools => {
            debug!("No MCP config; built-in tools are not offered");
        }
        _ => {}
    }
    if tools.is_empty() {
        // Empty allow-list disables every tool
        args.push("--tools".into());
        args.push(String::new());
    } else {
        args.push("--allowedTools".into());
        args.push(tools.into_iter().collect::<Vec<_>>().join(","));
    }

    args.push("--permission-mode".into());
    args.push(config.permission_mode.as_str().to_string());

    if let Some(max_turns) = config.max_turns {
        args.push("--max-turns".into());
        args.push(max_turns.to_string());
    }

    if let Some(sources) = config.effective_setting_sources() {
        args.push("--setting-sources".into());
        args.push(sources.join(","));
    }

    if let Some(schema) = config.output_schema() {
        args.push("--append-system-prompt".into());
        args.push(schema_instructions(schema));
    }

    args
}

/// Handle to one running agent process
pub struct ProcessHandle {
    transport: Transport,
    child: Child,
    protocol: ProtocolHandler,
    decoder: LineDecoder,
    pending: VecDeque<AgentEvent>,
    in_turn: bool,
    interrupt_requested: bool,
    closed: bool,
}

impl ProcessHandle {
    pub fn new(transport: Transport, child: Child) -> Self {
        Self {
            transport,
            child,
            protocol: ProtocolHandler::new(),
            decoder: LineDecoder::new(),
            pending: VecDeque::new(),
            in_turn: false,
            interrupt_requested: false,
            closed: false,
        }
    }

    fn closed_error(&self) -> Error {
        Error::Agent(AgentError::HandleClosed("agent process has terminated".into()))
    }

    /// Bookkeeping when an event leaves the handle
    fn emit(&mut self, event: AgentEvent) -> AgentEvent {
        match event {
            AgentEvent::Terminal(mut terminal) => {
                self.in_turn = false;
                if self.interrupt_requested && !terminal.outcome.is_cancellation() {
                    terminal.outcome = TurnOutcome::Interrupted;
                }
                self.interrupt_requested = false;
                AgentEvent::Terminal(terminal)
            }
            other => other,
        }
    }
}

#[async_trait]
impl AgentHandle for ProcessHandle {
    async fn send(&mut self, message: &str) -> Result<()> {
        if self.closed {
            return Err(self.closed_error());
        }
        let line = self.protocol.create_user_message(message);
        self.transport.send_json(&line).await?;
        self.pending.clear();
        self.in_turn = true;
        self.interrupt_requested = false;
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<AgentEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(self.emit(event)));
            }
            if !self.in_turn {
                return Ok(None);
            }

            let Some(line) = self.transport.recv_line().await else {
                warn!("Agent process closed stdout mid-turn");
                self.closed = true;
                self.in_turn = false;
                return Err(Error::Agent(AgentError::HandleClosed(
                    "agent process exited before finishing the turn".into(),
                )));
            };

            let decoded = match self.decoder.push(&line) {
                Ok(decoded) => decoded,
                Err(e) => {
                    // A lost message may have been the terminal one
                    self.in_turn = false;
                    return Err(e);
                }
            };
            if let Some(value) = decoded {
                match self.protocol.parse_message(&value) {
                    Ok(events) => self.pending.extend(events),
                    Err(e) => debug!("Skipping agent message: {}", e),
                }
            }
        }
    }

    async fn cancel(&mut self) -> Result<()> {
        if self.closed || !self.in_turn || self.interrupt_requested {
            return Ok(());
        }
        debug!("Sending interrupt to agent process");
        let request = self.protocol.create_interrupt_request();
        self.transport.send_json(&request).await?;
        self.interrupt_requested = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.in_turn = false;

        if let Err(e) = self.child.start_kill() {
            debug!("Agent process already gone: {}", e);
        }
        match tokio::time::timeout(KILL_WAIT, self.child.wait()).await {
            Ok(Ok(status)) => debug!("Agent process exited with {}", status),
            Ok(Err(e)) => warn!("Failed to reap agent process: {}", e),
            Err(_) => warn!("Agent process did not exit within {:?}", KILL_WAIT),
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
