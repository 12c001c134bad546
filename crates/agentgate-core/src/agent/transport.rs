//! Line-oriented stdio transport to an agent process

use crate::error::{AgentError, Error, Result};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

/// Lines queued in each direction before the writer or reader task waits
const LINE_CHANNEL_CAPACITY: usize = 64;

/// Transport layer for the agent's stdio.
/// Reader and writer run as background tasks connected by bounded channels.
pub struct Transport {
    stdin_tx: mpsc::Sender<String>,
    stdout_rx: mpsc::Receiver<String>,
    _stdin_task: tokio::task::JoinHandle<()>,
    _stdout_task: tokio::task::JoinHandle<()>,
    _stderr_task: tokio::task::JoinHandle<()>,
}

impl Transport {
    /// Spawn the agent process and wire up its pipes
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&Path>,
    ) -> Result<(Self, Child)> {
        debug!("Spawning agent: {} {:?} (cwd: {:?})", command, args, cwd);

        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            unavailable(format!("Failed to spawn agent process '{}': {}", command, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| unavailable("Failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| unavailable("Failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| unavailable("Failed to capture stderr".to_string()))?;

        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(LINE_CHANNEL_CAPACITY);
        let (stdout_tx, stdout_rx) = mpsc::channel::<String>(LINE_CHANNEL_CAPACITY);

        let stdin_task = tokio::spawn(Self::write_stdin_task(stdin, stdin_rx));
        let stdout_task = tokio::spawn(Self::read_stdout_task(stdout, stdout_tx));
        // Drain stderr so the agent can't block on a full pipe.
        let stderr_task = tokio::spawn(Self::read_stderr_task(stderr));

        Ok((
            Self {
                stdin_tx,
                stdout_rx,
                _stdin_task: stdin_task,
                _stdout_task: stdout_task,
                _stderr_task: stderr_task,
            },
            child,
        ))
    }

    async fn write_stdin_task(mut stdin: ChildStdin, mut rx: mpsc::Receiver<String>) {
        while let Some(mut line) = rx.recv().await {
            trace!("Agent stdin: {}", line);
            line.push('\n');
            let written = match stdin.write_all(line.as_bytes()).await {
                Ok(()) => stdin.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                error!("Failed to write to agent stdin: {}", e);
                break;
            }
        }
        debug!("Stdin writer task ended");
    }

    async fn read_stdout_task(stdout: ChildStdout, tx: mpsc::Sender<String>) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    trace!("Agent stdout: {}", trimmed);
                    if tx.send(trimmed.to_string()).await.is_err() {
                        debug!("Stdout receiver dropped");
                        break;
                    }
                }
                Ok(None) => {
                    debug!("Agent stdout closed");
                    break;
                }
                Err(e) => {
                    error!("Error reading agent stdout: {}", e);
                    break;
                }
            }
        }
    }

    async fn read_stderr_task(stderr: ChildStderr) {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        // Agents log here; not fatal.
                        warn!("Agent stderr: {}", trimmed);
                    }
                }
                Ok(None) => {
                    debug!("Agent stderr closed");
                    break;
                }
                Err(e) => {
                    error!("Error reading agent stderr: {}", e);
                    break;
                }
            }
        }
    }

    /// Queue one JSON line for the agent's stdin
    pub async fn send_json(&self, value: &serde_json::Value) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.stdin_tx.send(json).await.map_err(|_| {
            Error::Agent(AgentError::HandleClosed(
                "agent stdin is no longer accepting input".to_string(),
            ))
        })
    }

    /// Next non-empty stdout line; `None` once the agent closed stdout.
    /// Cancel-safe.
    pub async fn recv_line(&mut self) -> Option<String> {
        self.stdout_rx.recv().await
    }
}

fn unavailable(message: String) -> Error {
    Error::Agent(AgentError::BackendUnavailable(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transport_spawn_invalid_command() {
        let result =
            Transport::spawn("nonexistent_agent_command_12345", &[], &HashMap::new(), None).await;

        match result {
            Err(Error::Agent(AgentError::BackendUnavailable(msg))) => {
                assert!(msg.contains("Failed to spawn"))
            }
            Err(other) => panic!("Expected BackendUnavailable, got {:?}", other),
            Ok(_) => panic!("Expected spawn to fail"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_transport_echoes_lines() {
        let (mut transport, _child) = Transport::spawn("cat", &[], &HashMap::new(), None)
            .await
            .unwrap();

        transport
            .send_json(&serde_json::json!({"type": "ping"}))
            .await
            .unwrap();
        let line = transport.recv_line().await.unwrap();
        assert_eq!(line, r#"{"type":"ping"}"#);
    }
}
