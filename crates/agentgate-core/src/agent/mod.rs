//! Agent backend abstraction
//!
//! This module defines the seam between sessions and the opaque agent:
//! - `AgentBackend` - Launches agent instances scoped to a session configuration
//! - `AgentHandle` - One running agent instance: send, pull events, cancel, close
//!
//! `ProcessBackend` drives the agent CLI over stdio; `ScriptedBackend` replays
//! canned turns for tests and local development.

mod process;
mod protocol;
pub mod scripted;
mod transport;

pub use process::{build_agent_args, ProcessBackend, ProcessHandle};
pub use protocol::{LineDecoder, ProtocolHandler};
pub use scripted::{ScriptedBackend, ScriptedTurn};
pub use transport::Transport;

use crate::error::Result;
use crate::types::{AgentEvent, SessionConfig};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;

// ============================================================================
// Agent Backend Trait
// ============================================================================

/// Factory for agent instances.
///
/// A backend is shared by every session in the registry; each `start` call
/// yields an independent handle owned by exactly one session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Launch one agent instance for the given configuration.
    ///
    /// Fails with `AgentError::BackendUnavailable` if the instance cannot be
    /// established.
    async fn start(&self, config: &SessionConfig) -> Result<Box<dyn AgentHandle>>;

    /// Human-readable description for logs and health output
    fn describe(&self) -> String;
}

// ============================================================================
// Agent Handle Trait
// ============================================================================

/// One running agent instance.
///
/// Events are pulled one at a time with [`AgentHandle::next_event`]. The
/// sequence for a sent message is finite and ends with a terminal event;
/// after that, `next_event` yields `None` until the next `send`.
///
/// `next_event` must be cancel-safe: dropping its future before completion
/// must not lose an event, since turn drivers race it against cancellation
/// and deadlines.
#[async_trait]
pub trait AgentHandle: Send {
    /// Deliver one user turn. Fails with `AgentError::HandleClosed` after termination.
    async fn send(&mut self, message: &str) -> Result<()>;

    /// Pull the next event of the current turn
    async fn next_event(&mut self) -> Result<Option<AgentEvent>>;

    /// Ask the in-flight turn to stop. Observed as an `interrupted` terminal event.
    async fn cancel(&mut self) -> Result<()>;

    /// Release the underlying instance. Idempotent.
    async fn close(&mut self) -> Result<()>;

    fn is_closed(&self) -> bool;

    /// Events of the current turn as a stream, ending after the terminal
    /// event or the first error
    fn events(&mut self) -> BoxStream<'_, Result<AgentEvent>> {
        futures::stream::unfold(Some(self), |state| async move {
            let handle = state?;
            match handle.next_event().await {
                Ok(Some(event)) => {
                    let next = if event.is_terminal() { None } else { Some(handle) };
                    Some((Ok(event), next))
                }
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
        .boxed()
    }
}
