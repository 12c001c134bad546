//! Sessions and the session registry
//!
//! A [`Session`] owns at most one agent handle and serializes turns over it.
//! The [`SessionRegistry`] is the process-wide table of live sessions and the
//! only component that creates or destroys them.

mod registry;
mod turn;

pub use registry::SessionRegistry;
pub use turn::TurnStream;

use crate::agent::AgentBackend;
use crate::config::SessionSettings;
use crate::error::{Result, SessionError};
use crate::structured::StructuredOutputValidator;
use crate::types::{SessionConfig, SessionId, SessionState, SessionSummary, TurnResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use turn::{HandleSlot, TurnDriver};

/// Bookkeeping for the turn in flight
struct ActiveTurn {
    cancel: CancellationToken,
    finished: watch::Receiver<bool>,
}

pub(crate) struct SessionInner {
    state: SessionState,
    active: Option<ActiveTurn>,
    turn_count: u64,
    has_handle: bool,
}

/// One conversational context bound to one agent instance
pub struct Session {
    id: SessionId,
    config: Arc<SessionConfig>,
    settings: SessionSettings,
    backend: Arc<dyn AgentBackend>,
    validator: Option<Arc<StructuredOutputValidator>>,
    handle: HandleSlot,
    turn_lock: Arc<tokio::sync::Mutex<()>>,
    inner: Arc<Mutex<SessionInner>>,
    created_at: DateTime<Utc>,
}

impl Session {
    /// Validate `config` and build a session. No agent is started until the first turn.
    pub fn new(
        id: SessionId,
        config: SessionConfig,
        backend: Arc<dyn AgentBackend>,
        settings: SessionSettings,
    ) -> Result<Self> {
        let validator = Self::validate_config(&config, &settings)?;
        Ok(Self {
            id,
            config: Arc::new(config),
            settings,
            backend,
            validator,
            handle: Arc::new(Mutex::new(None)),
            turn_lock: Arc::new(tokio::sync::Mutex::new(())),
            inner: Arc::new(Mutex::new(SessionInner {
                state: SessionState::Uninitialized,
                active: None,
                turn_count: 0,
                has_handle: false,
            })),
            created_at: Utc::now(),
        })
    }

    /// Check a configuration; yields the compiled validator if a schema is set
    pub fn validate_config(
        config: &SessionConfig,
        settings: &SessionSettings,
    ) -> Result<Option<Arc<StructuredOutputValidator>>> {
        match config.output_schema() {
            Some(schema) => {
                let validator = StructuredOutputValidator::new(
                    schema.clone(),
                    settings.max_structured_output_retries,
                )?;
                Ok(Some(Arc::new(validator)))
            }
            None => Ok(None),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().active.is_some()
    }

    /// Completion signal of the turn in flight, if any
    pub(crate) fn running_turn(&self) -> Option<watch::Receiver<bool>> {
        self.inner.lock().active.as_ref().map(|a| a.finished.clone())
    }

    pub fn summary(&self) -> SessionSummary {
        let inner = self.inner.lock();
        SessionSummary {
            session_id: self.id.clone(),
            state: inner.state,
            turn_count: inner.turn_count,
            has_handle: inner.has_handle,
            created_at: self.created_at,
        }
    }

    /// Start a turn and return its event stream.
    ///
    /// Fails fast with `TurnInProgress` if a turn is already running; turns
    /// are never queued.
    pub fn run_turn(&self, message: impl Into<String>) -> Result<TurnStream> {
        if self.state().is_closed() {
            return Err(SessionError::NotFound(self.id.clone()).into());
        }
        let guard = Arc::clone(&self.turn_lock)
            .try_lock_owned()
            .map_err(|_| SessionError::TurnInProgress(self.id.clone()))?;

        let cancel = CancellationToken::new();
        let (finished_tx, finished_rx) = watch::channel(false);
        {
            let mut inner = self.inner.lock();
            if inner.state.is_closed() {
                return Err(SessionError::NotFound(self.id.clone()).into());
            }
            inner.state = SessionState::Running;
            inner.turn_count += 1;
            inner.active = Some(ActiveTurn {
                cancel: cancel.clone(),
                finished: finished_rx,
            });
            debug!("Session {} starting turn {}", self.id, inner.turn_count);
        }

        let (tx, rx) = mpsc::channel(self.settings.event_buffer.max(1));
        let driver = TurnDriver {
            session_id: self.id.clone(),
            config: Arc::clone(&self.config),
            settings: self.settings,
            backend: Arc::clone(&self.backend),
            validator: self.validator.clone(),
            slot: Arc::clone(&self.handle),
            inner: Arc::clone(&self.inner),
            cancel: cancel.clone(),
            events: tx,
        };
        tokio::spawn(driver.run(message.into(), guard, finished_tx));

        Ok(TurnStream::new(self.id.clone(), rx, cancel))
    }

    /// Run a turn to completion
    pub async fn run_turn_collect(&self, message: impl Into<String>) -> Result<TurnResult> {
        Ok(self.run_turn(message)?.into_result().await)
    }

    /// Cancel the turn in flight and wait (bounded) for it to finish.
    ///
    /// Fails with `NoActiveTurn` when no turn is running or no agent has been
    /// started yet.
    pub async fn interrupt(&self) -> Result<()> {
        let (cancel, finished) = {
            let inner = self.inner.lock();
            match &inner.active {
                Some(active) if inner.has_handle => (active.cancel.clone(), active.finished.clone()),
                _ => return Err(SessionError::NoActiveTurn(self.id.clone()).into()),
            }
        };

        info!("Interrupting turn for session {}", self.id);
        cancel.cancel();
        // The driver gives up on the agent after interrupt_grace; allow a margin past that.
        let wait = self.settings.interrupt_grace * 2;
        if !wait_finished(finished, wait).await {
            warn!("Turn for session {} still winding down after {:?}", self.id, wait);
        }
        Ok(())
    }

    /// Mark the session closed, stop any turn in flight and release the agent.
    /// Idempotent.
    pub async fn close(&self) {
        let active = {
            let mut inner = self.inner.lock();
            if inner.state.is_closed() && inner.active.is_none() && !inner.has_handle {
                return;
            }
            inner.state = SessionState::Closed;
            inner
                .active
                .as_ref()
                .map(|a| (a.cancel.clone(), a.finished.clone()))
        };

        if let Some((cancel, finished)) = active {
            cancel.cancel();
            if !wait_finished(finished, self.settings.close_grace).await {
                warn!(
                    "Session {} closed with a turn still running; its agent is released when the turn ends",
                    self.id
                );
            }
        }

        let handle = self.handle.lock().take();
        if let Some(mut handle) = handle {
            if let Err(e) = handle.close().await {
                warn!("Failed to close agent for session {}: {}", self.id, e);
            }
            self.inner.lock().has_handle = false;
        }
        info!("Session {} closed", self.id);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

async fn wait_finished(mut finished: watch::Receiver<bool>, limit: std::time::Duration) -> bool {
    // A dropped sender means the driver already finished.
    let wait = async { finished.wait_for(|done| *done).await.map(|_| ()).unwrap_or(()) };
    tokio::time::timeout(limit, wait).await.is_ok()
}
