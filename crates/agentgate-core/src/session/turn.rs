//! Turn execution
//!
//! A `TurnDriver` runs one turn as its own task: it starts the agent handle
//! lazily, forwards the message, relays events through a bounded channel,
//! enforces the turn deadline and cancellation grace, and runs the
//! structured-output loop. The caller holds the receiving end as a
//! [`TurnStream`].

use super::SessionInner;
use crate::agent::{AgentBackend, AgentHandle};
use crate::config::SessionSettings;
use crate::error::Result;
use crate::structured::{RetryDecision, StructuredOutputAttempt, StructuredOutputValidator};
use crate::types::{AgentEvent, SessionConfig, SessionId, SessionState, TerminalEvent, TurnOutcome, TurnResult};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch, OwnedMutexGuard};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

pub(crate) type HandleSlot = Arc<Mutex<Option<Box<dyn AgentHandle>>>>;

// ============================================================================
// Turn Stream
// ============================================================================

/// Caller side of one turn: agent events in production order, ending with
/// exactly one terminal event.
///
/// Dropping the stream before the terminal event cancels the turn.
#[derive(Debug)]
pub struct TurnStream {
    session_id: SessionId,
    rx: mpsc::Receiver<AgentEvent>,
    cancel_on_drop: Option<DropGuard>,
}

impl TurnStream {
    pub(crate) fn new(session_id: SessionId, rx: mpsc::Receiver<AgentEvent>, cancel: CancellationToken) -> Self {
        Self {
            session_id,
            rx,
            cancel_on_drop: Some(cancel.drop_guard()),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Drain the stream and return the terminal event as a result
    pub async fn into_result(mut self) -> TurnResult {
        while let Some(event) = self.next().await {
            if let AgentEvent::Terminal(terminal) = event {
                return terminal.into_result(self.session_id.clone());
            }
        }
        TerminalEvent::error("turn ended without a result").into_result(self.session_id.clone())
    }

    fn disarm(&mut self) {
        if let Some(guard) = self.cancel_on_drop.take() {
            guard.disarm();
        }
    }
}

impl Stream for TurnStream {
    type Item = AgentEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.rx.poll_recv(cx);
        match &polled {
            Poll::Ready(Some(event)) if event.is_terminal() => self.disarm(),
            Poll::Ready(None) => self.disarm(),
            _ => {}
        }
        polled
    }
}

// ============================================================================
// Turn Driver
// ============================================================================

enum Step {
    Event(Result<Option<AgentEvent>>),
    Cancel(TurnOutcome),
    GraceExpired,
}

/// How one pass (one message sent to the agent) ended
enum Pass {
    /// Terminal event received; the handle is reusable
    Finished(TerminalEvent),
    /// The handle failed or ignored cancellation; it must be discarded
    Abandoned(TerminalEvent),
}

pub(crate) struct TurnDriver {
    pub session_id: SessionId,
    pub config: Arc<SessionConfig>,
    pub settings: SessionSettings,
    pub backend: Arc<dyn AgentBackend>,
    pub validator: Option<Arc<StructuredOutputValidator>>,
    pub slot: HandleSlot,
    pub inner: Arc<Mutex<SessionInner>>,
    pub cancel: CancellationToken,
    pub events: mpsc::Sender<AgentEvent>,
}

impl TurnDriver {
    pub async fn run(self, message: String, guard: OwnedMutexGuard<()>, finished: watch::Sender<bool>) {
        let started = Instant::now();
        let deadline = started + self.settings.max_turn_duration;

        let (mut terminal, handle) = self.drive(message, deadline).await;
        if terminal.duration_ms.is_none() {
            terminal.duration_ms = Some(started.elapsed().as_millis() as u64);
        }
        info!(
            "Turn finished for session {}: {} ({:?})",
            self.session_id,
            terminal.outcome,
            started.elapsed()
        );

        self.release_handle(handle).await;
        {
            let mut inner = self.inner.lock();
            inner.active = None;
            if !inner.state.is_closed() {
                inner.state = SessionState::Idle;
            }
        }
        drop(guard);
        let _ = finished.send(true);

        if self.events.send(AgentEvent::Terminal(terminal)).await.is_err() {
            debug!("Turn stream for session {} dropped before the result", self.session_id);
        }
    }

    async fn drive(&self, message: String, deadline: Instant) -> (TerminalEvent, Option<Box<dyn AgentHandle>>) {
        let mut handle = match self.acquire_handle(deadline).await {
            Ok(handle) => handle,
            Err(terminal) => return (terminal, None),
        };

        let mut message = message;
        let mut attempt = StructuredOutputAttempt::new();
        let mut total_cost: Option<f64> = None;

        loop {
            if let Err(e) = handle.send(&message).await {
                warn!("Failed to send message to agent for session {}: {}", self.session_id, e);
                return (TerminalEvent::error(e.to_string()), self.discard(handle).await);
            }

            let mut terminal = match self.pump(handle.as_mut(), deadline).await {
                Pass::Finished(terminal) => terminal,
                Pass::Abandoned(mut terminal) => {
                    terminal.cost_usd = add_cost(total_cost, terminal.cost_usd);
                    return (terminal, self.discard(handle).await);
                }
            };
            total_cost = add_cost(total_cost, terminal.cost_usd);
            terminal.cost_usd = total_cost;

            let Some(validator) = &self.validator else {
                terminal.structured_output = None;
                return (terminal, Some(handle));
            };
            if !terminal.outcome.is_success() {
                return (terminal, Some(handle));
            }

            let error = match validator.check_terminal(&terminal) {
                Ok(payload) => {
                    terminal.structured_output = Some(payload.into_inner());
                    if attempt.attempt > 0 {
                        // Duration spans every attempt
                        terminal.duration_ms = None;
                    }
                    return (terminal, Some(handle));
                }
                Err(error) => error,
            };

            attempt.record_failure(error.clone());
            match validator.retry_policy(attempt.attempt, &error) {
                RetryDecision::Retry { attempt: n, message: corrective } => {
                    info!(
                        "Structured output rejected for session {} (attempt {}), re-prompting",
                        self.session_id, n
                    );
                    message = corrective;
                }
                RetryDecision::GiveUp { message, .. } => {
                    warn!("Session {}: {}", self.session_id, message);
                    let mut failed = TerminalEvent::new(TurnOutcome::ErrorMaxStructuredOutputRetries, message);
                    failed.cost_usd = total_cost;
                    return (failed, Some(handle));
                }
            }
        }
    }

    /// Reuse the session's handle or start one, racing cancellation and the deadline
    async fn acquire_handle(&self, deadline: Instant) -> std::result::Result<Box<dyn AgentHandle>, TerminalEvent> {
        let existing = self.slot.lock().take();
        if let Some(handle) = existing {
            if !handle.is_closed() {
                return Ok(handle);
            }
            debug!("Discarding closed handle for session {}", self.session_id);
        }

        debug!("Starting agent for session {} via {}", self.session_id, self.backend.describe());
        let started = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(TerminalEvent::interrupted()),
            _ = sleep_until(deadline) => return Err(TerminalEvent::timed_out()),
            started = self.backend.start(&self.config) => started,
        };

        match started {
            Ok(handle) => {
                self.inner.lock().has_handle = true;
                Ok(handle)
            }
            Err(e) => {
                warn!("Failed to start agent for session {}: {}", self.session_id, e);
                self.inner.lock().has_handle = false;
                Err(TerminalEvent::error(e.to_string()))
            }
        }
    }

    /// Relay events of one pass until its terminal event
    async fn pump(&self, handle: &mut dyn AgentHandle, deadline: Instant) -> Pass {
        let mut cancelled_as: Option<TurnOutcome> = None;
        let mut grace_deadline: Option<Instant> = None;

        loop {
            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if cancelled_as.is_none() => Step::Cancel(TurnOutcome::Interrupted),
                _ = sleep_until(deadline), if cancelled_as.is_none() => Step::Cancel(TurnOutcome::Timeout),
                _ = sleep_until(grace_deadline.unwrap_or(deadline)), if grace_deadline.is_some() => Step::GraceExpired,
                event = handle.next_event() => Step::Event(event),
            };

            match step {
                Step::Cancel(outcome) => {
                    debug!("Cancelling turn for session {} ({})", self.session_id, outcome);
                    cancelled_as = Some(outcome);
                    grace_deadline = Some(Instant::now() + self.settings.interrupt_grace);
                    if let Err(e) = handle.cancel().await {
                        warn!("Agent rejected cancellation for session {}: {}", self.session_id, e);
                        return Pass::Abandoned(synthesized(outcome));
                    }
                }
                Step::GraceExpired => {
                    warn!(
                        "Agent for session {} did not stop within {:?}; discarding it",
                        self.session_id, self.settings.interrupt_grace
                    );
                    return Pass::Abandoned(synthesized(cancelled_as.unwrap_or(TurnOutcome::Interrupted)));
                }
                Step::Event(Ok(Some(AgentEvent::Terminal(terminal)))) => {
                    return Pass::Finished(match cancelled_as {
                        Some(outcome) => override_outcome(terminal, outcome),
                        None => terminal,
                    });
                }
                Step::Event(Ok(Some(event))) => self.forward(event).await,
                Step::Event(Ok(None)) => {
                    return Pass::Abandoned(match cancelled_as {
                        Some(outcome) => synthesized(outcome),
                        None => TerminalEvent::error("agent ended the turn without a result"),
                    });
                }
                Step::Event(Err(e)) => {
                    warn!("Agent handle failed for session {}: {}", self.session_id, e);
                    return Pass::Abandoned(match cancelled_as {
                        Some(outcome) => synthesized(outcome),
                        None => TerminalEvent::error(e.to_string()),
                    });
                }
            }
        }
    }

    /// Deliver one non-terminal event; a vanished receiver cancels the turn
    async fn forward(&self, event: AgentEvent) {
        if self.events.is_closed() {
            return;
        }
        if self.events.send(event).await.is_err() {
            debug!("Turn stream for session {} dropped; cancelling", self.session_id);
            self.cancel.cancel();
        }
    }

    async fn discard(&self, mut handle: Box<dyn AgentHandle>) -> Option<Box<dyn AgentHandle>> {
        if let Err(e) = handle.close().await {
            debug!("Error closing discarded handle for session {}: {}", self.session_id, e);
        }
        self.inner.lock().has_handle = false;
        None
    }

    /// Put the handle back for the next turn, or close it if the session is gone
    async fn release_handle(&self, handle: Option<Box<dyn AgentHandle>>) {
        let Some(handle) = handle else {
            return;
        };
        let leftover = {
            let mut slot = self.slot.lock();
            if self.inner.lock().state.is_closed() || handle.is_closed() {
                Some(handle)
            } else {
                *slot = Some(handle);
                None
            }
        };
        if let Some(handle) = leftover {
            self.discard(handle).await;
        }
    }
}

fn synthesized(outcome: TurnOutcome) -> TerminalEvent {
    match outcome {
        TurnOutcome::Timeout => TerminalEvent::timed_out(),
        _ => TerminalEvent::interrupted(),
    }
}

fn override_outcome(terminal: TerminalEvent, outcome: TurnOutcome) -> TerminalEvent {
    let mut replacement = synthesized(outcome);
    replacement.cost_usd = terminal.cost_usd;
    replacement.duration_ms = terminal.duration_ms;
    replacement
}

fn add_cost(total: Option<f64>, cost: Option<f64>) -> Option<f64> {
    match (total, cost) {
        (Some(a), Some(b)) => Some(a + b),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_cost() {
        assert_eq!(add_cost(None, None), None);
        assert_eq!(add_cost(Some(0.5), None), Some(0.5));
        assert_eq!(add_cost(None, Some(0.25)), Some(0.25));
        assert_eq!(add_cost(Some(0.5), Some(0.25)), Some(0.75));
    }

    #[test]
    fn test_override_keeps_cost() {
        let terminal = TerminalEvent::success("partial").with_cost(0.1);
        let replaced = override_outcome(terminal, TurnOutcome::Timeout);
        assert_eq!(replaced.outcome, TurnOutcome::Timeout);
        assert_eq!(replaced.cost_usd, Some(0.1));
    }

    #[tokio::test]
    async fn test_dropping_stream_cancels() {
        let cancel = CancellationToken::new();
        let (_tx, rx) = mpsc::channel(1);
        let stream = TurnStream::new(SessionId::new("s"), rx, cancel.clone());
        drop(stream);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_finished_stream_does_not_cancel() {
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(2);
        let mut stream = TurnStream::new(SessionId::new("s"), rx, cancel.clone());
        tx.send(AgentEvent::Terminal(TerminalEvent::success("ok"))).await.unwrap();

        assert!(stream.next().await.unwrap().is_terminal());
        drop(stream);
        assert!(!cancel.is_cancelled());
    }
}
