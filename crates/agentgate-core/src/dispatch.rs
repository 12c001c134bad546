//! Streaming dispatcher
//!
//! Projects a turn's agent events onto wire events, one-to-one and in order,
//! then closes the stream with an explicit end marker. A source that ends
//! without a terminal event still yields an `error` result before the marker.

use crate::error::Result;
use crate::session::TurnStream;
use crate::types::{AgentEvent, SessionId, TerminalEvent, WireEvent};
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::warn;

/// End-of-stream sentinel on SSE transports
pub const SSE_DONE: &str = "data: [DONE]\n\n";

/// One outbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    Event(WireEvent),
    /// End of stream; always follows the result event
    Done,
}

impl WireFrame {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Server-sent-events encoding
    pub fn to_sse(&self) -> Result<String> {
        match self {
            Self::Event(event) => Ok(format!("data: {}\n\n", serde_json::to_string(event)?)),
            Self::Done => Ok(SSE_DONE.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchState {
    Streaming,
    /// Result sent; `Done` is next
    Closing,
    Finished,
}

/// Wire-frame stream over a turn's agent events.
///
/// Pulls from the source only when polled, so a slow consumer pauses the
/// turn at the agent boundary instead of buffering.
pub struct Dispatcher<S> {
    source: S,
    session_id: SessionId,
    state: DispatchState,
}

impl<S> Dispatcher<S>
where
    S: Stream<Item = AgentEvent> + Unpin,
{
    pub fn new(source: S, session_id: SessionId) -> Self {
        Self {
            source,
            session_id,
            state: DispatchState::Streaming,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

/// Dispatch a turn stream
pub fn dispatch(turn: TurnStream) -> Dispatcher<TurnStream> {
    let session_id = turn.session_id().clone();
    Dispatcher::new(turn, session_id)
}

impl<S> Stream for Dispatcher<S>
where
    S: Stream<Item = AgentEvent> + Unpin,
{
    type Item = WireFrame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.state {
            DispatchState::Finished => Poll::Ready(None),
            DispatchState::Closing => {
                self.state = DispatchState::Finished;
                Poll::Ready(Some(WireFrame::Done))
            }
            DispatchState::Streaming => match self.source.poll_next_unpin(cx) {
                Poll::Ready(Some(event)) => {
                    if event.is_terminal() {
                        self.state = DispatchState::Closing;
                    }
                    let wire = WireEvent::from_agent_event(event, &self.session_id);
                    Poll::Ready(Some(WireFrame::Event(wire)))
                }
                Poll::Ready(None) => {
                    warn!("Turn stream for session {} ended without a result", self.session_id);
                    self.state = DispatchState::Closing;
                    let terminal = TerminalEvent::error("agent stream ended without a result");
                    Poll::Ready(Some(WireFrame::Event(WireEvent::Result(
                        terminal.into_result(self.session_id.clone()),
                    ))))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}
