//! Core type definitions for AgentGate
//!
//! This module contains the shared types used across the crate: session
//! configuration, the agent event vocabulary, wire events and the normalized
//! request structs handed in by the routing layer.

mod event_types;
mod request_types;
mod session_types;

pub use event_types::*;
pub use request_types::*;
pub use session_types::*;
