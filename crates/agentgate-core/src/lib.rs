//! AgentGate Core Library
//!
//! Session and streaming core of the agent gateway:
//! - Agent backends that drive an opaque agent process over a line protocol
//! - Sessions with one-turn-at-a-time semantics, interrupts and timeouts
//! - Structured output validation with corrective re-prompting
//! - A streaming dispatcher that turns agent events into wire frames
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      agentgate-core                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  gateway.rs    - Facade: query, sessions, chat, interrupt   │
//! │  session/      - Session registry, turn driver              │
//! │  agent/        - Backend trait, process + scripted backends │
//! │  structured/   - Schema validation, retry policy            │
//! │  dispatch.rs   - Wire frames, SSE encoding                  │
//! │  workspace.rs  - Scratch working directories                │
//! │  skills.rs     - Skill discovery                            │
//! │  config.rs     - Gateway configuration                      │
//! │  types/        - Shared type definitions                    │
//! │  error.rs      - Error types                                │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod agent;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod session;
pub mod skills;
pub mod structured;
pub mod types;
pub mod workspace;

pub use error::{Error, Result};
pub use types::*;

pub use agent::{AgentBackend, AgentHandle, ProcessBackend, ScriptedBackend, ScriptedTurn};
pub use config::{GatewayConfig, SessionSettings};
pub use dispatch::{dispatch, Dispatcher, WireFrame, SSE_DONE};
pub use gateway::{Gateway, QueryStream};
pub use session::{Session, SessionRegistry, TurnStream};
pub use skills::{list_skills, SkillInfo, SkillLocation, SkillsList};
pub use structured::{RetryDecision, StructuredOutputValidator, ValidatedPayload};
pub use workspace::{WorkspaceManager, WorkspaceOwner};
