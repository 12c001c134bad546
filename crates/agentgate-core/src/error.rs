//! Error types for AgentGate Core

use crate::types::SessionId;
use thiserror::Error;

/// Main error type for AgentGate operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when the error names a session the registry does not hold
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Session(SessionError::NotFound(_)))
    }
}

/// Session and turn lifecycle errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),

    #[error("A turn is already in progress for session {0}")]
    TurnInProgress(SessionId),

    #[error("No active turn for session {0}")]
    NoActiveTurn(SessionId),
}

/// Agent backend errors
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Agent backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Agent handle closed: {0}")]
    HandleClosed(String),

    #[error("Agent protocol error: {0}")]
    Protocol(String),
}

/// Session configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid output schema: {0}")]
    InvalidSchema(String),

    #[error("Invalid output format: {0}")]
    InvalidOutputFormat(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

/// Scratch workspace errors
#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("Failed to create workspace {path}: {message}")]
    CreateFailed { path: String, message: String },

    #[error("Failed to clean up workspace {path}: {message}")]
    CleanupFailed { path: String, message: String },
}

impl serde::Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_nests_context() {
        let err = Error::from(SessionError::TurnInProgress(SessionId::new("abc")));
        assert_eq!(
            err.to_string(),
            "Session error: A turn is already in progress for session abc"
        );
    }

    #[test]
    fn test_is_not_found() {
        assert!(Error::from(SessionError::NotFound(SessionId::new("x"))).is_not_found());
        assert!(!Error::Internal("x".into()).is_not_found());
    }

    #[test]
    fn test_error_serializes_as_message() {
        let err = Error::from(AgentError::HandleClosed("gone".into()));
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(json, "\"Agent error: Agent handle closed: gone\"");
    }
}
