//! Normalized requests handed in by the routing layer, and their responses

use super::{OutputFormat, PermissionMode, SessionConfig, SessionId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_query_tools() -> Vec<String> {
    ["Read", "Grep", "Glob"].iter().map(|s| s.to_string()).collect()
}

fn default_session_tools() -> Vec<String> {
    ["Read", "Write", "Edit", "Bash", "Grep", "Glob"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_session_permission_mode() -> PermissionMode {
    PermissionMode::AcceptEdits
}

fn default_true() -> bool {
    true
}

/// One-shot query: ephemeral session, exactly one turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default = "default_query_tools")]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub permission_mode: Option<PermissionMode>,
    #[serde(default = "default_true")]
    pub include_custom_tools: bool,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub setting_sources: Vec<String>,
    #[serde(default)]
    pub output_format: Option<OutputFormat>,
}

impl QueryRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            max_turns: None,
            allowed_tools: default_query_tools(),
            permission_mode: None,
            include_custom_tools: true,
            skills: Vec::new(),
            setting_sources: Vec::new(),
            output_format: None,
        }
    }

    /// Session configuration for the ephemeral session; `cwd` is the scratch workspace
    pub fn to_config(&self, cwd: Option<PathBuf>) -> SessionConfig {
        SessionConfig {
            system_prompt: self.system_prompt.clone(),
            allowed_tools: self.allowed_tools.iter().cloned().collect(),
            permission_mode: self.permission_mode.unwrap_or_default(),
            cwd,
            output_format: self.output_format.clone(),
            include_custom_tools: self.include_custom_tools,
            max_turns: self.max_turns,
            skills: self.skills.clone(),
            setting_sources: self.setting_sources.clone(),
        }
    }
}

/// Create a persistent session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_session_tools")]
    pub allowed_tools: Vec<String>,
    #[serde(default = "default_session_permission_mode")]
    pub permission_mode: PermissionMode,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub include_custom_tools: bool,
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub setting_sources: Vec<String>,
    #[serde(default)]
    pub output_format: Option<OutputFormat>,
}

impl Default for CreateSessionRequest {
    fn default() -> Self {
        Self {
            system_prompt: None,
            allowed_tools: default_session_tools(),
            permission_mode: default_session_permission_mode(),
            cwd: None,
            include_custom_tools: true,
            max_turns: None,
            skills: Vec::new(),
            setting_sources: Vec::new(),
            output_format: None,
        }
    }
}

impl CreateSessionRequest {
    pub fn to_config(&self) -> SessionConfig {
        SessionConfig {
            system_prompt: self.system_prompt.clone(),
            allowed_tools: self.allowed_tools.iter().cloned().collect(),
            permission_mode: self.permission_mode,
            cwd: self.cwd.clone(),
            output_format: self.output_format.clone(),
            include_custom_tools: self.include_custom_tools,
            max_turns: self.max_turns,
            skills: self.skills.clone(),
            setting_sources: self.setting_sources.clone(),
        }
    }
}

/// Run one turn in an existing session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

/// Status reported by session operations
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Deleted,
    Interrupted,
}

/// Response for create/delete/interrupt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionResponse {
    pub session_id: SessionId,
    pub status: SessionStatus,
}

impl SessionResponse {
    pub fn new(session_id: SessionId, status: SessionStatus) -> Self {
        Self { session_id, status }
    }
}

/// Registry introspection: live ids in creation order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionList {
    pub sessions: Vec<SessionId>,
    pub count: usize,
}

impl SessionList {
    pub fn new(sessions: Vec<SessionId>) -> Self {
        let count = sessions.len();
        Self { sessions, count }
    }
}

/// Liveness report
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthStatus {
    pub status: String,
    pub service: String,
    pub sessions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_request_defaults() {
        let request: QueryRequest = serde_json::from_value(json!({"prompt": "hi"})).unwrap();
        assert_eq!(request.allowed_tools, vec!["Read", "Grep", "Glob"]);
        assert!(request.include_custom_tools);
        assert!(request.output_format.is_none());

        let config = request.to_config(Some(PathBuf::from("/tmp/ws")));
        assert_eq!(config.permission_mode, PermissionMode::Default);
        assert_eq!(config.cwd, Some(PathBuf::from("/tmp/ws")));
        assert!(config.allowed_tools.contains("Glob"));
    }

    #[test]
    fn test_create_session_defaults() {
        let request: CreateSessionRequest = serde_json::from_value(json!({})).unwrap();
        assert_eq!(request.permission_mode, PermissionMode::AcceptEdits);
        assert_eq!(request.allowed_tools.len(), 6);
        assert!(request.cwd.is_none());
    }

    #[test]
    fn test_rejects_unknown_output_format_type() {
        let result = serde_json::from_value::<CreateSessionRequest>(json!({
            "output_format": {"type": "regex", "schema": {}}
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_session_list_counts() {
        let list = SessionList::new(vec![SessionId::new("a"), SessionId::new("b")]);
        assert_eq!(list.count, 2);
    }
}
