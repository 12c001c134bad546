//! Session identity, configuration and state types

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

/// Tools served by the gateway's `tools` MCP server; advertised only when
/// `include_custom_tools` is set and an MCP config provides that server
pub const BUILTIN_TOOLS: [&str; 2] = ["mcp__tools__get_server_time", "mcp__tools__calculate"];

/// Tool that lets the agent load skills
pub const SKILL_TOOL: &str = "Skill";

/// Setting sources used when skills are requested without explicit sources
pub const DEFAULT_SETTING_SOURCES: [&str; 2] = ["user", "project"];

/// Unique identifier for a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// How the agent treats side-effecting tool calls
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum PermissionMode {
    /// Ask before every side-effecting tool call
    #[default]
    #[serde(rename = "default")]
    Default,
    /// Auto-accept file edits
    #[serde(rename = "acceptEdits", alias = "accept-edits")]
    AcceptEdits,
    /// Plan only, no side effects
    #[serde(rename = "plan", alias = "plan-only")]
    Plan,
    /// Skip all permission checks
    #[serde(rename = "bypassPermissions", alias = "bypass")]
    BypassPermissions,
}

impl PermissionMode {
    /// Value understood by the agent CLI
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::Plan => "plan",
            Self::BypassPermissions => "bypassPermissions",
        }
    }
}

impl fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured output request envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputFormat {
    JsonSchema { schema: serde_json::Value },
}

impl OutputFormat {
    pub fn json_schema(schema: serde_json::Value) -> Self {
        Self::JsonSchema { schema }
    }

    pub fn schema(&self) -> &serde_json::Value {
        match self {
            Self::JsonSchema { schema } => schema,
        }
    }

    /// Parse a raw envelope, naming the first structural problem found
    pub fn from_value(value: &serde_json::Value) -> Result<Self, ConfigError> {
        let invalid = |message: &str| ConfigError::InvalidOutputFormat(message.to_string());

        let object = value
            .as_object()
            .ok_or_else(|| invalid("output_format must be an object"))?;
        let kind = object
            .get("type")
            .ok_or_else(|| invalid("output_format must contain 'type' field"))?;
        if kind.as_str() != Some("json_schema") {
            return Err(invalid("output_format type must be 'json_schema'"));
        }
        let schema = object
            .get("schema")
            .ok_or_else(|| invalid("output_format must contain 'schema' field"))?;
        if !schema.is_object() {
            return Err(invalid("output_format schema must be an object"));
        }

        Ok(Self::JsonSchema {
            schema: schema.clone(),
        })
    }
}

/// Session configuration, frozen at creation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", default)]
pub struct SessionConfig {
    pub system_prompt: Option<String>,
    /// Explicitly allowed tools; empty means "no tools"
    pub allowed_tools: BTreeSet<String>,
    pub permission_mode: PermissionMode,
    pub cwd: Option<PathBuf>,
    pub output_format: Option<OutputFormat>,
    pub include_custom_tools: bool,
    pub max_turns: Option<u32>,
    pub skills: Vec<String>,
    pub setting_sources: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            allowed_tools: BTreeSet::new(),
            permission_mode: PermissionMode::Default,
            cwd: None,
            output_format: None,
            include_custom_tools: true,
            max_turns: None,
            skills: Vec::new(),
            setting_sources: Vec::new(),
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_allowed_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_permission_mode(mut self, mode: PermissionMode) -> Self {
        self.permission_mode = mode;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_output_schema(mut self, schema: serde_json::Value) -> Self {
        self.output_format = Some(OutputFormat::json_schema(schema));
        self
    }

    pub fn with_custom_tools(mut self, enabled: bool) -> Self {
        self.include_custom_tools = enabled;
        self
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = Some(max_turns);
        self
    }

    pub fn output_schema(&self) -> Option<&serde_json::Value> {
        self.output_format.as_ref().map(OutputFormat::schema)
    }

    /// Whether skill loading was requested
    pub fn skills_enabled(&self) -> bool {
        !self.skills.is_empty() || !self.setting_sources.is_empty()
    }

    /// Allow-list handed to the agent: explicit tools plus the skill tool.
    /// Built-in tools are added by the backend that can serve them.
    pub fn effective_allowed_tools(&self) -> BTreeSet<String> {
        let mut tools = self.allowed_tools.clone();
        if self.skills_enabled() {
            tools.insert(SKILL_TOOL.to_string());
        }
        tools
    }

    /// Setting sources handed to the agent, if any
    pub fn effective_setting_sources(&self) -> Option<Vec<String>> {
        if !self.setting_sources.is_empty() {
            Some(self.setting_sources.clone())
        } else if self.skills_enabled() {
            Some(DEFAULT_SETTING_SOURCES.iter().map(|s| s.to_string()).collect())
        } else {
            None
        }
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, no turn has run yet
    Uninitialized,
    /// Waiting for the next turn
    Idle,
    /// A turn is in flight
    Running,
    /// Deleted; accepts no further turns
    Closed,
}

impl SessionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Session summary for listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub state: SessionState,
    pub turn_count: u64,
    pub has_handle: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_session_id() {
        let id = SessionId::new("abc");
        assert_eq!(id.as_str(), "abc");
        assert_eq!(id.to_string(), "abc");

        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_permission_mode_accepts_both_spellings() {
        let canonical: PermissionMode = serde_json::from_str("\"acceptEdits\"").unwrap();
        let kebab: PermissionMode = serde_json::from_str("\"accept-edits\"").unwrap();
        assert_eq!(canonical, PermissionMode::AcceptEdits);
        assert_eq!(kebab, PermissionMode::AcceptEdits);

        let plan: PermissionMode = serde_json::from_str("\"plan-only\"").unwrap();
        assert_eq!(plan.as_str(), "plan");
        let bypass: PermissionMode = serde_json::from_str("\"bypass\"").unwrap();
        assert_eq!(bypass, PermissionMode::BypassPermissions);
    }

    #[test]
    fn test_output_format_envelope() {
        let format: OutputFormat = serde_json::from_value(serde_json::json!({
            "type": "json_schema",
            "schema": {"type": "object"}
        }))
        .unwrap();
        assert_eq!(format.schema(), &serde_json::json!({"type": "object"}));

        let wrong = serde_json::from_value::<OutputFormat>(serde_json::json!({
            "type": "xml",
            "schema": {}
        }));
        assert!(wrong.is_err());
    }

    #[test]
    fn test_output_format_from_value_reports_problem() {
        let missing_schema = OutputFormat::from_value(&serde_json::json!({"type": "json_schema"}));
        match missing_schema {
            Err(ConfigError::InvalidOutputFormat(msg)) => assert!(msg.contains("'schema'")),
            other => panic!("Expected InvalidOutputFormat, got {:?}", other),
        }

        let not_object = OutputFormat::from_value(&serde_json::json!({
            "type": "json_schema",
            "schema": [1, 2]
        }));
        assert!(not_object.is_err());

        let ok = OutputFormat::from_value(&serde_json::json!({
            "type": "json_schema",
            "schema": {"type": "object"}
        }))
        .unwrap();
        assert_eq!(ok.schema(), &serde_json::json!({"type": "object"}));
    }

    #[test]
    fn test_effective_tools_include_skill() {
        let config = SessionConfig::new().with_allowed_tools(["Read", "Grep"]);
        let tools = config.effective_allowed_tools();
        assert!(tools.contains("Read"));
        assert!(!tools.contains("mcp__tools__calculate"));
        assert!(!tools.contains(SKILL_TOOL));
        assert_eq!(config.effective_setting_sources(), None);

        let mut with_skills = config.with_custom_tools(false);
        with_skills.skills = vec!["pdf-processor".into()];
        let tools = with_skills.effective_allowed_tools();
        assert!(tools.contains(SKILL_TOOL));
        assert!(!tools.contains("mcp__tools__calculate"));
        assert_eq!(
            with_skills.effective_setting_sources(),
            Some(vec!["user".to_string(), "project".to_string()])
        );
    }

    #[test]
    fn test_empty_allow_list_means_no_tools() {
        let config = SessionConfig::new();
        assert!(config.effective_allowed_tools().is_empty());
    }
}
