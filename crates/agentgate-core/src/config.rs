//! Gateway configuration
//!
//! Resolved once at startup from defaults, an optional JSON file and
//! `AGENTGATE_*` environment variables. Sessions receive an immutable
//! [`SessionSettings`] snapshot at creation and never consult this again.

use crate::error::{ConfigError, Error, Result};
use crate::structured::DEFAULT_MAX_STRUCTURED_OUTPUT_RETRIES;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const ENV_PREFIX: &str = "AGENTGATE_";

/// Process-wide gateway settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Agent CLI executable
    pub agent_command: String,
    /// Extra arguments appended to every agent launch
    pub agent_args: Vec<String>,
    /// Extra environment for the agent process
    pub agent_env: HashMap<String, String>,
    pub max_turn_duration_ms: u64,
    pub interrupt_grace_ms: u64,
    pub close_grace_ms: u64,
    pub max_structured_output_retries: u32,
    /// Capacity of the bounded per-turn event pipeline
    pub event_buffer: usize,
    pub workspace_root: PathBuf,
    pub workspace_max_age_secs: u64,
    /// MCP server configuration handed to the agent; it must define the
    /// `tools` server behind the gateway's built-in tools
    pub mcp_config: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            agent_command: "claude".to_string(),
            agent_args: Vec::new(),
            agent_env: HashMap::new(),
            max_turn_duration_ms: 600_000,
            interrupt_grace_ms: 5_000,
            close_grace_ms: 5_000,
            max_structured_output_retries: DEFAULT_MAX_STRUCTURED_OUTPUT_RETRIES,
            event_buffer: 16,
            workspace_root: default_workspace_root(),
            workspace_max_age_secs: 24 * 3600,
            mcp_config: None,
        }
    }
}

fn default_workspace_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".claude")
        .join("workspaces")
}

impl GatewayConfig {
    /// Defaults overlaid with `AGENTGATE_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides(std::env::vars())
    }

    /// Read a JSON config file; unspecified fields keep their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading gateway config from {:?}", path);
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from `(key, value)` pairs; keys without the prefix are ignored
    pub fn with_env_overrides<I>(mut self, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "AGENT_COMMAND" => self.agent_command = value,
                "AGENT_ARGS" => {
                    self.agent_args = value.split_whitespace().map(str::to_string).collect()
                }
                "MAX_TURN_DURATION_MS" => self.max_turn_duration_ms = parse_number(&key, &value)?,
                "INTERRUPT_GRACE_MS" => self.interrupt_grace_ms = parse_number(&key, &value)?,
                "CLOSE_GRACE_MS" => self.close_grace_ms = parse_number(&key, &value)?,
                "MAX_STRUCTURED_OUTPUT_RETRIES" => {
                    self.max_structured_output_retries = parse_number(&key, &value)?
                }
                "EVENT_BUFFER" => self.event_buffer = parse_number(&key, &value)?,
                "WORKSPACE_ROOT" => self.workspace_root = PathBuf::from(value),
                "MCP_CONFIG" => self.mcp_config = Some(PathBuf::from(value)),
                "WORKSPACE_MAX_AGE_SECS" => {
                    self.workspace_max_age_secs = parse_number(&key, &value)?
                }
                _ => debug!("Ignoring unknown config variable {}", key),
            }
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent_command.trim().is_empty() {
            return Err(invalid("agent_command", "must not be empty"));
        }
        if self.max_structured_output_retries == 0 {
            return Err(invalid("max_structured_output_retries", "must be at least 1"));
        }
        if self.event_buffer == 0 {
            return Err(invalid("event_buffer", "must be at least 1"));
        }
        if self.max_turn_duration_ms == 0 {
            return Err(invalid("max_turn_duration_ms", "must be positive"));
        }
        Ok(())
    }

    pub fn workspace_max_age(&self) -> Duration {
        Duration::from_secs(self.workspace_max_age_secs)
    }

    /// Per-session snapshot of the limits that govern turns
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            max_turn_duration: Duration::from_millis(self.max_turn_duration_ms),
            interrupt_grace: Duration::from_millis(self.interrupt_grace_ms),
            close_grace: Duration::from_millis(self.close_grace_ms),
            max_structured_output_retries: self.max_structured_output_retries,
            event_buffer: self.event_buffer,
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(key, &format!("expected a number, got {:?}", value)))
}

fn invalid(field: &str, message: &str) -> Error {
    Error::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    })
}

/// Turn limits frozen into each session at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub max_turn_duration: Duration,
    pub interrupt_grace: Duration,
    pub close_grace: Duration,
    pub max_structured_output_retries: u32,
    pub event_buffer: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        GatewayConfig::default().session_settings()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.agent_command, "claude");
        assert_eq!(config.max_structured_output_retries, 3);
        assert!(config.workspace_root.ends_with(".claude/workspaces"));
        assert_eq!(config.workspace_max_age(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_env_overrides() {
        let config = GatewayConfig::default()
            .with_env_overrides(vars(&[
                ("AGENTGATE_AGENT_COMMAND", "/opt/agent"),
                ("AGENTGATE_AGENT_ARGS", "--verbose --debug"),
                ("AGENTGATE_INTERRUPT_GRACE_MS", "250"),
                ("PATH", "/usr/bin"),
            ]))
            .unwrap();
        let with_mcp = GatewayConfig::default()
            .with_env_overrides(vars(&[("AGENTGATE_MCP_CONFIG", "/etc/agentgate/mcp.json")]))
            .unwrap();
        assert_eq!(with_mcp.mcp_config, Some(PathBuf::from("/etc/agentgate/mcp.json")));

        assert_eq!(config.agent_command, "/opt/agent");
        assert_eq!(config.agent_args, vec!["--verbose", "--debug"]);
        assert_eq!(
            config.session_settings().interrupt_grace,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let result = GatewayConfig::default()
            .with_env_overrides(vars(&[("AGENTGATE_EVENT_BUFFER", "lots")]));
        match result {
            Err(Error::Config(ConfigError::InvalidValue { field, .. })) => {
                assert_eq!(field, "AGENTGATE_EVENT_BUFFER")
            }
            other => panic!("Expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_zero_retries() {
        let config = GatewayConfig {
            max_structured_output_retries: 0,
            ..GatewayConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_keeps_defaults_for_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.json");
        std::fs::write(&path, r#"{"agent_command": "agent-x", "close_grace_ms": 10}"#).unwrap();

        let config = GatewayConfig::from_file(&path).unwrap();
        assert_eq!(config.agent_command, "agent-x");
        assert_eq!(config.close_grace_ms, 10);
        assert_eq!(config.interrupt_grace_ms, 5_000);
    }
}
