//! Structured output validation and corrective re-prompting
//!
//! When a session carries an output schema, every successful terminal event
//! is checked against it. A mismatch produces a corrective message that the
//! session sends as the next internal turn, up to a bounded number of
//! attempts; past the bound the turn ends with
//! `error_max_structured_output_retries`.

use crate::error::ConfigError;
use crate::types::TerminalEvent;
use serde_json::Value;
use std::fmt;
use tracing::debug;

/// Total attempts (first answer included) before giving up
pub const DEFAULT_MAX_STRUCTURED_OUTPUT_RETRIES: u32 = 3;

/// A payload that passed schema validation
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedPayload(pub Value);

impl ValidatedPayload {
    pub fn into_inner(self) -> Value {
        self.0
    }
}

/// Why a payload was rejected; one entry per problem found
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("structured output does not match the schema: {}", .issues.join("; "))]
pub struct ValidationError {
    pub issues: Vec<String>,
}

impl ValidationError {
    pub fn new(issues: Vec<String>) -> Self {
        Self { issues }
    }

    fn single(issue: impl Into<String>) -> Self {
        Self {
            issues: vec![issue.into()],
        }
    }
}

/// Progress of the validation loop for one turn
#[derive(Debug, Clone, Default)]
pub struct StructuredOutputAttempt {
    /// Failed attempts so far
    pub attempt: u32,
    pub last_error: Option<ValidationError>,
}

impl StructuredOutputAttempt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure(&mut self, error: ValidationError) {
        self.attempt += 1;
        self.last_error = Some(error);
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Send `message` as the next internal turn
    Retry { attempt: u32, message: String },
    /// Bound reached; end the turn with `error_max_structured_output_retries`
    GiveUp { attempts: u32, message: String },
}

/// Compiled schema plus retry bound for one session
pub struct StructuredOutputValidator {
    schema: Value,
    validator: jsonschema::Validator,
    max_attempts: u32,
}

impl fmt::Debug for StructuredOutputValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StructuredOutputValidator")
            .field("schema", &self.schema)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl StructuredOutputValidator {
    /// Compile `schema`; fails with `ConfigError::InvalidSchema` if it is not
    /// itself a valid JSON Schema document
    pub fn new(schema: Value, max_attempts: u32) -> Result<Self, ConfigError> {
        let validator = jsonschema::validator_for(&schema)
            .map_err(|e| ConfigError::InvalidSchema(e.to_string()))?;
        Ok(Self {
            schema,
            validator,
            max_attempts: max_attempts.max(1),
        })
    }

    pub fn schema(&self) -> &Value {
        &self.schema
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Structural validation; values are never coerced
    pub fn validate(&self, payload: &Value) -> Result<ValidatedPayload, ValidationError> {
        let issues: Vec<String> = self
            .validator
            .iter_errors(payload)
            .map(|e| e.to_string())
            .collect();
        if issues.is_empty() {
            Ok(ValidatedPayload(payload.clone()))
        } else {
            debug!("Structured output rejected: {:?}", issues);
            Err(ValidationError::new(issues))
        }
    }

    /// Extract and validate the payload carried by a terminal event
    pub fn check_terminal(&self, terminal: &TerminalEvent) -> Result<ValidatedPayload, ValidationError> {
        let payload = extract_payload(terminal)?;
        self.validate(&payload)
    }

    /// Decide whether failed attempt number `attempt` (1-based) earns another try
    pub fn retry_policy(&self, attempt: u32, error: &ValidationError) -> RetryDecision {
        if attempt < self.max_attempts {
            RetryDecision::Retry {
                attempt,
                message: self.corrective_message(error),
            }
        } else {
            RetryDecision::GiveUp {
                attempts: attempt,
                message: format!(
                    "Structured output failed validation after {} attempts: {}",
                    attempt,
                    error.issues.join("; ")
                ),
            }
        }
    }

    fn corrective_message(&self, error: &ValidationError) -> String {
        let mut message =
            String::from("Your previous response did not match the required JSON schema.\nProblems:\n");
        for issue in &error.issues {
            message.push_str("- ");
            message.push_str(issue);
            message.push('\n');
        }
        message.push_str(
            "Respond again with only a JSON object, without prose or code fences, that satisfies this schema:\n",
        );
        message.push_str(&pretty(&self.schema));
        message
    }
}

/// Instruction appended to the agent's system prompt when a schema is set
pub fn schema_instructions(schema: &Value) -> String {
    format!(
        "When you give your final answer, respond with only a JSON object, without prose or code fences, that conforms to this JSON Schema:\n{}",
        pretty(schema)
    )
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// The JSON payload of a terminal event: the agent's own structured output
/// if present, otherwise JSON parsed from the result text
pub fn extract_payload(terminal: &TerminalEvent) -> Result<Value, ValidationError> {
    if let Some(value) = &terminal.structured_output {
        return Ok(value.clone());
    }

    let text = strip_code_fence(terminal.result.trim());
    if text.is_empty() {
        return Err(ValidationError::single("response is empty; expected a JSON object"));
    }
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Ok(value);
    }

    // Prose around a single object
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<Value>(&text[start..=end]) {
                return Ok(value);
            }
        }
    }

    Err(ValidationError::single("response is not valid JSON"))
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn company_schema() -> Value {
        json!({
            "type": "object",
            "properties": {"company_name": {"type": "string"}},
            "required": ["company_name"]
        })
    }

    #[test]
    fn test_invalid_schema_is_config_error() {
        let result = StructuredOutputValidator::new(
            json!({"type": "object", "properties": {"a": {"type": "not-a-type"}}}),
            3,
        );
        assert!(matches!(result, Err(ConfigError::InvalidSchema(_))));
    }

    #[test]
    fn test_missing_required_field() {
        let validator = StructuredOutputValidator::new(company_schema(), 3).unwrap();
        let err = validator.validate(&json!({})).unwrap_err();
        assert_eq!(err.issues.len(), 1);
        assert!(err.issues[0].contains("company_name"));

        let ok = validator.validate(&json!({"company_name": "Acme"})).unwrap();
        assert_eq!(ok.into_inner(), json!({"company_name": "Acme"}));
    }

    #[test]
    fn test_no_coercion() {
        let validator = StructuredOutputValidator::new(
            json!({"type": "object", "properties": {"n": {"type": "integer"}}}),
            3,
        )
        .unwrap();
        assert!(validator.validate(&json!({"n": "5"})).is_err());
    }

    #[test]
    fn test_local_refs_resolve() {
        let validator = StructuredOutputValidator::new(
            json!({
                "$defs": {"color": {"enum": ["red", "green"]}},
                "type": "object",
                "properties": {"c": {"$ref": "#/$defs/color"}}
            }),
            3,
        )
        .unwrap();
        assert!(validator.validate(&json!({"c": "red"})).is_ok());
        assert!(validator.validate(&json!({"c": "blue"})).is_err());
    }

    #[test]
    fn test_retry_policy_bounds_attempts() {
        let validator = StructuredOutputValidator::new(company_schema(), 3).unwrap();
        let err = ValidationError::new(vec!["\"company_name\" is a required property".into()]);

        match validator.retry_policy(1, &err) {
            RetryDecision::Retry { attempt, message } => {
                assert_eq!(attempt, 1);
                assert!(message.contains("company_name"));
                assert!(message.contains("\"required\""));
            }
            other => panic!("Expected Retry, got {:?}", other),
        }
        assert!(matches!(validator.retry_policy(2, &err), RetryDecision::Retry { .. }));
        assert!(matches!(
            validator.retry_policy(3, &err),
            RetryDecision::GiveUp { attempts: 3, .. }
        ));
    }

    #[test]
    fn test_attempt_tracking() {
        let mut attempt = StructuredOutputAttempt::new();
        assert_eq!(attempt.attempt, 0);
        attempt.record_failure(ValidationError::new(vec!["bad".into()]));
        assert_eq!(attempt.attempt, 1);
        assert_eq!(attempt.last_error.unwrap().issues, vec!["bad".to_string()]);
    }

    #[test]
    fn test_extract_payload_sources() {
        let from_field = TerminalEvent::success("ignored").with_structured_output(json!({"a": 1}));
        assert_eq!(extract_payload(&from_field).unwrap(), json!({"a": 1}));

        let fenced = TerminalEvent::success("```json\n{\"a\": 2}\n```");
        assert_eq!(extract_payload(&fenced).unwrap(), json!({"a": 2}));

        let prose = TerminalEvent::success("Here you go: {\"a\": 3} hope that helps");
        assert_eq!(extract_payload(&prose).unwrap(), json!({"a": 3}));

        assert!(extract_payload(&TerminalEvent::success("no json here")).is_err());
        assert!(extract_payload(&TerminalEvent::success("   ")).is_err());
    }
}
