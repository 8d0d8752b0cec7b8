//! Shared data types: wire formats, tool calls, and rule decisions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The on-the-wire schema of the LLM API a request targets.
///
/// Determined from the URL path alone — never from headers or bodies.
/// [`WireFormat::Unknown`] responses bypass tool inspection entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireFormat {
    /// Anthropic Messages API (`/v1/messages`). Tool calls are
    /// `content[].type == "tool_use"` blocks.
    AnthropicMessages,
    /// OpenAI Chat Completions API (`/v1/chat/completions`). Tool calls
    /// are `choices[0].message.tool_calls[]`.
    OpenAiChat,
    /// OpenAI Responses API (`/v1/responses`). Tool calls are
    /// `output[].type == "function_call"` items.
    OpenAiResponses,
    /// Anything else — passed through without inspection.
    Unknown,
}

impl WireFormat {
    /// Whether responses in this format are inspected for tool calls.
    pub fn is_inspected(self) -> bool {
        self != WireFormat::Unknown
    }
}

/// A single tool invocation extracted from an LLM response.
///
/// Both content-block (Anthropic) and tool-calls-array (OpenAI) responses
/// are normalized into this struct for rule evaluation. The tool name is
/// preserved verbatim — one provider returns `Bash` under OAuth credentials
/// and `bash` under API keys — and case folding happens at match time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned tool call ID (`toolu_01...`, `call_abc...`).
    pub id: String,
    /// Tool name exactly as the provider returned it.
    pub name: String,
    /// Position in the provider's output container (content array,
    /// tool-calls array, or output array).
    pub index: usize,
    /// Parsed arguments for field-level rule matching. `None` when the
    /// provider returned malformed arguments that resisted recovery.
    pub arguments: Option<Map<String, Value>>,
    /// Raw argument JSON text, always retained so substring rules still
    /// fire when `arguments` is `None`.
    pub raw_arguments: String,
}

impl ToolCall {
    /// Extract a string-valued argument field, or `""` if absent or
    /// not a string.
    pub fn string_arg(&self, key: &str) -> &str {
        self.arguments
            .as_ref()
            .and_then(|args| args.get(key))
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    /// The raw argument JSON, falling back to a re-serialization of the
    /// parsed map when no raw text was captured.
    pub fn raw_or_serialized(&self) -> String {
        if !self.raw_arguments.is_empty() {
            return self.raw_arguments.clone();
        }
        self.arguments
            .as_ref()
            .and_then(|args| serde_json::to_string(args).ok())
            .unwrap_or_default()
    }
}

/// What a matched rule does with a tool call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    #[default]
    Allow,
    Block,
}

impl std::fmt::Display for RuleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleAction::Allow => write!(f, "allow"),
            RuleAction::Block => write!(f, "block"),
        }
    }
}

/// Outcome of evaluating a tool call against the active ruleset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// The action to take.
    pub action: RuleAction,
    /// Name of the rule that matched. Empty only for the default
    /// no-match-means-allow decision.
    pub rule: String,
    /// Human-readable reason from the rule.
    pub message: String,
}

impl Decision {
    /// The default decision when no rule matches.
    pub fn allow() -> Self {
        Decision::default()
    }

    pub fn is_block(&self) -> bool {
        self.action == RuleAction::Block
    }
}

/// Metadata pulled out of a request body before it is forwarded unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestMeta {
    /// The `model` field from the request body.
    pub model: String,
    /// Tool names the request declares available to the model.
    pub tools: Vec<String>,
    /// Whether the request asks for a streaming (SSE) response.
    pub stream: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format_inspection() {
        assert!(WireFormat::AnthropicMessages.is_inspected());
        assert!(WireFormat::OpenAiChat.is_inspected());
        assert!(WireFormat::OpenAiResponses.is_inspected());
        assert!(!WireFormat::Unknown.is_inspected());
    }

    #[test]
    fn test_tool_call_string_arg() {
        let mut args = Map::new();
        args.insert("command".to_string(), Value::String("ls -la".to_string()));
        args.insert("count".to_string(), Value::from(3));
        let tc = ToolCall {
            arguments: Some(args),
            ..ToolCall::default()
        };
        assert_eq!(tc.string_arg("command"), "ls -la");
        assert_eq!(tc.string_arg("count"), ""); // not a string
        assert_eq!(tc.string_arg("missing"), "");
    }

    #[test]
    fn test_tool_call_string_arg_no_arguments() {
        let tc = ToolCall::default();
        assert_eq!(tc.string_arg("command"), "");
    }

    #[test]
    fn test_raw_or_serialized_prefers_raw() {
        let tc = ToolCall {
            raw_arguments: r#"{"a":1}"#.to_string(),
            ..ToolCall::default()
        };
        assert_eq!(tc.raw_or_serialized(), r#"{"a":1}"#);
    }

    #[test]
    fn test_raw_or_serialized_falls_back_to_map() {
        let mut args = Map::new();
        args.insert("path".to_string(), Value::String("/tmp/x".to_string()));
        let tc = ToolCall {
            arguments: Some(args),
            ..ToolCall::default()
        };
        assert!(tc.raw_or_serialized().contains("/tmp/x"));
    }

    #[test]
    fn test_decision_default_is_allow() {
        let d = Decision::allow();
        assert_eq!(d.action, RuleAction::Allow);
        assert!(d.rule.is_empty());
        assert!(!d.is_block());
    }

    #[test]
    fn test_rule_action_serde_lowercase() {
        assert_eq!(serde_json::to_string(&RuleAction::Block).unwrap(), r#""block""#);
        let parsed: RuleAction = serde_json::from_str(r#""allow""#).unwrap();
        assert_eq!(parsed, RuleAction::Allow);
    }

    #[test]
    fn test_rule_action_display() {
        assert_eq!(RuleAction::Allow.to_string(), "allow");
        assert_eq!(RuleAction::Block.to_string(), "block");
    }
}
