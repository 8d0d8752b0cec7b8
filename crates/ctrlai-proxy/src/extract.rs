//! Tool-call extraction from non-streaming response bodies, and request
//! metadata extraction.
//!
//! Three response shapes are normalized into [`ToolCall`]s:
//!   - Anthropic Messages: `content[].type == "tool_use"` blocks
//!   - OpenAI Chat Completions: `choices[0].message.tool_calls[]`
//!   - OpenAI Responses: `output[].type == "function_call"` items
//!
//! Tool names are stored as-is (OAuth credentials yield PascalCase names,
//! API keys lowercase); case-insensitive matching happens in the engine.

use ctrlai_core::{RequestMeta, ToolCall, WireFormat};
use serde_json::{Map, Value};

/// Parse tool calls from a non-streaming response body.
///
/// Returns an empty vec when the body is malformed or the format is
/// unknown — a response we cannot parse is assumed to contain no
/// enforceable tool calls (the SDK will fail to parse it too).
pub fn extract_tool_calls(body: &[u8], format: WireFormat) -> Vec<ToolCall> {
    let Ok(parsed) = serde_json::from_slice::<Value>(body) else {
        return Vec::new();
    };
    match format {
        WireFormat::AnthropicMessages => extract_anthropic(&parsed),
        WireFormat::OpenAiChat => extract_openai(&parsed),
        WireFormat::OpenAiResponses => extract_openai_responses(&parsed),
        WireFormat::Unknown => Vec::new(),
    }
}

/// Anthropic Messages: one tool call per `tool_use` content block.
/// `thinking` and `text` blocks are never evaluated against rules.
fn extract_anthropic(v: &Value) -> Vec<ToolCall> {
    let Some(content) = v["content"].as_array() else {
        return Vec::new();
    };

    let mut calls = Vec::new();
    for (index, block) in content.iter().enumerate() {
        if block["type"].as_str() != Some("tool_use") {
            continue;
        }
        let input = &block["input"];
        let (raw_arguments, arguments) = match input {
            Value::Null => (String::new(), None),
            Value::Object(map) => (input.to_string(), Some(map.clone())),
            other => (other.to_string(), None),
        };
        calls.push(ToolCall {
            id: block["id"].as_str().unwrap_or_default().to_string(),
            name: block["name"].as_str().unwrap_or_default().to_string(),
            index,
            arguments,
            raw_arguments,
        });
    }
    calls
}

/// OpenAI Chat Completions: tool calls under `choices[0].message.tool_calls`.
fn extract_openai(v: &Value) -> Vec<ToolCall> {
    let Some(tool_calls) = v["choices"]
        .as_array()
        .and_then(|choices| choices.first())
        .and_then(|choice| choice["message"]["tool_calls"].as_array())
    else {
        return Vec::new();
    };

    tool_calls
        .iter()
        .enumerate()
        .map(|(index, tc)| {
            let (raw_arguments, arguments) = parse_tool_arguments(&tc["function"]["arguments"]);
            ToolCall {
                id: tc["id"].as_str().unwrap_or_default().to_string(),
                name: tc["function"]["name"].as_str().unwrap_or_default().to_string(),
                index,
                arguments,
                raw_arguments,
            }
        })
        .collect()
}

/// OpenAI Responses: function calls are top-level output items, alongside
/// message outputs. `call_id` is the tool call ID; early API versions only
/// set `id`.
fn extract_openai_responses(v: &Value) -> Vec<ToolCall> {
    let Some(output) = v["output"].as_array() else {
        return Vec::new();
    };

    let mut calls = Vec::new();
    for (index, item) in output.iter().enumerate() {
        if item["type"].as_str() != Some("function_call") {
            continue;
        }
        let mut id = item["call_id"].as_str().unwrap_or_default();
        if id.is_empty() {
            id = item["id"].as_str().unwrap_or_default();
        }
        let (raw_arguments, arguments) = parse_tool_arguments(&item["arguments"]);
        calls.push(ToolCall {
            id: id.to_string(),
            name: item["name"].as_str().unwrap_or_default().to_string(),
            index,
            arguments,
            raw_arguments,
        });
    }
    calls
}

// ---------------------------------------------------------------------------
// Argument parsing
// ---------------------------------------------------------------------------

/// Parse a tool-call `arguments` field, which providers deliver in several
/// shapes:
///
///   1. a JSON string containing JSON (OpenAI, Moonshot, Qwen, MiniMax)
///   2. a direct JSON object (Zhipu/GLM)
///   3. the empty string for parameterless tools (MiniMax) — treated as `{}`
///   4. a Python-literal dict string (Zhipu/GLM) — conservatively converted
///
/// Returns the raw JSON text for substring matching and the parsed map for
/// field-level matching. On unrecoverable input the raw text is retained
/// and the map is `None` so substring rules still fire.
pub fn parse_tool_arguments(value: &Value) -> (String, Option<Map<String, Value>>) {
    match value {
        Value::Null => (String::new(), None),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return ("{}".to_string(), Some(Map::new()));
            }
            if let Ok(map) = serde_json::from_str::<Map<String, Value>>(trimmed) {
                return (s.clone(), Some(map));
            }
            if let Some(fixed) = fix_python_dict(trimmed) {
                let map = serde_json::from_str(&fixed).ok();
                return (fixed, map);
            }
            (s.clone(), None)
        }
        Value::Object(map) => (value.to_string(), Some(map.clone())),
        other => (other.to_string(), None),
    }
}

/// Attempt to convert a Python-style dict string to valid JSON.
///
/// Handles single quotes → double quotes (escaping embedded double quotes)
/// and `True`/`False`/`None` → `true`/`false`/`null`. Not a Python parser —
/// just the cases observed from Zhipu/GLM. Returns `None` unless the result
/// re-validates as JSON.
fn fix_python_dict(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    if bytes.first() != Some(&b'{') {
        return None;
    }

    let mut fixed: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut in_string = false;
    let mut string_char = 0u8;

    for i in 0..bytes.len() {
        let c = bytes[i];
        if in_string {
            if c == string_char && (i == 0 || bytes[i - 1] != b'\\') {
                in_string = false;
                fixed.push(b'"');
            } else if c == b'"' && string_char == b'\'' {
                // Escape double quotes inside single-quoted strings.
                fixed.extend_from_slice(b"\\\"");
            } else {
                fixed.push(c);
            }
        } else if c == b'\'' {
            in_string = true;
            string_char = b'\'';
            fixed.push(b'"');
        } else if c == b'"' {
            in_string = true;
            string_char = b'"';
            fixed.push(b'"');
        } else {
            fixed.push(c);
        }
    }

    let requoted = String::from_utf8(fixed).ok()?;
    let result = replace_python_keywords(&requoted);

    if serde_json::from_str::<Value>(&result).is_ok() {
        Some(result)
    } else {
        None
    }
}

/// Replace Python `True`/`False`/`None` with JSON equivalents. Naive
/// replacement limited to value positions — the JSON validation pass after
/// catches false positives.
fn replace_python_keywords(s: &str) -> String {
    let mut result = s.to_string();
    for (from, to) in [
        (": True", ": true"),
        (": False", ": false"),
        (": None", ": null"),
        (",True", ",true"),
        (",False", ",false"),
        (",None", ",null"),
        ("[True", "[true"),
        ("[False", "[false"),
        ("[None", "[null"),
    ] {
        result = result.replace(from, to);
    }
    result
}

// ---------------------------------------------------------------------------
// Request metadata
// ---------------------------------------------------------------------------

/// Pull the model, stream flag, and declared tool names out of a request
/// body. The body itself is forwarded upstream unchanged. Both request
/// schemas use top-level `model`/`stream`; tool declarations differ:
/// `tools[].name` (Anthropic) vs `tools[].function.name` (OpenAI).
pub fn extract_request_meta(body: &[u8]) -> RequestMeta {
    let Ok(v) = serde_json::from_slice::<Value>(body) else {
        return RequestMeta::default();
    };

    let mut meta = RequestMeta {
        model: v["model"].as_str().unwrap_or_default().to_string(),
        stream: v["stream"].as_bool().unwrap_or(false),
        tools: Vec::new(),
    };

    if let Some(tools) = v["tools"].as_array() {
        for tool in tools {
            if let Some(name) = tool["name"].as_str() {
                if !name.is_empty() {
                    meta.tools.push(name.to_string());
                    continue;
                }
            }
            if let Some(name) = tool["function"]["name"].as_str() {
                if !name.is_empty() {
                    meta.tools.push(name.to_string());
                }
            }
        }
    }

    meta
}
