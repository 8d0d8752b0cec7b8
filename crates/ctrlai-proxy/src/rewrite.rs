//! Non-streaming response rewriting, block notices, and synthetic
//! responses for killed agents.
//!
//! A rewrite strips blocked invocations, appends a human-readable notice,
//! and downgrades the terminal-state field to its "no tool call"
//! equivalent only when every invocation was blocked — a partial rewrite
//! keeps the tool-call terminal state so the SDK still executes the
//! allowed calls. Thinking blocks and their signatures pass through
//! untouched; altering a signature invalidates provider verification.

use ctrlai_core::{Decision, ToolCall, WireFormat};
use serde_json::{json, Value};
use std::collections::HashSet;
use tracing::error;

/// The sentinel text returned to killed agents. Integration tests match it
/// literally.
pub const KILLED_MESSAGE: &str = "This agent has been terminated by the administrator.";

/// Rewrite a non-streaming response body, removing the blocked tool calls.
/// `decisions` runs parallel to `blocked`.
///
/// With an empty blocked set the body passes through unchanged, as it does
/// when the body turns out not to parse (the SDK will fail on it too).
pub fn rewrite_body(
    body: &[u8],
    format: WireFormat,
    blocked: &[ToolCall],
    decisions: &[Decision],
) -> Vec<u8> {
    if blocked.is_empty() {
        return body.to_vec();
    }
    match format {
        WireFormat::AnthropicMessages => rewrite_anthropic(body, blocked, decisions),
        WireFormat::OpenAiChat => rewrite_openai(body, blocked, decisions),
        WireFormat::OpenAiResponses => rewrite_openai_responses(body, blocked, decisions),
        WireFormat::Unknown => body.to_vec(),
    }
}

/// Anthropic Messages:
///
/// ```text
/// before: content: [thinking, text, tool_use(blocked)]   stop_reason: "tool_use"
/// after:  content: [thinking, text, text("[CtrlAI] Blocked: …")]  stop_reason: "end_turn"
/// ```
fn rewrite_anthropic(body: &[u8], blocked: &[ToolCall], decisions: &[Decision]) -> Vec<u8> {
    let Ok(mut resp) = serde_json::from_slice::<Value>(body) else {
        error!("failed to parse Anthropic response for rewrite");
        return body.to_vec();
    };
    let Some(content) = resp["content"].as_array().cloned() else {
        return body.to_vec();
    };

    let blocked_ids: HashSet<&str> = blocked.iter().map(|tc| tc.id.as_str()).collect();

    let mut filtered = Vec::with_capacity(content.len());
    let mut has_allowed_tool_use = false;
    for block in content {
        if block["type"].as_str() == Some("tool_use") {
            let id = block["id"].as_str().unwrap_or_default();
            if blocked_ids.contains(id) {
                continue;
            }
            has_allowed_tool_use = true;
        }
        filtered.push(block);
    }

    for (tc, decision) in blocked.iter().zip(decisions) {
        let notice = format_block_notice(&tc.name, &decision.rule, &decision.message);
        filtered.push(json!({"type": "text", "text": notice}));
    }

    resp["content"] = Value::Array(filtered);
    if !has_allowed_tool_use {
        resp["stop_reason"] = json!("end_turn");
    }

    serialize_or_original(&resp, body)
}

/// OpenAI Chat Completions:
///
/// ```text
/// before: tool_calls: [blocked]            finish_reason: "tool_calls"
/// after:  tool_calls: []  content: "…\n\n[CtrlAI] Blocked: …"  finish_reason: "stop"
/// ```
fn rewrite_openai(body: &[u8], blocked: &[ToolCall], decisions: &[Decision]) -> Vec<u8> {
    let Ok(mut resp) = serde_json::from_slice::<Value>(body) else {
        error!("failed to parse OpenAI response for rewrite");
        return body.to_vec();
    };
    if !resp.is_object() {
        return body.to_vec();
    }
    let Some(choice) = resp["choices"].as_array_mut().and_then(|c| c.first_mut()) else {
        return body.to_vec();
    };
    if !choice.is_object() || !choice["message"].is_object() {
        return body.to_vec();
    }

    let blocked_ids: HashSet<&str> = blocked.iter().map(|tc| tc.id.as_str()).collect();

    let mut has_allowed_tool_calls = false;
    let tool_calls = choice["message"]["tool_calls"].as_array().cloned();
    if let Some(tool_calls) = tool_calls {
        let kept: Vec<Value> = tool_calls
            .into_iter()
            .filter(|tc| {
                let id = tc["id"].as_str().unwrap_or_default();
                !blocked_ids.contains(id)
            })
            .collect();
        has_allowed_tool_calls = !kept.is_empty();
        choice["message"]["tool_calls"] = Value::Array(kept);
    }

    let mut content = choice["message"]["content"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    for (tc, decision) in blocked.iter().zip(decisions) {
        let notice = format_block_notice(&tc.name, &decision.rule, &decision.message);
        if content.is_empty() {
            content = notice;
        } else {
            content.push_str("\n\n");
            content.push_str(&notice);
        }
    }
    choice["message"]["content"] = json!(content);

    if !has_allowed_tool_calls {
        choice["finish_reason"] = json!("stop");
    }

    serialize_or_original(&resp, body)
}

/// OpenAI Responses: blocked `function_call` output items are removed, a
/// message output with the notice is appended, and `status` stays
/// `completed` so the SDK does not retry.
fn rewrite_openai_responses(body: &[u8], blocked: &[ToolCall], decisions: &[Decision]) -> Vec<u8> {
    let Ok(mut resp) = serde_json::from_slice::<Value>(body) else {
        error!("failed to parse Responses body for rewrite");
        return body.to_vec();
    };
    let Some(output) = resp["output"].as_array().cloned() else {
        return body.to_vec();
    };

    let blocked_ids: HashSet<&str> = blocked.iter().map(|tc| tc.id.as_str()).collect();

    let mut filtered = Vec::with_capacity(output.len());
    for item in output {
        if item["type"].as_str() == Some("function_call") {
            let mut call_id = item["call_id"].as_str().unwrap_or_default();
            if call_id.is_empty() {
                call_id = item["id"].as_str().unwrap_or_default();
            }
            if blocked_ids.contains(call_id) {
                continue;
            }
        }
        filtered.push(item);
    }

    let messages: Vec<String> = blocked
        .iter()
        .zip(decisions)
        .map(|(tc, d)| format_block_notice(&tc.name, &d.rule, &d.message))
        .collect();
    filtered.push(json!({
        "type": "message",
        "content": [{"type": "output_text", "text": messages.join("\n")}],
    }));

    resp["output"] = Value::Array(filtered);
    resp["status"] = json!("completed");

    serialize_or_original(&resp, body)
}

fn serialize_or_original(resp: &Value, original: &[u8]) -> Vec<u8> {
    match serde_json::to_vec(resp) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(error = %e, "failed to serialize rewritten response");
            original.to_vec()
        }
    }
}

// ---------------------------------------------------------------------------
// Block notices
// ---------------------------------------------------------------------------

/// The user-visible notice for one blocked call:
/// `[CtrlAI] Blocked: <message> (rule: <rule_name>)`.
pub fn format_block_notice(tool_name: &str, rule_name: &str, message: &str) -> String {
    let message = if message.is_empty() {
        format!("Tool call '{tool_name}' was blocked")
    } else {
        message.to_string()
    };
    if rule_name.is_empty() {
        format!("[CtrlAI] Blocked: {message}")
    } else {
        format!("[CtrlAI] Blocked: {message} (rule: {rule_name})")
    }
}

/// Combine per-call notices into one text for stream injection.
pub fn build_block_notice_text(messages: &[String]) -> String {
    if messages.len() == 1 {
        return messages[0].clone();
    }
    let mut text = String::from("[CtrlAI] Multiple tool calls blocked:\n");
    for message in messages {
        text.push_str("  - ");
        text.push_str(message);
        text.push('\n');
    }
    text
}

// ---------------------------------------------------------------------------
// Killed-agent responses
// ---------------------------------------------------------------------------

/// A wire-format-correct "end turn" message for a killed agent, so the SDK
/// stops its loop gracefully instead of retrying.
pub fn build_killed_response(format: WireFormat) -> Vec<u8> {
    let body = match format {
        WireFormat::AnthropicMessages => json!({
            "id": "msg_ctrlai_killed",
            "type": "message",
            "role": "assistant",
            "content": [{"type": "text", "text": KILLED_MESSAGE}],
            "model": "ctrlai-kill-switch",
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 0, "output_tokens": 0},
        }),
        WireFormat::OpenAiChat => json!({
            "id": "chatcmpl-ctrlai-killed",
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": KILLED_MESSAGE},
                "finish_reason": "stop",
            }],
            "usage": {"prompt_tokens": 0, "completion_tokens": 0},
        }),
        WireFormat::OpenAiResponses => json!({
            "id": "resp_ctrlai_killed",
            "output": [{
                "type": "message",
                "content": [{"type": "output_text", "text": KILLED_MESSAGE}],
            }],
            "status": "completed",
        }),
        WireFormat::Unknown => json!({"error": KILLED_MESSAGE}),
    };
    body.to_string().into_bytes()
}
