//! Event-stream rewriting: strip blocked tool invocations from a buffered
//! SSE sequence and re-index what remains.
//!
//! When a block is removed, every subsequent per-item index must be
//! renumbered so the remaining items occupy `0..k-1` — the consumer SDK's
//! content-block parser requires dense indices. Events that need no
//! renumbering are replayed byte-identical, which is what keeps signed
//! thinking blocks verifiable.

use crate::rewrite::build_block_notice_text;
use crate::sse::SseEvent;
use ctrlai_core::{ToolCall, WireFormat};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};

/// Rebuild an event sequence with the blocked invocations removed and a
/// block notice injected. `block_messages` carries one formatted notice
/// per blocked call.
pub fn rewrite_stream(
    events: &[SseEvent],
    format: WireFormat,
    blocked: &[ToolCall],
    block_messages: &[String],
) -> Vec<SseEvent> {
    if blocked.is_empty() {
        return events.to_vec();
    }
    match format {
        WireFormat::AnthropicMessages => rewrite_anthropic_stream(events, blocked, block_messages),
        WireFormat::OpenAiChat => rewrite_openai_stream(events, blocked, block_messages),
        WireFormat::OpenAiResponses => rewrite_responses_stream(events, blocked, block_messages),
        WireFormat::Unknown => events.to_vec(),
    }
}

// ---------------------------------------------------------------------------
// Anthropic
// ---------------------------------------------------------------------------

/// Replay thinking and text blocks as-is, drop blocked tool_use blocks
/// (start/delta/stop), renumber the survivors, inject a notice text block,
/// and downgrade `stop_reason` when nothing was allowed.
fn rewrite_anthropic_stream(
    events: &[SseEvent],
    blocked: &[ToolCall],
    block_messages: &[String],
) -> Vec<SseEvent> {
    let blocked_indexes: HashSet<usize> = blocked.iter().map(|tc| tc.index).collect();

    // First pass: old-index → new-index map over surviving blocks.
    let mut index_map: HashMap<usize, usize> = HashMap::new();
    let mut next_index = 0usize;
    for event in events {
        if event.event != "content_block_start" {
            continue;
        }
        let Some((index, block_type)) = parse_block_start(&event.data) else {
            continue;
        };
        if block_type == "tool_use" && blocked_indexes.contains(&index) {
            continue;
        }
        index_map.insert(index, next_index);
        next_index += 1;
    }
    let notice_index = next_index;

    let downgrade = all_anthropic_tools_blocked(events, &blocked_indexes);

    // Second pass: replay with blocked blocks skipped and survivors
    // renumbered.
    let mut modified = Vec::with_capacity(events.len());
    let mut skip_block: Option<usize> = None;

    for event in events {
        match event.event.as_str() {
            "content_block_start" => {
                let Some((index, block_type)) = parse_block_start(&event.data) else {
                    modified.push(event.clone());
                    continue;
                };
                if block_type == "tool_use" && blocked_indexes.contains(&index) {
                    skip_block = Some(index);
                    continue;
                }
                skip_block = None;
                modified.push(reindex_event(event, index, &index_map));
            }
            "content_block_delta" | "content_block_stop" => {
                let Some(index) = parse_index(&event.data) else {
                    modified.push(event.clone());
                    continue;
                };
                if Some(index) == skip_block {
                    if event.event == "content_block_stop" {
                        skip_block = None;
                    }
                    continue;
                }
                modified.push(reindex_event(event, index, &index_map));
            }
            "message_delta" => {
                if downgrade {
                    modified.push(rewrite_stop_reason(event, "end_turn"));
                } else {
                    modified.push(event.clone());
                }
            }
            "message_stop" => {
                if !block_messages.is_empty() {
                    let notice = build_block_notice_text(block_messages);
                    modified.extend(build_text_block_events(notice_index, &notice));
                }
                modified.push(event.clone());
            }
            _ => modified.push(event.clone()),
        }
    }

    modified
}

/// `(index, content_block.type)` from a content_block_start payload.
fn parse_block_start(data: &str) -> Option<(usize, String)> {
    let v: Value = serde_json::from_str(data).ok()?;
    let index = v["index"].as_u64()? as usize;
    let block_type = v["content_block"]["type"].as_str().unwrap_or_default().to_string();
    Some((index, block_type))
}

fn parse_index(data: &str) -> Option<usize> {
    let v: Value = serde_json::from_str(data).ok()?;
    Some(v["index"].as_u64()? as usize)
}

/// Remap the `index` field of an event. Events whose index is unchanged
/// are returned byte-identical.
fn reindex_event(event: &SseEvent, old_index: usize, index_map: &HashMap<usize, usize>) -> SseEvent {
    let Some(&new_index) = index_map.get(&old_index) else {
        return event.clone();
    };
    if new_index == old_index {
        return event.clone();
    }
    let Ok(mut v) = serde_json::from_str::<Value>(&event.data) else {
        return event.clone();
    };
    if !v.is_object() {
        return event.clone();
    }
    v["index"] = json!(new_index);
    match serde_json::to_string(&v) {
        Ok(data) => SseEvent {
            event: event.event.clone(),
            data,
        },
        Err(_) => event.clone(),
    }
}

/// Rewrite `delta.stop_reason` in a message_delta event.
fn rewrite_stop_reason(event: &SseEvent, new_reason: &str) -> SseEvent {
    let Ok(mut v) = serde_json::from_str::<Value>(&event.data) else {
        return event.clone();
    };
    if !v.is_object() || !v["delta"].is_object() {
        return event.clone();
    }
    v["delta"]["stop_reason"] = json!(new_reason);
    match serde_json::to_string(&v) {
        Ok(data) => SseEvent {
            event: event.event.clone(),
            data,
        },
        Err(_) => event.clone(),
    }
}

/// Events for one injected text content block carrying the notice.
fn build_text_block_events(index: usize, text: &str) -> Vec<SseEvent> {
    let start = json!({
        "type": "content_block_start",
        "index": index,
        "content_block": {"type": "text", "text": ""},
    });
    let delta = json!({
        "type": "content_block_delta",
        "index": index,
        "delta": {"type": "text_delta", "text": text},
    });
    let stop = json!({
        "type": "content_block_stop",
        "index": index,
    });
    vec![
        SseEvent {
            event: "content_block_start".to_string(),
            data: start.to_string(),
        },
        SseEvent {
            event: "content_block_delta".to_string(),
            data: delta.to_string(),
        },
        SseEvent {
            event: "content_block_stop".to_string(),
            data: stop.to_string(),
        },
    ]
}

/// Whether every tool_use block in the stream is in the blocked set.
fn all_anthropic_tools_blocked(events: &[SseEvent], blocked_indexes: &HashSet<usize>) -> bool {
    for event in events {
        if event.event != "content_block_start" {
            continue;
        }
        let Some((index, block_type)) = parse_block_start(&event.data) else {
            continue;
        };
        if block_type == "tool_use" && !blocked_indexes.contains(&index) {
            return false;
        }
    }
    true
}

// ---------------------------------------------------------------------------
// OpenAI Chat
// ---------------------------------------------------------------------------

/// Filter blocked tool-call fragments out of delta chunks, downgrade
/// `finish_reason` when nothing was allowed, and inject the notice as a
/// final content delta before `[DONE]`.
fn rewrite_openai_stream(
    events: &[SseEvent],
    blocked: &[ToolCall],
    block_messages: &[String],
) -> Vec<SseEvent> {
    let blocked_indexes: HashSet<usize> = blocked.iter().map(|tc| tc.index).collect();
    let downgrade = all_openai_tools_blocked(events, &blocked_indexes);

    let mut modified = Vec::with_capacity(events.len());

    for event in events {
        if event.data.is_empty() || event.data == "[DONE]" {
            modified.push(event.clone());
            continue;
        }
        let Ok(mut chunk) = serde_json::from_str::<Value>(&event.data) else {
            modified.push(event.clone());
            continue;
        };
        if !chunk.is_object() {
            modified.push(event.clone());
            continue;
        }
        let Some(choice) = chunk["choices"].as_array_mut().and_then(|c| c.first_mut()) else {
            modified.push(event.clone());
            continue;
        };
        if !choice.is_object() || !choice["delta"].is_object() {
            modified.push(event.clone());
            continue;
        }

        let mut changed = false;

        let tool_calls = choice["delta"]["tool_calls"].as_array().cloned();
        if let Some(tool_calls) = tool_calls {
            let kept: Vec<Value> = tool_calls
                .into_iter()
                .filter(|tc| {
                    let index = tc["index"].as_u64().unwrap_or(0) as usize;
                    !blocked_indexes.contains(&index)
                })
                .collect();
            changed = true;
            if kept.is_empty() {
                if let Some(delta) = choice["delta"].as_object_mut() {
                    delta.remove("tool_calls");
                }
            } else {
                choice["delta"]["tool_calls"] = Value::Array(kept);
            }
        }

        if downgrade && choice["finish_reason"].as_str() == Some("tool_calls") {
            choice["finish_reason"] = json!("stop");
            changed = true;
        }

        if changed {
            match serde_json::to_string(&chunk) {
                Ok(data) => modified.push(SseEvent {
                    event: event.event.clone(),
                    data,
                }),
                Err(_) => modified.push(event.clone()),
            }
        } else {
            modified.push(event.clone());
        }
    }

    // Inject the notice as a content delta ahead of the [DONE] sentinel.
    if !block_messages.is_empty() {
        let notice = build_openai_content_delta(&build_block_notice_text(block_messages));
        match modified.last() {
            Some(last) if last.data == "[DONE]" => {
                let done = modified.pop().unwrap_or_default();
                modified.push(notice);
                modified.push(done);
            }
            _ => modified.push(notice),
        }
    }

    modified
}

/// A delta chunk carrying the notice text.
fn build_openai_content_delta(text: &str) -> SseEvent {
    let chunk = json!({
        "choices": [{
            "index": 0,
            "delta": {"content": format!("\n\n{text}")},
            "finish_reason": null,
        }],
    });
    SseEvent {
        event: String::new(),
        data: chunk.to_string(),
    }
}

/// Whether every tool-call index seen in the stream is in the blocked set.
fn all_openai_tools_blocked(events: &[SseEvent], blocked_indexes: &HashSet<usize>) -> bool {
    let mut seen: HashSet<usize> = HashSet::new();
    for event in events {
        if event.data.is_empty() || event.data == "[DONE]" {
            continue;
        }
        let Ok(chunk) = serde_json::from_str::<Value>(&event.data) else {
            continue;
        };
        let Some(choice) = chunk["choices"].as_array().and_then(|c| c.first()) else {
            continue;
        };
        if let Some(tool_calls) = choice["delta"]["tool_calls"].as_array() {
            for tc in tool_calls {
                seen.insert(tc["index"].as_u64().unwrap_or(0) as usize);
            }
        }
    }
    !seen.is_empty() && seen.iter().all(|index| blocked_indexes.contains(index))
}

// ---------------------------------------------------------------------------
// OpenAI Responses
// ---------------------------------------------------------------------------

/// Drop every event belonging to a blocked function call (matched by
/// call_id) and inject a text output item before `response.completed`.
fn rewrite_responses_stream(
    events: &[SseEvent],
    blocked: &[ToolCall],
    block_messages: &[String],
) -> Vec<SseEvent> {
    let blocked_call_ids: HashSet<&str> = blocked.iter().map(|tc| tc.id.as_str()).collect();

    let mut modified = Vec::with_capacity(events.len());
    for event in events {
        if is_blocked_responses_event(event, &blocked_call_ids) {
            continue;
        }
        if event.event == "response.completed" && !block_messages.is_empty() {
            modified.push(build_responses_notice_event(&build_block_notice_text(
                block_messages,
            )));
        }
        modified.push(event.clone());
    }
    modified
}

fn is_blocked_responses_event(event: &SseEvent, blocked_call_ids: &HashSet<&str>) -> bool {
    let Ok(v) = serde_json::from_str::<Value>(&event.data) else {
        return false;
    };
    match event.event.as_str() {
        "response.output_item.added" | "response.output_item.done" => {
            v["type"].as_str() == Some("function_call")
                && blocked_call_ids.contains(v["call_id"].as_str().unwrap_or_default())
        }
        "response.function_call_arguments.delta" | "response.function_call_arguments.done" => {
            blocked_call_ids.contains(v["call_id"].as_str().unwrap_or_default())
        }
        _ => false,
    }
}

fn build_responses_notice_event(text: &str) -> SseEvent {
    let item = json!({
        "type": "message",
        "content": [{"type": "output_text", "text": text}],
    });
    SseEvent {
        event: "response.output_item.added".to_string(),
        data: item.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::reconstruct;
    use crate::rewrite::format_block_notice;

    fn evt(event: &str, data: &str) -> SseEvent {
        SseEvent {
            event: event.to_string(),
            data: data.to_string(),
        }
    }

    /// Anthropic stream: thinking(0), text(1), tool_use(2), tool_use(3).
    fn anthropic_two_tool_stream() -> Vec<SseEvent> {
        vec![
            evt("message_start", r#"{"type":"message_start","message":{"id":"msg_1"}}"#),
            evt(
                "content_block_start",
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"thinking"}}"#,
            ),
            evt(
                "content_block_delta",
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"hm"}}"#,
            ),
            evt(
                "content_block_delta",
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"signature_delta","signature":"c2ln"}}"#,
            ),
            evt("content_block_stop", r#"{"type":"content_block_stop","index":0}"#),
            evt(
                "content_block_start",
                r#"{"type":"content_block_start","index":1,"content_block":{"type":"text","text":""}}"#,
            ),
            evt("content_block_stop", r#"{"type":"content_block_stop","index":1}"#),
            evt(
                "content_block_start",
                r#"{"type":"content_block_start","index":2,"content_block":{"type":"tool_use","id":"toolu_ok","name":"read"}}"#,
            ),
            evt(
                "content_block_delta",
                r#"{"type":"content_block_delta","index":2,"delta":{"type":"input_json_delta","partial_json":"{\"path\":\"/tmp/a\"}"}}"#,
            ),
            evt("content_block_stop", r#"{"type":"content_block_stop","index":2}"#),
            evt(
                "content_block_start",
                r#"{"type":"content_block_start","index":3,"content_block":{"type":"tool_use","id":"toolu_bad","name":"exec"}}"#,
            ),
            evt(
                "content_block_delta",
                r#"{"type":"content_block_delta","index":3,"delta":{"type":"input_json_delta","partial_json":"{\"command\":\"rm -rf /\"}"}}"#,
            ),
            evt("content_block_stop", r#"{"type":"content_block_stop","index":3}"#),
            evt(
                "message_delta",
                r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"}}"#,
            ),
            evt("message_stop", r#"{"type":"message_stop"}"#),
        ]
    }

    fn blocked_call(id: &str, index: usize) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: "exec".to_string(),
            index,
            ..ToolCall::default()
        }
    }

    fn collect_indices(events: &[SseEvent]) -> Vec<usize> {
        events
            .iter()
            .filter(|e| e.event == "content_block_start")
            .filter_map(|e| parse_index(&e.data))
            .collect()
    }

    #[test]
    fn test_partial_block_reindexes_contiguously() {
        let events = anthropic_two_tool_stream();
        // Block only the tool_use at index 2; the one at 3 survives.
        let blocked = vec![blocked_call("toolu_ok", 2)];
        let messages = vec![format_block_notice("read", "r", "m")];
        let modified = rewrite_stream(&events, WireFormat::AnthropicMessages, &blocked, &messages);

        // Surviving blocks: thinking(0), text(1), tool_use was 3 → 2,
        // injected notice at 3.
        assert_eq!(collect_indices(&modified), vec![0, 1, 2, 3]);

        // The surviving tool_use and its delta moved to index 2.
        let reconstructed = reconstruct(&modified, WireFormat::AnthropicMessages);
        assert_eq!(reconstructed.tool_calls.len(), 1);
        assert_eq!(reconstructed.tool_calls[0].id, "toolu_bad");
        assert_eq!(reconstructed.tool_calls[0].index, 2);
        assert_eq!(reconstructed.tool_calls[0].string_arg("command"), "rm -rf /");

        // One allowed tool call remains, so the stop reason is preserved.
        assert_eq!(reconstructed.stop_reason, "tool_use");
    }

    #[test]
    fn test_full_block_strips_all_tool_events_and_downgrades() {
        let events = anthropic_two_tool_stream();
        let blocked = vec![blocked_call("toolu_ok", 2), blocked_call("toolu_bad", 3)];
        let messages = vec![
            format_block_notice("read", "r1", "m1"),
            format_block_notice("exec", "r2", "m2"),
        ];
        let modified = rewrite_stream(&events, WireFormat::AnthropicMessages, &blocked, &messages);

        let reconstructed = reconstruct(&modified, WireFormat::AnthropicMessages);
        assert!(reconstructed.tool_calls.is_empty());
        assert_eq!(reconstructed.stop_reason, "end_turn");

        // thinking(0), text(1), notice(2) — dense.
        assert_eq!(collect_indices(&modified), vec![0, 1, 2]);
        let notice_delta = modified
            .iter()
            .find(|e| e.event == "content_block_delta" && e.data.contains("Multiple tool calls"))
            .expect("notice delta present");
        assert!(notice_delta.data.contains("[CtrlAI] Multiple tool calls blocked:"));

        // message_stop stays last.
        assert_eq!(modified.last().unwrap().event, "message_stop");
    }

    #[test]
    fn test_unmoved_events_are_byte_identical() {
        let events = anthropic_two_tool_stream();
        let blocked = vec![blocked_call("toolu_bad", 3)];
        let messages = vec![format_block_notice("exec", "r", "m")];
        let modified = rewrite_stream(&events, WireFormat::AnthropicMessages, &blocked, &messages);

        // Thinking and text blocks keep their indices, so their events —
        // signature included — must be byte-identical to the input.
        for original in &events[..7] {
            assert!(
                modified.contains(original),
                "event not replayed verbatim: {original:?}"
            );
        }
    }

    #[test]
    fn test_empty_blocked_set_is_identity() {
        let events = anthropic_two_tool_stream();
        let modified = rewrite_stream(&events, WireFormat::AnthropicMessages, &[], &[]);
        assert_eq!(modified, events);
    }

    #[test]
    fn test_openai_stream_block_removes_fragments() {
        let events = vec![
            evt(
                "",
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"exec","arguments":"{\"command\":\"rm -rf /\"}"}}]},"finish_reason":null}]}"#,
            ),
            evt("", r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#),
            evt("", "[DONE]"),
        ];
        let blocked = vec![blocked_call("call_1", 0)];
        let messages = vec![format_block_notice("exec", "r", "m")];
        let modified = rewrite_stream(&events, WireFormat::OpenAiChat, &blocked, &messages);

        let reconstructed = reconstruct(&modified, WireFormat::OpenAiChat);
        assert!(reconstructed.tool_calls.is_empty());
        assert_eq!(reconstructed.stop_reason, "stop");

        // Notice injected just before [DONE].
        let n = modified.len();
        assert_eq!(modified[n - 1].data, "[DONE]");
        assert!(modified[n - 2].data.contains("[CtrlAI] Blocked:"));
    }

    #[test]
    fn test_openai_stream_partial_block_keeps_finish_reason() {
        let events = vec![
            evt(
                "",
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_ok","function":{"name":"read","arguments":"{}"}},{"index":1,"id":"call_bad","function":{"name":"exec","arguments":"{}"}}]},"finish_reason":null}]}"#,
            ),
            evt("", r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#),
            evt("", "[DONE]"),
        ];
        let blocked = vec![blocked_call("call_bad", 1)];
        let messages = vec![format_block_notice("exec", "r", "m")];
        let modified = rewrite_stream(&events, WireFormat::OpenAiChat, &blocked, &messages);

        let reconstructed = reconstruct(&modified, WireFormat::OpenAiChat);
        assert_eq!(reconstructed.tool_calls.len(), 1);
        assert_eq!(reconstructed.tool_calls[0].id, "call_ok");
        assert_eq!(reconstructed.stop_reason, "tool_calls");
    }

    #[test]
    fn test_responses_stream_drops_blocked_call_events() {
        let events = vec![
            evt(
                "response.output_item.added",
                r#"{"type":"function_call","call_id":"call_1","name":"exec","arguments":""}"#,
            ),
            evt(
                "response.function_call_arguments.delta",
                r#"{"call_id":"call_1","delta":"{\"command\":\"mkfs\"}"}"#,
            ),
            evt(
                "response.function_call_arguments.done",
                r#"{"call_id":"call_1","arguments":"{\"command\":\"mkfs\"}"}"#,
            ),
            evt("response.completed", r#"{"id":"resp_1","status":"completed"}"#),
        ];
        let blocked = vec![blocked_call("call_1", 0)];
        let messages = vec![format_block_notice("exec", "r", "m")];
        let modified = rewrite_stream(&events, WireFormat::OpenAiResponses, &blocked, &messages);

        // All three function-call events dropped; notice + completed remain.
        assert_eq!(modified.len(), 2);
        assert_eq!(modified[0].event, "response.output_item.added");
        assert!(modified[0].data.contains("[CtrlAI] Blocked:"));
        assert_eq!(modified[1].event, "response.completed");
    }

    #[test]
    fn test_responses_stream_keeps_other_items() {
        let events = vec![
            evt(
                "response.output_item.added",
                r#"{"type":"message","content":[]}"#,
            ),
            evt("response.completed", r#"{"status":"completed"}"#),
        ];
        let blocked = vec![blocked_call("call_x", 0)];
        let modified = rewrite_stream(&events, WireFormat::OpenAiResponses, &blocked, &[]);
        assert_eq!(modified.len(), 2);
        assert_eq!(modified[0].data, r#"{"type":"message","content":[]}"#);
    }

    #[test]
    fn test_unknown_format_passthrough() {
        let events = vec![evt("", "data")];
        let blocked = vec![blocked_call("x", 0)];
        let modified = rewrite_stream(&events, WireFormat::Unknown, &blocked, &[]);
        assert_eq!(modified, events);
    }
}
