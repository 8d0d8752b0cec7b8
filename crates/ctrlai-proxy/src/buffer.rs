//! Stream buffering and message reconstruction.
//!
//! Buffer-then-forward: the entire event stream is read until its terminal
//! marker (or a deadline), the full message is reconstructed from the
//! incremental deltas, tool calls are evaluated, and only then is the
//! stream replayed to the SDK. Buffering adds latency equal to the
//! provider's generation time; the alternative is zero enforcement.

use crate::sse::{SseEvent, SseParser};
use ctrlai_core::{ToolCall, WireFormat};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;

/// A reconstructed Anthropic content block, accumulated across events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentBlock {
    pub index: usize,
    pub block_type: String,
    pub text: String,
    pub thinking: String,
    pub signature: String,
    pub id: String,
    pub name: String,
    /// Accumulated `input_json_delta` fragments.
    pub input_json: String,
}

/// The whole message folded out of a buffered event stream.
#[derive(Debug, Clone, Default)]
pub struct BufferedMessage {
    /// Reconstructed content blocks (Anthropic only).
    pub content_blocks: Vec<ContentBlock>,
    /// Extracted tool calls, in provider order.
    pub tool_calls: Vec<ToolCall>,
    /// Final `stop_reason`/`finish_reason`/`status` from the stream.
    pub stop_reason: String,
}

/// Read SSE events from an upstream response until the terminal marker or
/// the deadline elapses. On deadline, whatever events have arrived are
/// used — a slow provider must not hang the proxy, and partial events are
/// better than none.
pub async fn buffer_events(response: &mut reqwest::Response, timeout: Duration) -> Vec<SseEvent> {
    let timeout = if timeout.is_zero() {
        Duration::from_secs(30)
    } else {
        timeout
    };
    let deadline = tokio::time::Instant::now() + timeout;
    let mut parser = SseParser::new();

    while !parser.is_done() {
        match tokio::time::timeout_at(deadline, response.chunk()).await {
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "SSE buffer deadline, flushing partial events");
                break;
            }
            Ok(Ok(Some(bytes))) => parser.feed(&bytes),
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                warn!(error = %e, "SSE read error (using partial events)");
                break;
            }
        }
    }

    parser.into_events()
}

/// Fold an ordered event sequence into a whole message.
pub fn reconstruct(events: &[SseEvent], format: WireFormat) -> BufferedMessage {
    match format {
        WireFormat::AnthropicMessages => reconstruct_anthropic(events),
        WireFormat::OpenAiChat => reconstruct_openai(events),
        WireFormat::OpenAiResponses => reconstruct_openai_responses(events),
        WireFormat::Unknown => BufferedMessage::default(),
    }
}

/// Anthropic: track content blocks by `index`, folding deltas into the
/// owning block. Tool-use argument fragments (`input_json_delta`)
/// concatenate into one JSON string.
fn reconstruct_anthropic(events: &[SseEvent]) -> BufferedMessage {
    let mut msg = BufferedMessage::default();
    let mut blocks: BTreeMap<usize, ContentBlock> = BTreeMap::new();

    for event in events {
        let Ok(data) = serde_json::from_str::<Value>(&event.data) else {
            continue;
        };

        match data["type"].as_str().unwrap_or_default() {
            "content_block_start" => {
                let Some(index) = data["index"].as_u64() else {
                    continue;
                };
                let cb = &data["content_block"];
                blocks.insert(
                    index as usize,
                    ContentBlock {
                        index: index as usize,
                        block_type: cb["type"].as_str().unwrap_or_default().to_string(),
                        text: cb["text"].as_str().unwrap_or_default().to_string(),
                        id: cb["id"].as_str().unwrap_or_default().to_string(),
                        name: cb["name"].as_str().unwrap_or_default().to_string(),
                        ..ContentBlock::default()
                    },
                );
            }
            "content_block_delta" => {
                let Some(index) = data["index"].as_u64() else {
                    continue;
                };
                let Some(block) = blocks.get_mut(&(index as usize)) else {
                    continue;
                };
                let delta = &data["delta"];
                match delta["type"].as_str().unwrap_or_default() {
                    "text_delta" => {
                        block.text.push_str(delta["text"].as_str().unwrap_or_default());
                    }
                    "thinking_delta" => {
                        block
                            .thinking
                            .push_str(delta["thinking"].as_str().unwrap_or_default());
                    }
                    "signature_delta" => {
                        block
                            .signature
                            .push_str(delta["signature"].as_str().unwrap_or_default());
                    }
                    "input_json_delta" => {
                        block
                            .input_json
                            .push_str(delta["partial_json"].as_str().unwrap_or_default());
                    }
                    _ => {}
                }
            }
            "message_delta" => {
                if let Some(stop_reason) = data["delta"]["stop_reason"].as_str() {
                    msg.stop_reason = stop_reason.to_string();
                }
            }
            _ => {}
        }
    }

    for (_, block) in blocks {
        if block.block_type == "tool_use" {
            let mut tc = ToolCall {
                id: block.id.clone(),
                name: block.name.clone(),
                index: block.index,
                arguments: None,
                raw_arguments: block.input_json.clone(),
            };
            if !block.input_json.is_empty() {
                tc.arguments = serde_json::from_str(&block.input_json).ok();
            }
            msg.tool_calls.push(tc);
        }
        msg.content_blocks.push(block);
    }

    msg
}

/// OpenAI Chat: tool-call fragments fold by `index`; `name` appears only
/// in the first fragment, argument fragments concatenate.
fn reconstruct_openai(events: &[SseEvent]) -> BufferedMessage {
    #[derive(Default)]
    struct Accum {
        id: String,
        name: String,
        arguments: String,
    }

    let mut msg = BufferedMessage::default();
    let mut accums: BTreeMap<usize, Accum> = BTreeMap::new();

    for event in events {
        if event.data.is_empty() || event.data == "[DONE]" {
            continue;
        }
        let Ok(data) = serde_json::from_str::<Value>(&event.data) else {
            continue;
        };
        let Some(choice) = data["choices"].as_array().and_then(|c| c.first()) else {
            continue;
        };

        if let Some(tool_calls) = choice["delta"]["tool_calls"].as_array() {
            for tc in tool_calls {
                let index = tc["index"].as_u64().unwrap_or(0) as usize;
                let accum = accums.entry(index).or_default();
                if let Some(id) = tc["id"].as_str() {
                    if !id.is_empty() {
                        accum.id = id.to_string();
                    }
                }
                if let Some(name) = tc["function"]["name"].as_str() {
                    if !name.is_empty() {
                        accum.name = name.to_string();
                    }
                }
                if let Some(fragment) = tc["function"]["arguments"].as_str() {
                    accum.arguments.push_str(fragment);
                }
            }
        }

        if let Some(finish_reason) = choice["finish_reason"].as_str() {
            msg.stop_reason = finish_reason.to_string();
        }
    }

    for (index, accum) in accums {
        let arguments = if accum.arguments.is_empty() {
            None
        } else {
            serde_json::from_str(&accum.arguments).ok()
        };
        msg.tool_calls.push(ToolCall {
            id: accum.id,
            name: accum.name,
            index,
            arguments,
            raw_arguments: accum.arguments,
        });
    }

    msg
}

/// OpenAI Responses: function-call items appear as whole output items;
/// arguments arrive through `delta` events and a final `done` event whose
/// complete arguments override any accumulated deltas (deltas may be
/// truncated on timeout).
fn reconstruct_openai_responses(events: &[SseEvent]) -> BufferedMessage {
    #[derive(Default)]
    struct Accum {
        call_id: String,
        name: String,
        arguments: String,
        index: usize,
    }

    let mut msg = BufferedMessage::default();
    let mut accums: Vec<Accum> = Vec::new();

    fn find_mut<'a>(accums: &'a mut [Accum], call_id: &str) -> Option<&'a mut Accum> {
        accums.iter_mut().find(|a| a.call_id == call_id)
    }

    for event in events {
        if event.data.is_empty() {
            continue;
        }
        let Ok(data) = serde_json::from_str::<Value>(&event.data) else {
            continue;
        };

        match event.event.as_str() {
            "response.output_item.added" => {
                if data["type"].as_str() == Some("function_call") {
                    let index = accums.len();
                    accums.push(Accum {
                        call_id: data["call_id"].as_str().unwrap_or_default().to_string(),
                        name: data["name"].as_str().unwrap_or_default().to_string(),
                        arguments: String::new(),
                        index,
                    });
                }
            }
            "response.function_call_arguments.delta" => {
                let call_id = data["call_id"].as_str().unwrap_or_default();
                if let Some(accum) = find_mut(&mut accums, call_id) {
                    accum
                        .arguments
                        .push_str(data["delta"].as_str().unwrap_or_default());
                }
            }
            "response.function_call_arguments.done" => {
                let call_id = data["call_id"].as_str().unwrap_or_default();
                if let Some(accum) = find_mut(&mut accums, call_id) {
                    // The done event is authoritative.
                    accum.arguments = data["arguments"].as_str().unwrap_or_default().to_string();
                }
            }
            "response.completed" => {
                if let Some(status) = data["status"].as_str() {
                    msg.stop_reason = status.to_string();
                }
            }
            _ => {}
        }
    }

    for accum in accums {
        let arguments = if accum.arguments.is_empty() {
            None
        } else {
            serde_json::from_str(&accum.arguments).ok()
        };
        msg.tool_calls.push(ToolCall {
            id: accum.call_id,
            name: accum.name,
            index: accum.index,
            arguments,
            raw_arguments: accum.arguments,
        });
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evt(event: &str, data: &str) -> SseEvent {
        SseEvent {
            event: event.to_string(),
            data: data.to_string(),
        }
    }

    // ---- Anthropic ----------------------------------------------------------

    fn anthropic_tool_stream() -> Vec<SseEvent> {
        vec![
            evt("message_start", r#"{"type":"message_start","message":{"id":"msg_1"}}"#),
            evt(
                "content_block_start",
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            ),
            evt(
                "content_block_delta",
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Running"}}"#,
            ),
            evt("content_block_stop", r#"{"type":"content_block_stop","index":0}"#),
            evt(
                "content_block_start",
                r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"exec","input":{}}}"#,
            ),
            evt(
                "content_block_delta",
                r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"command\":"}}"#,
            ),
            evt(
                "content_block_delta",
                r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":" \"ls -la\"}"}}"#,
            ),
            evt("content_block_stop", r#"{"type":"content_block_stop","index":1}"#),
            evt(
                "message_delta",
                r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"}}"#,
            ),
            evt("message_stop", r#"{"type":"message_stop"}"#),
        ]
    }

    #[test]
    fn test_reconstruct_anthropic_folds_argument_fragments() {
        let msg = reconstruct(&anthropic_tool_stream(), WireFormat::AnthropicMessages);
        assert_eq!(msg.tool_calls.len(), 1);
        let tc = &msg.tool_calls[0];
        assert_eq!(tc.id, "toolu_1");
        assert_eq!(tc.name, "exec");
        assert_eq!(tc.index, 1);
        assert_eq!(tc.string_arg("command"), "ls -la");
        assert_eq!(msg.stop_reason, "tool_use");
    }

    #[test]
    fn test_reconstruct_anthropic_text_blocks() {
        let msg = reconstruct(&anthropic_tool_stream(), WireFormat::AnthropicMessages);
        assert_eq!(msg.content_blocks.len(), 2);
        assert_eq!(msg.content_blocks[0].block_type, "text");
        assert_eq!(msg.content_blocks[0].text, "Running");
    }

    #[test]
    fn test_reconstruct_anthropic_thinking_signature() {
        let events = vec![
            evt(
                "content_block_start",
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"thinking"}}"#,
            ),
            evt(
                "content_block_delta",
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"step one"}}"#,
            ),
            evt(
                "content_block_delta",
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"signature_delta","signature":"c2ln"}}"#,
            ),
        ];
        let msg = reconstruct(&events, WireFormat::AnthropicMessages);
        assert_eq!(msg.content_blocks[0].thinking, "step one");
        assert_eq!(msg.content_blocks[0].signature, "c2ln");
        assert!(msg.tool_calls.is_empty());
    }

    #[test]
    fn test_reconstruct_anthropic_malformed_events_skipped() {
        let events = vec![evt("content_block_start", "not json"), evt("", "")];
        let msg = reconstruct(&events, WireFormat::AnthropicMessages);
        assert!(msg.content_blocks.is_empty());
    }

    // ---- OpenAI Chat --------------------------------------------------------

    fn openai_tool_stream() -> Vec<SseEvent> {
        vec![
            evt(
                "",
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"exec","arguments":""}}]},"finish_reason":null}]}"#,
            ),
            evt(
                "",
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"command\":"}}]},"finish_reason":null}]}"#,
            ),
            evt(
                "",
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":" \"ls -la\"}"}}]},"finish_reason":null}]}"#,
            ),
            evt("", r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#),
            evt("", "[DONE]"),
        ]
    }

    #[test]
    fn test_reconstruct_openai_folds_by_index() {
        let msg = reconstruct(&openai_tool_stream(), WireFormat::OpenAiChat);
        assert_eq!(msg.tool_calls.len(), 1);
        let tc = &msg.tool_calls[0];
        assert_eq!(tc.id, "call_1");
        assert_eq!(tc.name, "exec");
        assert_eq!(tc.string_arg("command"), "ls -la");
        assert_eq!(msg.stop_reason, "tool_calls");
    }

    #[test]
    fn test_reconstruct_openai_two_parallel_calls() {
        let events = vec![
            evt(
                "",
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"read","arguments":"{}"}},{"index":1,"id":"call_b","function":{"name":"exec","arguments":""}}]}}]}"#,
            ),
            evt(
                "",
                r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"function":{"arguments":"{\"command\":\"pwd\"}"}}]}}]}"#,
            ),
            evt("", "[DONE]"),
        ];
        let msg = reconstruct(&events, WireFormat::OpenAiChat);
        assert_eq!(msg.tool_calls.len(), 2);
        assert_eq!(msg.tool_calls[0].name, "read");
        assert_eq!(msg.tool_calls[1].name, "exec");
        assert_eq!(msg.tool_calls[1].string_arg("command"), "pwd");
    }

    #[test]
    fn test_reconstruct_openai_no_tool_calls() {
        let events = vec![
            evt("", r#"{"choices":[{"delta":{"content":"Hello"},"finish_reason":null}]}"#),
            evt("", r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#),
            evt("", "[DONE]"),
        ];
        let msg = reconstruct(&events, WireFormat::OpenAiChat);
        assert!(msg.tool_calls.is_empty());
        assert_eq!(msg.stop_reason, "stop");
    }

    // ---- OpenAI Responses ---------------------------------------------------

    fn responses_tool_stream() -> Vec<SseEvent> {
        vec![
            evt(
                "response.output_item.added",
                r#"{"type":"function_call","call_id":"call_1","name":"exec","arguments":""}"#,
            ),
            evt(
                "response.function_call_arguments.delta",
                r#"{"call_id":"call_1","delta":"{\"command\":"}"#,
            ),
            evt(
                "response.function_call_arguments.done",
                r#"{"call_id":"call_1","arguments":"{\"command\": \"ls\"}"}"#,
            ),
            evt(
                "response.completed",
                r#"{"id":"resp_1","status":"completed"}"#,
            ),
        ]
    }

    #[test]
    fn test_reconstruct_responses_done_overrides_deltas() {
        let msg = reconstruct(&responses_tool_stream(), WireFormat::OpenAiResponses);
        assert_eq!(msg.tool_calls.len(), 1);
        // The truncated delta is replaced by the done event's arguments.
        assert_eq!(msg.tool_calls[0].string_arg("command"), "ls");
        assert_eq!(msg.stop_reason, "completed");
    }

    #[test]
    fn test_reconstruct_responses_without_done_uses_deltas() {
        let events = vec![
            evt(
                "response.output_item.added",
                r#"{"type":"function_call","call_id":"call_1","name":"exec","arguments":""}"#,
            ),
            evt(
                "response.function_call_arguments.delta",
                r#"{"call_id":"call_1","delta":"{\"command\":"}"#,
            ),
            evt(
                "response.function_call_arguments.delta",
                r#"{"call_id":"call_1","delta":" \"pwd\"}"}"#,
            ),
        ];
        let msg = reconstruct(&events, WireFormat::OpenAiResponses);
        assert_eq!(msg.tool_calls[0].string_arg("command"), "pwd");
    }

    #[test]
    fn test_reconstruct_responses_non_function_items_ignored() {
        let events = vec![evt(
            "response.output_item.added",
            r#"{"type":"message","content":[]}"#,
        )];
        let msg = reconstruct(&events, WireFormat::OpenAiResponses);
        assert!(msg.tool_calls.is_empty());
    }

    #[test]
    fn test_reconstruct_unknown_format_is_empty() {
        let msg = reconstruct(&anthropic_tool_stream(), WireFormat::Unknown);
        assert!(msg.tool_calls.is_empty());
        assert!(msg.content_blocks.is_empty());
    }
}
