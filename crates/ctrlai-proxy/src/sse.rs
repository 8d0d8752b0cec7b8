//! Server-Sent Events parsing and serialization.
//!
//! Both streaming formats ride on SSE, with different envelopes:
//!
//! ```text
//! Anthropic:  event: <type>\ndata: <json>\n\n   (terminates at message_stop)
//! OpenAI:     data: <json>\n\n                  (terminates at data: [DONE])
//! Responses:  event: <typed name>\ndata: <json> (terminates at response.completed)
//! ```

use tracing::warn;

/// Single reasoning events can be enormous; a small ceiling would silently
/// truncate them.
const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

/// A single Server-Sent Event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type (Anthropic/Responses) or empty (OpenAI Chat).
    pub event: String,
    /// JSON payload or `[DONE]`.
    pub data: String,
}

/// Incremental SSE parser. Feed it raw byte chunks as they arrive; it
/// splits on newlines (buffering partial lines across chunk boundaries),
/// assembles events at blank lines, skips keep-alive pings and comment
/// lines, and joins multiple `data:` lines with a newline.
#[derive(Debug, Default)]
pub struct SseParser {
    line_buffer: String,
    current_event: String,
    current_data: String,
    events: Vec<SseEvent>,
    done: bool,
}

impl SseParser {
    pub fn new() -> Self {
        SseParser::default()
    }

    /// Whether a terminal marker has been seen (`message_stop`, `[DONE]`,
    /// or `response.completed`).
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Events assembled so far.
    pub fn events(&self) -> &[SseEvent] {
        &self.events
    }

    /// Consume the parser, returning all assembled events.
    pub fn into_events(self) -> Vec<SseEvent> {
        self.events
    }

    /// Process a raw byte chunk from the upstream response.
    pub fn feed(&mut self, bytes: &[u8]) {
        if self.done {
            return;
        }
        self.line_buffer.push_str(&String::from_utf8_lossy(bytes));

        while let Some(newline_pos) = self.line_buffer.find('\n') {
            let line: String = self.line_buffer[..newline_pos].to_string();
            self.line_buffer.drain(..=newline_pos);
            self.process_line(line.trim_end_matches('\r'));
            if self.done {
                self.line_buffer.clear();
                return;
            }
        }

        if self.line_buffer.len() > MAX_LINE_BYTES {
            warn!(
                buffered = self.line_buffer.len(),
                "SSE line exceeds buffer ceiling, ending stream with partial events"
            );
            self.line_buffer.clear();
            self.done = true;
        }
    }

    fn process_line(&mut self, line: &str) {
        // Blank line = end of event.
        if line.is_empty() {
            if !self.current_data.is_empty() {
                // Keep-alive pings carry no content.
                if self.current_event != "ping" {
                    self.events.push(SseEvent {
                        event: std::mem::take(&mut self.current_event),
                        data: self.current_data.clone(),
                    });
                }
                let terminal = {
                    let last = self.events.last();
                    last.is_some_and(|e| {
                        e.event == "message_stop"
                            || e.event == "response.completed"
                            || e.data == "[DONE]"
                    })
                };
                if terminal {
                    self.done = true;
                }
            }
            self.current_event.clear();
            self.current_data.clear();
            return;
        }

        if let Some(value) = line.strip_prefix("event:") {
            self.current_event = value.trim().to_string();
            return;
        }

        if let Some(value) = line.strip_prefix("data:") {
            let value = value.trim();
            if self.current_data.is_empty() {
                self.current_data = value.to_string();
            } else {
                // Multi-line data joins with a newline.
                self.current_data.push('\n');
                self.current_data.push_str(value);
            }
            return;
        }

        // Comment lines (leading ':') and unknown fields are ignored.
    }
}

/// Serialize events back into SSE wire form. Multi-line data is split back
/// into one `data:` line per line, so serialization round-trips the parser.
pub fn serialize_events(events: &[SseEvent]) -> String {
    let mut out = String::new();
    for event in events {
        write_event(&mut out, event);
    }
    out
}

/// Append one event in wire form.
pub fn write_event(out: &mut String, event: &SseEvent) {
    if !event.event.is_empty() {
        out.push_str("event: ");
        out.push_str(&event.event);
        out.push('\n');
    }
    for line in event.data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
}
