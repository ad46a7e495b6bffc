//! Usage: SSE framing for both directions (upstream byte stream -> events, egress serialization).

use serde_json::Value;

const DONE_SENTINEL: &str = "[DONE]";

/// A content-level event extracted from an upstream SSE stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatStreamEvent {
    /// A non-empty `choices[0].delta.content` fragment.
    Chunk(String),
    /// The `[DONE]` sentinel.
    Done,
    /// An in-band `error` object; the stream itself stays open.
    Error(String),
}

/// Incremental SSE parser.
///
/// Accepts arbitrary byte slices and emits complete events; data that
/// crosses a line or event boundary is buffered until the boundary
/// arrives, so any byte-level split of a stream yields the same events.
#[derive(Debug, Default)]
pub struct SseFramer {
    buf: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<ChatStreamEvent> {
        self.buf.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();

            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    let payload = self.data_lines.join("\n");
                    self.data_lines.clear();
                    if let Some(event) = dispatch_payload(&payload) {
                        events.push(event);
                    }
                }
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data_lines
                    .push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
            // Comments (`:`), `event:` and unknown fields are ignored.
        }

        events
    }

    /// True when a partial line or unterminated event is still buffered.
    pub fn has_pending(&self) -> bool {
        !self.buf.is_empty() || !self.data_lines.is_empty()
    }
}

fn dispatch_payload(payload: &str) -> Option<ChatStreamEvent> {
    if payload == DONE_SENTINEL {
        return Some(ChatStreamEvent::Done);
    }

    // Malformed JSON between valid events is dropped silently.
    let json: Value = serde_json::from_str(payload).ok()?;

    match json.get("error") {
        Some(Value::String(msg)) => return Some(ChatStreamEvent::Error(msg.clone())),
        Some(Value::Object(obj)) if !obj.is_empty() => {
            let msg = obj
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| Value::Object(obj.clone()).to_string());
            return Some(ChatStreamEvent::Error(msg));
        }
        _ => {}
    }

    let content = json
        .get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .filter(|s| !s.is_empty())?;
    Some(ChatStreamEvent::Chunk(content.to_string()))
}

// Egress framing (gateway -> client).

pub const EGRESS_DONE: &str = "data: [DONE]\n\n";

pub fn egress_chunk(content: &str) -> String {
    let frame = serde_json::json!({ "choices": [{ "delta": { "content": content } }] });
    format!("data: {frame}\n\n")
}

pub fn egress_error(message: &str) -> String {
    let frame = serde_json::json!({ "error": { "message": message } });
    format!("data: {frame}\n\n")
}
