//! Server-Sent Events framing.
//!
//! Frames are built by hand rather than through a framework helper so the
//! engine controls exactly which bytes split lines: SSE framing recognizes
//! CR, LF, and CRLF only. U+0085, U+2028 and U+2029 are data, never
//! terminators, which is what keeps Unicode payloads byte-identical through
//! a text event.

use serde_json::json;

/// Encode one message payload as an SSE event.
///
/// Binary payloads arrive base64-encoded on a single `data:` line (the
/// response carries `Stream-SSE-Data-Encoding: base64`). Text payloads are
/// split on CR/LF/CRLF into multiple `data:` lines; the client re-joins
/// them with `\n`.
pub fn message_frame(payload: &[u8], base64_encode: bool) -> String {
    let mut frame = String::new();
    if base64_encode {
        use base64::Engine;
        frame.push_str("data: ");
        frame.push_str(&base64::engine::general_purpose::STANDARD.encode(payload));
        frame.push('\n');
    } else {
        let text = String::from_utf8_lossy(payload);
        for line in split_sse_lines(&text) {
            frame.push_str("data: ");
            frame.push_str(line);
            frame.push('\n');
        }
    }
    frame.push('\n');
    frame
}

/// Encode a `control` event carrying the resume position.
pub fn control_frame(next_offset: &str, cursor: Option<u64>, up_to_date: bool) -> String {
    let mut body = json!({
        "streamNextOffset": next_offset,
        "upToDate": up_to_date,
    });
    if let Some(cursor) = cursor {
        body["streamCursor"] = json!(cursor.to_string());
    }
    format!("event: control\ndata: {body}\n\n")
}

/// Split on the three SSE line terminators only.
fn split_sse_lines(text: &str) -> Vec<&str> {
    let mut lines = Vec::new();
    let bytes = text.as_bytes();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\n' => {
                lines.push(&text[start..i]);
                i += 1;
                start = i;
            }
            b'\r' => {
                lines.push(&text[start..i]);
                i += 1;
                if bytes.get(i) == Some(&b'\n') {
                    i += 1;
                }
                start = i;
            }
            _ => i += 1,
        }
    }
    lines.push(&text[start..]);
    lines
}

/// SSE event types, as a consuming client sees them.
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    /// Data event with payload
    Data(String),
    /// Control event with metadata
    Control {
        stream_next_offset: String,
        stream_cursor: Option<String>,
        up_to_date: bool,
    },
}

/// Parse a buffer of SSE wire data into events.
///
/// This is the inverse of the framing above and exists for the tests: every
/// frame the server emits must round-trip through the same rules clients
/// apply (multi-line `data:` joined with `\n`, `control` events as JSON).
pub fn parse_events(raw: &str) -> Vec<SseEvent> {
    let mut events = Vec::new();
    let mut event_type: Option<String> = None;
    let mut data_lines: Vec<String> = Vec::new();

    for line in split_sse_lines(raw) {
        if line.is_empty() {
            // Empty line = event dispatch
            if let Some(event) = dispatch(event_type.take(), std::mem::take(&mut data_lines)) {
                events.push(event);
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            event_type = Some(rest.trim_start().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        }
        // Ignore other fields (id:, retry:, comments starting with :)
    }
    events
}

fn dispatch(event_type: Option<String>, data_lines: Vec<String>) -> Option<SseEvent> {
    if data_lines.is_empty() {
        return None;
    }
    let data = data_lines.join("\n");

    match event_type.as_deref() {
        Some("control") => {
            let parsed: serde_json::Value = serde_json::from_str(&data).ok()?;
            Some(SseEvent::Control {
                stream_next_offset: parsed
                    .get("streamNextOffset")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                stream_cursor: parsed
                    .get("streamCursor")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
                up_to_date: parsed
                    .get("upToDate")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
            })
        }
        _ => Some(SseEvent::Data(data)),
    }
}
