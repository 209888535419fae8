//! Line-oriented wire encoding of canonical events.
//!
//! One event per line: `event-type: {json payload}\n`.

use serde_json::{json, Value};

use crate::error::GatewayError;
use crate::protocol::canonical::{BlockKind, CanonicalEvent, Delta};

pub const MESSAGE_START: &str = "message_start";
pub const CONTENT_BLOCK_START: &str = "content_block_start";
pub const CONTENT_BLOCK_DELTA: &str = "content_block_delta";
pub const CONTENT_BLOCK_STOP: &str = "content_block_stop";
pub const MESSAGE_DELTA: &str = "message_delta";
pub const MESSAGE_STOP: &str = "message_stop";
pub const ERROR: &str = "error";

#[must_use]
pub fn event_type(event: &CanonicalEvent) -> &'static str {
    match event {
        CanonicalEvent::MessageStart { .. } => MESSAGE_START,
        CanonicalEvent::BlockStart { .. } => CONTENT_BLOCK_START,
        CanonicalEvent::BlockDelta { .. } => CONTENT_BLOCK_DELTA,
        CanonicalEvent::BlockStop { .. } => CONTENT_BLOCK_STOP,
        CanonicalEvent::MessageDelta { .. } => MESSAGE_DELTA,
        CanonicalEvent::MessageStop => MESSAGE_STOP,
    }
}

#[must_use]
pub fn event_payload(event: &CanonicalEvent) -> Value {
    match event {
        CanonicalEvent::MessageStart { id, model } => json!({"id": id, "model": model}),
        CanonicalEvent::BlockStart {
            index,
            kind,
            tool_id,
            tool_name,
        } => {
            let block = match kind {
                BlockKind::Text => json!({"type": "text"}),
                BlockKind::Thinking => json!({"type": "thinking"}),
                BlockKind::ToolUse => json!({"type": "tool_use", "id": tool_id, "name": tool_name}),
            };
            json!({"index": index, "content_block": block})
        }
        CanonicalEvent::BlockDelta { index, delta } => {
            let delta = match delta {
                Delta::Text(text) => json!({"type": "text_delta", "text": text}),
                Delta::Thinking(text) => json!({"type": "thinking_delta", "thinking": text}),
                Delta::ToolInput(fragment) => {
                    json!({"type": "input_json_delta", "partial_json": fragment})
                }
            };
            json!({"index": index, "delta": delta})
        }
        CanonicalEvent::BlockStop { index } => json!({"index": index}),
        CanonicalEvent::MessageDelta { stop_reason, usage } => {
            json!({"stop_reason": stop_reason.as_str(), "usage": usage})
        }
        CanonicalEvent::MessageStop => json!({}),
    }
}

/// Encode one event as a wire line, newline included.
#[must_use]
pub fn encode_event(event: &CanonicalEvent) -> String {
    encode_line(event_type(event), &event_payload(event))
}

/// Encode the single structured error object.
#[must_use]
pub fn encode_error(err: &GatewayError) -> String {
    encode_line(ERROR, &err.to_payload())
}

fn encode_line(event_type: &str, payload: &Value) -> String {
    let payload = payload.to_string();
    let mut out = String::with_capacity(event_type.len() + payload.len() + 3);
    out.push_str(event_type);
    out.push_str(": ");
    out.push_str(&payload);
    out.push('\n');
    out
}

/// Split a wire line into its event type and parsed payload.
#[must_use]
pub fn decode_line(line: &str) -> Option<(&str, Value)> {
    let (event_type, payload) = line.trim_end_matches(['\r', '\n']).split_once(": ")?;
    let payload = serde_json::from_str(payload).ok()?;
    Some((event_type, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FailureKind, UpstreamFailure};
    use crate::protocol::canonical::{StopReason, Usage};

    #[test]
    fn test_text_delta_line() {
        let line = encode_event(&CanonicalEvent::BlockDelta {
            index: 0,
            delta: Delta::Text("Hel\nlo".into()),
        });
        assert!(line.starts_with("content_block_delta: {"));
        assert!(line.ends_with("}\n"));
        assert_eq!(line.matches('\n').count(), 1);
        let (_, payload) = decode_line(&line).unwrap();
        assert_eq!(payload["index"], 0);
        assert_eq!(payload["delta"]["type"], "text_delta");
        assert_eq!(payload["delta"]["text"], "Hel\nlo");
    }

    #[test]
    fn test_tool_block_start_payload() {
        let line = encode_event(&CanonicalEvent::BlockStart {
            index: 2,
            kind: BlockKind::ToolUse,
            tool_id: Some("t1".into()),
            tool_name: Some("lookup".into()),
        });
        let (ty, payload) = decode_line(&line).unwrap();
        assert_eq!(ty, CONTENT_BLOCK_START);
        assert_eq!(payload["index"], 2);
        assert_eq!(payload["content_block"]["type"], "tool_use");
        assert_eq!(payload["content_block"]["name"], "lookup");
    }

    #[test]
    fn test_message_delta_and_stop() {
        let delta = encode_event(&CanonicalEvent::MessageDelta {
            stop_reason: StopReason::Other("refusal".into()),
            usage: Usage {
                input_tokens: 10,
                output_tokens: 2,
            },
        });
        let (_, payload) = decode_line(&delta).unwrap();
        assert_eq!(payload["stop_reason"], "refusal");
        assert_eq!(payload["usage"]["input_tokens"], 10);
        assert_eq!(encode_event(&CanonicalEvent::MessageStop), "message_stop: {}\n");
    }

    #[test]
    fn test_error_line() {
        let err = GatewayError::Upstream(UpstreamFailure::new(FailureKind::Fatal, "nope"));
        let line = encode_error(&err);
        let (ty, payload) = decode_line(&line).unwrap();
        assert_eq!(ty, ERROR);
        assert_eq!(payload["error"]["classification"], "fatal");
    }
}
