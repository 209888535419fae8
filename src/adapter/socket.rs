//! Socket backend: one WebSocket per request, JSON text messages both ways.
//!
//! The gateway sends a single `chat.request` and then reads typed messages
//! until `message.end` or `error`. Protocol pings are answered in place.

use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

use crate::config::BackendConfig;
use crate::credentials::Credential;
use crate::error::{classify_error_code, UpstreamFailure};
use crate::protocol::canonical::EventBatch;
use crate::protocol::request::UnifiedRequest;
use crate::protocol::tool_names::ToolNameMap;
use crate::stream::IdleTimeout;
use crate::transport::websocket::failure_from_ws_error;
use crate::transport::{connect_socket, WsStream};

use super::{bearer_headers, drive, CanonicalStream, EventMapper, PreparedRequest, StreamState};

/// One decoded socket message.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    MessageStart { id: Option<String> },
    ReasoningDelta(String),
    TextDelta(String),
    ToolCallStart { id: String, name: String },
    ToolCallDelta { id: Option<String>, arguments: String },
    ToolCallEnd { id: Option<String> },
    Usage { input_tokens: Option<u64>, output_tokens: Option<u64> },
    MessageEnd { stop_reason: Option<String>, usage: Option<Value> },
    Error { code: String, message: String },
    Ping,
    Unknown(String),
}

impl SocketEvent {
    #[must_use]
    pub fn parse(message: &Value) -> Self {
        let kind = message.get("type").and_then(Value::as_str).unwrap_or_default();
        let text = |key: &str| {
            message
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let opt = |key: &str| message.get(key).and_then(Value::as_str).map(ToString::to_string);
        match kind {
            "message.start" => SocketEvent::MessageStart { id: opt("id") },
            "reasoning.delta" => SocketEvent::ReasoningDelta(text("text")),
            "text.delta" => SocketEvent::TextDelta(text("text")),
            "tool_call.start" => SocketEvent::ToolCallStart {
                id: text("id"),
                name: text("name"),
            },
            "tool_call.delta" => SocketEvent::ToolCallDelta {
                id: opt("id"),
                arguments: text("arguments"),
            },
            "tool_call.end" => SocketEvent::ToolCallEnd { id: opt("id") },
            "usage" => SocketEvent::Usage {
                input_tokens: message.get("input_tokens").and_then(Value::as_u64),
                output_tokens: message.get("output_tokens").and_then(Value::as_u64),
            },
            "message.end" => SocketEvent::MessageEnd {
                stop_reason: opt("stop_reason"),
                usage: message.get("usage").cloned(),
            },
            "error" => SocketEvent::Error {
                code: opt("code").unwrap_or_else(|| "error".to_string()),
                message: opt("message").unwrap_or_else(|| "upstream socket error".to_string()),
            },
            "ping" => SocketEvent::Ping,
            other => SocketEvent::Unknown(other.to_string()),
        }
    }

    fn is_terminal(message: &Value) -> bool {
        matches!(
            message.get("type").and_then(Value::as_str),
            Some("message.end" | "error")
        )
    }
}

pub(crate) struct SocketMapper {
    state: StreamState,
}

impl EventMapper for SocketMapper {
    type Raw = Value;

    fn on_raw(&mut self, raw: Value, out: &mut EventBatch) -> Result<(), UpstreamFailure> {
        match SocketEvent::parse(&raw) {
            SocketEvent::MessageStart { id } => {
                if let Some(id) = id {
                    self.state.set_message_id(&id);
                }
                self.state.start(out);
            }
            SocketEvent::ReasoningDelta(text) => self.state.thinking(&text, out),
            SocketEvent::TextDelta(text) => self.state.text(&text, out),
            SocketEvent::ToolCallStart { id, name } => self.state.tool_start(&id, &name, out),
            SocketEvent::ToolCallDelta { id, arguments } => {
                self.state.tool_delta(id.as_deref(), &arguments, out);
            }
            SocketEvent::ToolCallEnd { id } => self.state.tool_done(id.as_deref(), out),
            SocketEvent::Usage {
                input_tokens,
                output_tokens,
            } => self.state.record_usage(input_tokens, output_tokens),
            SocketEvent::MessageEnd { stop_reason, usage } => {
                if let Some(usage) = usage {
                    self.state.record_usage(
                        usage.get("input_tokens").and_then(Value::as_u64),
                        usage.get("output_tokens").and_then(Value::as_u64),
                    );
                }
                self.state.finish(stop_reason.as_deref(), out);
            }
            SocketEvent::Error { code, message } => {
                return Err(UpstreamFailure::new(classify_error_code(&code, &message), message)
                    .with_error_type(Some(code)));
            }
            SocketEvent::Ping => {}
            SocketEvent::Unknown(kind) => tracing::trace!(kind = %kind, "socket: ignoring message"),
        }
        Ok(())
    }

    fn on_end(&mut self, _out: &mut EventBatch) -> Result<(), UpstreamFailure> {
        Err(UpstreamFailure::transient(
            "socket closed before message.end",
        ))
    }

    fn is_finished(&self) -> bool {
        self.state.is_finished()
    }
}

struct SocketSource {
    ws: WsStream,
    done: bool,
}

/// Decoded JSON messages of one socket, answering pings on the way.
///
/// After a terminal message the close frame is sent before the message is
/// yielded, and the source ends.
fn socket_messages(ws: WsStream) -> impl Stream<Item = Result<Value, UpstreamFailure>> + Send + 'static {
    futures_util::stream::unfold(SocketSource { ws, done: false }, |mut src| async move {
        if src.done {
            return None;
        }
        loop {
            let frame = match src.ws.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => {
                    src.done = true;
                    return Some((Err(failure_from_ws_error(err)), src));
                }
                None => return None,
            };
            let text = match frame {
                Message::Text(text) => text,
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        tracing::debug!("socket: dropping non-UTF-8 binary frame");
                        continue;
                    }
                },
                Message::Ping(payload) => {
                    if let Err(err) = src.ws.send(Message::Pong(payload)).await {
                        src.done = true;
                        return Some((Err(failure_from_ws_error(err)), src));
                    }
                    continue;
                }
                Message::Close(_) => return None,
                Message::Pong(_) | Message::Frame(_) => continue,
            };
            let value = match serde_json::from_str::<Value>(&text) {
                Ok(value) => value,
                Err(err) => {
                    tracing::debug!(error = %err, "socket: undecodable message");
                    continue;
                }
            };
            if matches!(SocketEvent::parse(&value), SocketEvent::Ping) {
                if let Err(err) = src.ws.send(Message::Text(json!({"type": "pong"}).to_string())).await {
                    src.done = true;
                    return Some((Err(failure_from_ws_error(err)), src));
                }
                continue;
            }
            if SocketEvent::is_terminal(&value) {
                if let Err(err) = src.ws.send(Message::Close(None)).await {
                    tracing::debug!(error = %err, "socket: close frame not sent");
                }
                src.done = true;
            }
            return Some((Ok(value), src));
        }
    })
}

/// Adapter for the socket backend.
pub struct SocketAdapter {
    name: String,
    base_url: String,
    tool_name_limit: usize,
    connect_timeout: Duration,
    idle_timeout: Duration,
}

impl SocketAdapter {
    #[must_use]
    pub fn new(config: &BackendConfig, connect_timeout: Duration, idle_timeout: Duration) -> Self {
        Self {
            name: config.name.clone(),
            base_url: config.base_url.clone(),
            tool_name_limit: config.tool_name_limit,
            connect_timeout,
            idle_timeout,
        }
    }

    /// Open one attempt.
    ///
    /// # Errors
    ///
    /// Returns a classified [`UpstreamFailure`] when the handshake fails or the
    /// request cannot be sent.
    pub async fn open(
        &self,
        credential: &Credential,
        request: &UnifiedRequest,
        session_id: &str,
    ) -> Result<CanonicalStream, UpstreamFailure> {
        let prepared = PreparedRequest::new(request, self.tool_name_limit);
        let payload = build_request_message(request, &prepared.names, session_id);
        let headers = bearer_headers(credential)?;

        tracing::debug!(backend = %self.name, "opening socket upstream");
        let mut ws = connect_socket(&self.base_url, &headers, self.connect_timeout).await?;
        ws.send(Message::Text(payload.to_string()))
            .await
            .map_err(failure_from_ws_error)?;

        let source = IdleTimeout::new(socket_messages(ws), self.idle_timeout);
        let mapper = SocketMapper {
            state: prepared.into_state(&request.model),
        };
        Ok(drive(source, mapper))
    }
}

/// Build the single `chat.request` message.
#[must_use]
pub fn build_request_message(request: &UnifiedRequest, names: &ToolNameMap, session_id: &str) -> Value {
    let mut messages = serde_json::to_value(&request.messages).unwrap_or_else(|_| json!([]));
    if !names.is_identity() {
        rename_tool_uses(&mut messages, names);
    }
    let tools: Vec<Value> = request
        .tools
        .iter()
        .map(|tool| {
            json!({
                "name": names.upstream_name(&tool.name),
                "description": tool.description,
                "input_schema": tool.schema,
            })
        })
        .collect();

    let mut message = json!({
        "type": "chat.request",
        "session_id": session_id,
        "model": request.model,
        "messages": messages,
    });
    if let Some(system) = request.system.as_deref().filter(|s| !s.is_empty()) {
        message["system"] = json!(system);
    }
    if !tools.is_empty() {
        message["tools"] = Value::Array(tools);
    }
    if let Some(choice) = &request.tool_choice {
        message["tool_choice"] = choice.clone();
    }
    if let Some(max_tokens) = request.max_tokens {
        message["max_tokens"] = json!(max_tokens);
    }
    message
}

fn rename_tool_uses(messages: &mut Value, names: &ToolNameMap) {
    let Some(messages) = messages.as_array_mut() else {
        return;
    };
    for message in messages {
        let Some(parts) = message.get_mut("content").and_then(Value::as_array_mut) else {
            continue;
        };
        for part in parts {
            if part.get("type").and_then(Value::as_str) != Some("tool_use") {
                continue;
            }
            let upstream = part
                .get("name")
                .and_then(Value::as_str)
                .map(|name| names.upstream_name(name).to_string());
            if let Some(upstream) = upstream {
                part["name"] = json!(upstream);
            }
        }
    }
}
