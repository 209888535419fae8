//! Typed-SSE backend: OpenAI Responses-style `response.*` events.

use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{json, Value};

use crate::config::BackendConfig;
use crate::credentials::Credential;
use crate::error::{classify_error_code, UpstreamFailure};
use crate::protocol::canonical::EventBatch;
use crate::protocol::request::{Content, Part, Role, UnifiedRequest};
use crate::protocol::tool_names::ToolNameMap;
use crate::stream::sse::is_done_event;
use crate::stream::{sse_frame_stream, IdleTimeout, SseEvent};
use crate::transport::{body_stream, HttpTransport};

use super::{bearer_headers, drive, insert_header, join_url, CanonicalStream, EventMapper, PreparedRequest, StreamState};

const ENDPOINT_PATH: &str = "responses";

/// One decoded `response.*` event.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsesEvent {
    Created {
        response_id: Option<String>,
    },
    ItemAdded(Value),
    ItemDone(Value),
    TextDelta(String),
    ReasoningDelta(String),
    ArgumentsDelta {
        item_id: String,
        delta: String,
    },
    ArgumentsDone {
        item_id: String,
        arguments: Option<String>,
    },
    Completed {
        usage: Option<Value>,
    },
    Incomplete {
        reason: Option<String>,
        usage: Option<Value>,
    },
    Failed {
        code: String,
        message: String,
    },
    Ignored,
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

impl ResponsesEvent {
    /// Decode one SSE frame. The frame's `type` field wins over the `event:` line.
    #[must_use]
    pub fn parse(frame: &SseEvent) -> Self {
        if frame.data.trim().is_empty() || is_done_event(frame) {
            return ResponsesEvent::Ignored;
        }
        let Ok(data) = serde_json::from_str::<Value>(&frame.data) else {
            tracing::debug!(bytes = frame.data.len(), "typed-sse: undecodable frame");
            return ResponsesEvent::Ignored;
        };
        let kind = data
            .get("type")
            .and_then(Value::as_str)
            .or(frame.event.as_deref())
            .unwrap_or_default();
        let text = |key: &str| data.get(key).and_then(Value::as_str).unwrap_or_default().to_string();

        match kind {
            "response.created" => ResponsesEvent::Created {
                response_id: str_at(&data, "/response/id").map(ToString::to_string),
            },
            "response.output_item.added" => {
                ResponsesEvent::ItemAdded(data.get("item").cloned().unwrap_or(Value::Null))
            }
            "response.output_item.done" => {
                ResponsesEvent::ItemDone(data.get("item").cloned().unwrap_or(Value::Null))
            }
            "response.output_text.delta" => ResponsesEvent::TextDelta(text("delta")),
            "response.reasoning_summary_text.delta" | "response.reasoning_text.delta" => {
                ResponsesEvent::ReasoningDelta(text("delta"))
            }
            "response.function_call_arguments.delta" => ResponsesEvent::ArgumentsDelta {
                item_id: text("item_id"),
                delta: text("delta"),
            },
            "response.function_call_arguments.done" => ResponsesEvent::ArgumentsDone {
                item_id: text("item_id"),
                arguments: data
                    .get("arguments")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
            },
            "response.completed" => ResponsesEvent::Completed {
                usage: data.pointer("/response/usage").cloned(),
            },
            "response.incomplete" => ResponsesEvent::Incomplete {
                reason: str_at(&data, "/response/incomplete_details/reason").map(ToString::to_string),
                usage: data.pointer("/response/usage").cloned(),
            },
            "response.failed" => {
                let error = data.pointer("/response/error").unwrap_or(&Value::Null);
                ResponsesEvent::Failed {
                    code: str_at(error, "/code").unwrap_or("response_failed").to_string(),
                    message: str_at(error, "/message")
                        .unwrap_or("upstream reported response.failed")
                        .to_string(),
                }
            }
            "error" => {
                let error = data.get("error").unwrap_or(&data);
                ResponsesEvent::Failed {
                    code: str_at(error, "/code")
                        .or_else(|| str_at(error, "/type"))
                        .unwrap_or("error")
                        .to_string(),
                    message: str_at(error, "/message").unwrap_or("upstream error").to_string(),
                }
            }
            _ => ResponsesEvent::Ignored,
        }
    }
}

pub(crate) struct TypedSseMapper {
    state: StreamState,
    /// Output item id to function call id.
    call_ids: FxHashMap<String, String>,
    /// Calls that already received argument fragments.
    args_seen: FxHashSet<String>,
    text_seen: bool,
}

impl TypedSseMapper {
    pub(crate) fn new(state: StreamState) -> Self {
        Self {
            state,
            call_ids: FxHashMap::default(),
            args_seen: FxHashSet::default(),
            text_seen: false,
        }
    }

    fn call_id_for(&self, item_id: &str) -> String {
        self.call_ids
            .get(item_id)
            .cloned()
            .unwrap_or_else(|| item_id.to_string())
    }

    fn record_usage(&mut self, usage: Option<&Value>) {
        if let Some(usage) = usage {
            self.state.record_usage(
                usage.get("input_tokens").and_then(Value::as_u64),
                usage.get("output_tokens").and_then(Value::as_u64),
            );
        }
    }

    fn on_item_added(&mut self, item: &Value, out: &mut EventBatch) {
        if item.get("type").and_then(Value::as_str) != Some("function_call") {
            return;
        }
        let item_id = item.get("id").and_then(Value::as_str).unwrap_or_default();
        let call_id = item
            .get("call_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .unwrap_or(item_id)
            .to_string();
        let name = item.get("name").and_then(Value::as_str).unwrap_or_default();
        if !item_id.is_empty() {
            self.call_ids.insert(item_id.to_string(), call_id.clone());
        }
        self.state.tool_start(&call_id, name, out);
        if let Some(arguments) = item.get("arguments").and_then(Value::as_str).filter(|a| !a.is_empty()) {
            self.args_seen.insert(call_id.clone());
            self.state.tool_delta(Some(&call_id), arguments, out);
        }
    }

    fn on_item_done(&mut self, item: &Value, out: &mut EventBatch) {
        match item.get("type").and_then(Value::as_str) {
            Some("function_call") => {
                let item_id = item.get("id").and_then(Value::as_str).unwrap_or_default();
                let call_id = item
                    .get("call_id")
                    .and_then(Value::as_str)
                    .map_or_else(|| self.call_id_for(item_id), ToString::to_string);
                if !self.args_seen.contains(&call_id) {
                    if let Some(arguments) = item.get("arguments").and_then(Value::as_str) {
                        self.args_seen.insert(call_id.clone());
                        self.state.tool_delta(Some(&call_id), arguments, out);
                    }
                }
                self.state.tool_done(Some(&call_id), out);
            }
            // Some upstreams only send the full message at the end.
            Some("message") if !self.text_seen => {
                let Some(parts) = item.get("content").and_then(Value::as_array) else {
                    return;
                };
                for part in parts {
                    if part.get("type").and_then(Value::as_str) == Some("output_text") {
                        if let Some(text) = part.get("text").and_then(Value::as_str).filter(|t| !t.is_empty()) {
                            self.text_seen = true;
                            self.state.text(text, out);
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

impl EventMapper for TypedSseMapper {
    type Raw = SseEvent;

    fn on_raw(&mut self, raw: SseEvent, out: &mut EventBatch) -> Result<(), UpstreamFailure> {
        match ResponsesEvent::parse(&raw) {
            ResponsesEvent::Created { response_id } => {
                if let Some(id) = response_id {
                    self.state.set_message_id(&id);
                }
            }
            ResponsesEvent::ItemAdded(item) => self.on_item_added(&item, out),
            ResponsesEvent::ItemDone(item) => self.on_item_done(&item, out),
            ResponsesEvent::TextDelta(delta) => {
                if !delta.is_empty() {
                    self.text_seen = true;
                    self.state.text(&delta, out);
                }
            }
            ResponsesEvent::ReasoningDelta(delta) => {
                if !delta.is_empty() {
                    self.state.thinking(&delta, out);
                }
            }
            ResponsesEvent::ArgumentsDelta { item_id, delta } => {
                let call_id = self.call_id_for(&item_id);
                self.args_seen.insert(call_id.clone());
                self.state.tool_delta(Some(&call_id), &delta, out);
            }
            ResponsesEvent::ArgumentsDone { item_id, arguments } => {
                let call_id = self.call_id_for(&item_id);
                if !self.args_seen.contains(&call_id) {
                    if let Some(arguments) = arguments {
                        self.args_seen.insert(call_id.clone());
                        self.state.tool_delta(Some(&call_id), &arguments, out);
                    }
                }
                self.state.tool_done(Some(&call_id), out);
            }
            ResponsesEvent::Completed { usage } => {
                self.record_usage(usage.as_ref());
                self.state.finish(None, out);
            }
            ResponsesEvent::Incomplete { reason, usage } => {
                self.record_usage(usage.as_ref());
                self.state.finish(Some(reason.as_deref().unwrap_or("incomplete")), out);
            }
            ResponsesEvent::Failed { code, message } => {
                return Err(UpstreamFailure::new(classify_error_code(&code, &message), message)
                    .with_error_type(Some(code)));
            }
            ResponsesEvent::Ignored => {}
        }
        Ok(())
    }

    fn on_end(&mut self, _out: &mut EventBatch) -> Result<(), UpstreamFailure> {
        Err(UpstreamFailure::transient(
            "typed-sse stream ended without response.completed",
        ))
    }

    fn is_finished(&self) -> bool {
        self.state.is_finished()
    }
}

/// Adapter for the typed-SSE backend.
pub struct TypedSseAdapter {
    name: String,
    url: String,
    tool_name_limit: usize,
    transport: HttpTransport,
}

impl TypedSseAdapter {
    #[must_use]
    pub fn new(config: &BackendConfig, transport: HttpTransport) -> Self {
        Self {
            name: config.name.clone(),
            url: join_url(&config.base_url, ENDPOINT_PATH),
            tool_name_limit: config.tool_name_limit,
            transport,
        }
    }

    /// Open one attempt.
    ///
    /// # Errors
    ///
    /// Returns a classified [`UpstreamFailure`] when the request is rejected.
    pub async fn open(
        &self,
        credential: &Credential,
        request: &UnifiedRequest,
        session_id: &str,
    ) -> Result<CanonicalStream, UpstreamFailure> {
        let prepared = PreparedRequest::new(request, self.tool_name_limit);
        let payload = build_payload(request, &prepared.names, session_id);
        let body = serde_json::to_vec(&payload)
            .map_err(|err| UpstreamFailure::fatal(format!("failed to encode request: {err}")))?;

        let mut headers = bearer_headers(credential)?;
        insert_header(&mut headers, "accept", "text/event-stream");
        insert_header(&mut headers, "session_id", session_id);

        tracing::debug!(backend = %self.name, bytes = body.len(), "opening typed-sse upstream");
        let response = self
            .transport
            .post_stream(&self.url, headers, Bytes::from(body))
            .await?;

        let source = sse_frame_stream(IdleTimeout::new(
            body_stream(response),
            self.transport.idle_timeout(),
        ));
        Ok(drive(source, TypedSseMapper::new(prepared.into_state(&request.model))))
    }
}

/// Build the `/responses` request body.
#[must_use]
pub fn build_payload(request: &UnifiedRequest, names: &ToolNameMap, session_id: &str) -> Value {
    let mut input: Vec<Value> = Vec::with_capacity(request.messages.len());
    for message in &request.messages {
        push_input_items(&mut input, message.role, &message.content, names);
    }

    let mut payload = json!({
        "model": request.model,
        "input": input,
        "stream": true,
        "store": false,
        "prompt_cache_key": session_id,
    });
    if let Some(system) = request.system.as_deref().filter(|s| !s.is_empty()) {
        payload["instructions"] = json!(system);
    }
    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "name": names.upstream_name(&tool.name),
                    "description": tool.description,
                    "parameters": tool.schema,
                    "strict": false,
                })
            })
            .collect();
        payload["tools"] = Value::Array(tools);
        if let Some(choice) = request.tool_choice.as_ref().and_then(|c| map_tool_choice(c, names)) {
            payload["tool_choice"] = choice;
        }
    }
    if let Some(max_tokens) = request.max_tokens {
        payload["max_output_tokens"] = json!(max_tokens);
    }
    payload
}

fn push_input_items(input: &mut Vec<Value>, role: Role, content: &Content, names: &ToolNameMap) {
    let role_name = match role {
        Role::System => "developer",
        Role::User => "user",
        Role::Assistant => "assistant",
    };
    let text_type = if role == Role::Assistant { "output_text" } else { "input_text" };

    let message = |parts: Vec<Value>| json!({"type": "message", "role": role_name, "content": parts});
    let mut pending: Vec<Value> = Vec::new();
    match content {
        Content::Text(text) => {
            if !text.is_empty() {
                pending.push(json!({"type": text_type, "text": text}));
            }
        }
        Content::Parts(parts) => {
            for part in parts {
                let item = match part {
                    Part::Text { text } => {
                        pending.push(json!({"type": text_type, "text": text}));
                        continue;
                    }
                    Part::Image { media_type, data } => {
                        pending.push(json!({
                            "type": "input_image",
                            "image_url": format!("data:{media_type};base64,{data}"),
                        }));
                        continue;
                    }
                    Part::ToolUse { id, name, input: arguments } => json!({
                        "type": "function_call",
                        "call_id": id,
                        "name": names.upstream_name(name),
                        "arguments": arguments.to_string(),
                    }),
                    Part::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => json!({
                        "type": "function_call_output",
                        "call_id": tool_use_id,
                        "output": content,
                    }),
                };
                // Text seen so far precedes the call in the conversation.
                if !pending.is_empty() {
                    input.push(message(std::mem::take(&mut pending)));
                }
                input.push(item);
            }
        }
    }
    if !pending.is_empty() {
        input.push(message(pending));
    }
}

fn map_tool_choice(choice: &Value, names: &ToolNameMap) -> Option<Value> {
    match choice {
        Value::String(mode) => match mode.as_str() {
            "auto" | "none" | "required" => Some(json!(mode)),
            "any" => Some(json!("required")),
            _ => None,
        },
        Value::Object(_) => {
            let name = str_at(choice, "/name").or_else(|| str_at(choice, "/function/name"));
            match (str_at(choice, "/type"), name) {
                (_, Some(name)) => Some(json!({"type": "function", "name": names.upstream_name(name)})),
                (Some("any"), None) => Some(json!("required")),
                (Some(mode @ ("auto" | "none")), None) => Some(json!(mode)),
                _ => None,
            }
        }
        _ => None,
    }
}
