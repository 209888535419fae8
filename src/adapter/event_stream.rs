//! Event-stream backend: a chunked HTTP body carrying JSON records inside a
//! binary framing with no usable length prefix.
//!
//! Records are recovered by [`FragmentReassembler`] and classified into
//! [`NativeEvent`]s. The end of the body is the completion signal.

use bytes::Bytes;
use serde_json::{json, Map, Value};
use smallvec::SmallVec;

use crate::config::BackendConfig;
use crate::credentials::Credential;
use crate::error::UpstreamFailure;
use crate::protocol::canonical::EventBatch;
use crate::protocol::request::{Content, Message, Part, Role, UnifiedRequest};
use crate::protocol::tool_names::ToolNameMap;
use crate::stream::{FragmentReassembler, IdleTimeout};
use crate::transport::{body_stream, HttpTransport};

use super::{bearer_headers, drive, insert_header, join_url, CanonicalStream, EventMapper, PreparedRequest, StreamState};

/// Leading tokens of every record this upstream emits.
pub const RECORD_PATTERNS: &[&str] = &[
    "{\"content\":",
    "{\"name\":",
    "{\"toolUseId\":",
    "{\"input\":",
    "{\"stop\":",
    "{\"followupPrompt\":",
    "{\"usage\":",
    "{\"contextUsagePercentage\":",
    "{\"reasoningText\":",
];

const ENDPOINT_PATH: &str = "generateAssistantResponse";
const PLACEHOLDER_TEXT: &str = "(empty)";
const CONTINUE_TEXT: &str = "Continue";

/// One classified upstream record.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeEvent {
    Text(String),
    Reasoning(String),
    ToolStart {
        id: String,
        name: String,
    },
    ToolInput {
        id: Option<String>,
        fragment: String,
    },
    ToolStop {
        id: Option<String>,
    },
    Usage {
        input_tokens: Option<u64>,
        output_tokens: Option<u64>,
    },
    ContextUsage(f64),
    FollowUp,
    Unknown,
}

/// A record can carry several signals at once (tool name, input and stop).
pub type NativeBatch = SmallVec<[NativeEvent; 2]>;

/// Classify one reassembled record.
#[must_use]
pub fn classify(record: &Value) -> NativeBatch {
    let mut out = NativeBatch::new();

    if let Some(usage) = record.get("usage") {
        let field = |a: &str, b: &str| usage.get(a).or_else(|| usage.get(b)).and_then(Value::as_u64);
        out.push(NativeEvent::Usage {
            input_tokens: field("inputTokens", "input_tokens"),
            output_tokens: field("outputTokens", "output_tokens"),
        });
        return out;
    }

    if let Some(pct) = record.get("contextUsagePercentage").and_then(Value::as_f64) {
        out.push(NativeEvent::ContextUsage(pct));
        return out;
    }

    let tool_id = record.get("toolUseId").and_then(Value::as_str);
    let name = record.get("name").and_then(Value::as_str);
    let input = record.get("input");
    let stop = record.get("stop").and_then(Value::as_bool).unwrap_or(false);

    if let (Some(id), Some(name)) = (tool_id, name) {
        out.push(NativeEvent::ToolStart {
            id: id.to_string(),
            name: name.to_string(),
        });
    }
    if let Some(input) = input {
        let fragment = match input {
            Value::String(text) => text.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        out.push(NativeEvent::ToolInput {
            id: tool_id.map(ToString::to_string),
            fragment,
        });
    }
    if stop {
        out.push(NativeEvent::ToolStop {
            id: tool_id.map(ToString::to_string),
        });
    }
    if !out.is_empty() {
        return out;
    }

    if let Some(text) = reasoning_text(record) {
        out.push(NativeEvent::Reasoning(text.to_string()));
    } else if let Some(text) = record.get("content").and_then(Value::as_str) {
        out.push(NativeEvent::Text(text.to_string()));
    } else if record.get("followupPrompt").is_some() {
        out.push(NativeEvent::FollowUp);
    } else {
        out.push(NativeEvent::Unknown);
    }
    out
}

fn reasoning_text(record: &Value) -> Option<&str> {
    let reasoning = record.get("reasoningText")?;
    reasoning
        .as_str()
        .or_else(|| reasoning.get("text").and_then(Value::as_str))
}

pub(crate) struct EventStreamMapper {
    reassembler: FragmentReassembler,
    state: StreamState,
    context_window: u64,
    context_usage_pct: Option<f64>,
    records: Vec<Value>,
}

impl EventStreamMapper {
    pub(crate) fn new(state: StreamState, context_window: u64) -> Self {
        Self {
            reassembler: FragmentReassembler::new(RECORD_PATTERNS),
            state: state.with_duplicate_suppression(),
            context_window,
            context_usage_pct: None,
            records: Vec::with_capacity(8),
        }
    }

    fn apply(&mut self, event: NativeEvent, out: &mut EventBatch) {
        match event {
            NativeEvent::Text(text) => self.state.text(&text, out),
            NativeEvent::Reasoning(text) => self.state.thinking(&text, out),
            NativeEvent::ToolStart { id, name } => self.state.tool_start(&id, &name, out),
            NativeEvent::ToolInput { id, fragment } => {
                self.state.tool_delta(id.as_deref(), &fragment, out);
            }
            NativeEvent::ToolStop { id } => self.state.tool_done(id.as_deref(), out),
            NativeEvent::Usage {
                input_tokens,
                output_tokens,
            } => self.state.record_usage(input_tokens, output_tokens),
            NativeEvent::ContextUsage(pct) => self.context_usage_pct = Some(pct),
            NativeEvent::FollowUp => tracing::trace!("ignoring follow-up prompt record"),
            NativeEvent::Unknown => tracing::trace!("ignoring unrecognised record"),
        }
    }

    fn drain_records(&mut self, out: &mut EventBatch) {
        let records = std::mem::take(&mut self.records);
        for record in &records {
            for event in classify(record) {
                self.apply(event, out);
            }
        }
        self.records = records;
        self.records.clear();
    }
}

impl EventMapper for EventStreamMapper {
    type Raw = Bytes;

    fn on_raw(&mut self, raw: Bytes, out: &mut EventBatch) -> Result<(), UpstreamFailure> {
        self.reassembler.feed_into(&raw, &mut self.records);
        self.drain_records(out);
        Ok(())
    }

    fn on_end(&mut self, out: &mut EventBatch) -> Result<(), UpstreamFailure> {
        self.records.extend(self.reassembler.finish());
        self.drain_records(out);
        if self.state.usage().input_tokens == 0 {
            if let Some(pct) = self.context_usage_pct {
                let estimated = (pct / 100.0 * self.context_window as f64).round();
                if estimated.is_finite() && estimated > 0.0 {
                    self.state.record_usage(Some(estimated as u64), None);
                }
            }
        }
        self.state.finish(None, out);
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.state.is_finished()
    }
}

/// Adapter for the event-stream backend.
pub struct EventStreamAdapter {
    name: String,
    url: String,
    tool_name_limit: usize,
    context_window: u64,
    transport: HttpTransport,
}

impl EventStreamAdapter {
    #[must_use]
    pub fn new(config: &BackendConfig, transport: HttpTransport) -> Self {
        Self {
            name: config.name.clone(),
            url: join_url(&config.base_url, ENDPOINT_PATH),
            tool_name_limit: config.tool_name_limit,
            context_window: config.context_window,
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
        insert_header(&mut headers, "x-amzn-codewhisperer-optout", "true");
        insert_header(
            &mut headers,
            "amz-sdk-invocation-id",
            &uuid::Uuid::new_v4().to_string(),
        );

        tracing::debug!(backend = %self.name, bytes = body.len(), "opening event-stream upstream");
        let response = self
            .transport
            .post_stream(&self.url, headers, Bytes::from(body))
            .await?;

        let source = IdleTimeout::new(body_stream(response), self.transport.idle_timeout());
        let mapper = EventStreamMapper::new(prepared.into_state(&request.model), self.context_window);
        Ok(drive(source, mapper))
    }
}

struct Turn {
    role: Role,
    text: String,
    tool_uses: Vec<Value>,
    tool_results: Vec<Value>,
    images: Vec<Value>,
}

impl Turn {
    fn placeholder(role: Role, text: &str) -> Self {
        Self {
            role,
            text: text.to_string(),
            tool_uses: Vec::new(),
            tool_results: Vec::new(),
            images: Vec::new(),
        }
    }

    fn from_message(message: &Message, names: &ToolNameMap) -> Self {
        let mut turn = Self::placeholder(message.role, "");
        match &message.content {
            Content::Text(text) => turn.text.clone_from(text),
            Content::Parts(parts) => {
                let mut texts: Vec<&str> = Vec::new();
                for part in parts {
                    match part {
                        Part::Text { text } => texts.push(text),
                        Part::ToolUse { id, name, input } => turn.tool_uses.push(json!({
                            "toolUseId": id,
                            "name": names.upstream_name(name),
                            "input": input,
                        })),
                        Part::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        } => turn.tool_results.push(json!({
                            "toolUseId": tool_use_id,
                            "content": [{"text": content}],
                            "status": if *is_error { "error" } else { "success" },
                        })),
                        Part::Image { media_type, data } => turn.images.push(json!({
                            "format": media_type.rsplit('/').next().unwrap_or(media_type),
                            "source": {"bytes": data},
                        })),
                    }
                }
                turn.text = texts.join("\n");
            }
        }
        turn
    }

    fn user_message(&self, model: &str, fallback: &str) -> Value {
        let content = if self.text.is_empty() { fallback } else { self.text.as_str() };
        let mut message = json!({
            "content": content,
            "modelId": model,
            "origin": "AI_EDITOR",
        });
        if !self.images.is_empty() {
            message["images"] = json!(self.images);
        }
        if !self.tool_results.is_empty() {
            message["userInputMessageContext"] = json!({"toolResults": self.tool_results});
        }
        json!({"userInputMessage": message})
    }

    fn assistant_message(&self) -> Value {
        let content = if self.text.is_empty() { PLACEHOLDER_TEXT } else { self.text.as_str() };
        let mut message = json!({"content": content});
        if !self.tool_uses.is_empty() {
            message["toolUses"] = json!(self.tool_uses);
        }
        json!({"assistantResponseMessage": message})
    }
}

/// Build the conversation-state request body.
///
/// History alternates user/assistant starting with user; the last user turn
/// becomes the current message and carries the tool specifications.
#[must_use]
pub fn build_payload(request: &UnifiedRequest, names: &ToolNameMap, conversation_id: &str) -> Value {
    let model = request.model.as_str();
    let mut turns: Vec<Turn> = Vec::with_capacity(request.messages.len() + 2);
    for message in &request.messages {
        if message.role == Role::System {
            continue;
        }
        let turn = Turn::from_message(message, names);
        if let Some(last) = turns.last() {
            if last.role == turn.role {
                let filler = if turn.role == Role::User { Role::Assistant } else { Role::User };
                turns.push(Turn::placeholder(filler, PLACEHOLDER_TEXT));
            }
        } else if turn.role != Role::User {
            turns.push(Turn::placeholder(Role::User, PLACEHOLDER_TEXT));
        }
        turns.push(turn);
    }
    if turns.last().map_or(true, |turn| turn.role == Role::Assistant) {
        turns.push(Turn::placeholder(Role::User, CONTINUE_TEXT));
    }

    if let Some(system) = request.system.as_deref().filter(|s| !s.trim().is_empty()) {
        if let Some(first) = turns.first_mut() {
            first.text = if first.text.is_empty() {
                system.to_string()
            } else {
                format!("{system}\n\n{}", first.text)
            };
        }
    }

    let current = turns.pop().unwrap_or_else(|| Turn::placeholder(Role::User, CONTINUE_TEXT));
    let history: Vec<Value> = turns
        .iter()
        .map(|turn| match turn.role {
            Role::Assistant => turn.assistant_message(),
            Role::User | Role::System => turn.user_message(model, PLACEHOLDER_TEXT),
        })
        .collect();

    let mut current_message = current.user_message(model, CONTINUE_TEXT);
    let specs = tool_specifications(request, names);
    if !specs.is_empty() {
        let user_input = &mut current_message["userInputMessage"];
        if user_input.get("userInputMessageContext").is_none() {
            user_input["userInputMessageContext"] = Value::Object(Map::new());
        }
        user_input["userInputMessageContext"]["tools"] = Value::Array(specs);
    }

    let mut state = json!({
        "chatTriggerType": "MANUAL",
        "conversationId": conversation_id,
        "currentMessage": current_message,
    });
    if !history.is_empty() {
        state["history"] = Value::Array(history);
    }
    json!({"conversationState": state})
}

fn tool_specifications(request: &UnifiedRequest, names: &ToolNameMap) -> Vec<Value> {
    request
        .tools
        .iter()
        .map(|tool| {
            let name = names.upstream_name(&tool.name);
            let description = if tool.description.trim().is_empty() {
                format!("Tool: {name}")
            } else {
                tool.description.clone()
            };
            json!({
                "toolSpecification": {
                    "name": name,
                    "description": description,
                    "inputSchema": {"json": tool.schema},
                }
            })
        })
        .collect()
}
