use serde::Serialize;
use serde_json::Value;
use smallvec::SmallVec;

use crate::protocol::tool_call::{ToolArguments, ToolInvocation};

/// Content category of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Text,
    Thinking,
    ToolUse,
}

impl BlockKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            BlockKind::Text => "text",
            BlockKind::Thinking => "thinking",
            BlockKind::ToolUse => "tool_use",
        }
    }
}

/// Incremental content for an open block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delta {
    Text(String),
    Thinking(String),
    /// JSON text of the tool arguments.
    ToolInput(String),
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Other(String),
}

impl StopReason {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            StopReason::EndTurn => "end_turn",
            StopReason::ToolUse => "tool_use",
            StopReason::MaxTokens => "max_tokens",
            StopReason::Other(other) => other,
        }
    }

    /// Normalize an upstream finish/stop string.
    #[must_use]
    pub fn from_upstream(reason: &str) -> Self {
        match reason {
            "end_turn" | "stop" | "completed" | "stop_sequence" => StopReason::EndTurn,
            "tool_use" | "tool_calls" | "function_call" => StopReason::ToolUse,
            "max_tokens" | "length" | "max_output_tokens" => StopReason::MaxTokens,
            other => StopReason::Other(other.to_string()),
        }
    }
}

/// Token usage counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// The gateway's normalized output vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanonicalEvent {
    MessageStart {
        id: String,
        model: String,
    },
    BlockStart {
        index: usize,
        kind: BlockKind,
        tool_id: Option<String>,
        tool_name: Option<String>,
    },
    BlockDelta {
        index: usize,
        delta: Delta,
    },
    BlockStop {
        index: usize,
    },
    MessageDelta {
        stop_reason: StopReason,
        usage: Usage,
    },
    MessageStop,
}

impl CanonicalEvent {
    #[must_use]
    pub fn is_message_start(&self) -> bool {
        matches!(self, CanonicalEvent::MessageStart { .. })
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, CanonicalEvent::MessageStop)
    }
}

/// Events produced from one native event. Rarely more than a handful.
pub type EventBatch = SmallVec<[CanonicalEvent; 4]>;

/// A fully collected, non-streaming message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectedMessage {
    pub id: String,
    pub model: String,
    pub text: String,
    pub thinking: String,
    pub tool_invocations: Vec<ToolInvocation>,
    pub stop_reason: Option<StopReason>,
    pub usage: Usage,
}

impl CollectedMessage {
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut content = Vec::new();
        if !self.thinking.is_empty() {
            content.push(serde_json::json!({"type": "thinking", "thinking": self.thinking}));
        }
        if !self.text.is_empty() {
            content.push(serde_json::json!({"type": "text", "text": self.text}));
        }
        for call in &self.tool_invocations {
            content.push(serde_json::json!({
                "type": "tool_use",
                "id": call.call_id,
                "name": call.name,
                "input": call.arguments.to_value(),
            }));
        }
        serde_json::json!({
            "id": self.id,
            "model": self.model,
            "content": content,
            "stop_reason": self.stop_reason.as_ref().map(StopReason::as_str),
            "usage": self.usage,
        })
    }
}

/// Folds a canonical event sequence back into one message.
#[derive(Debug, Default)]
pub struct MessageAccumulator {
    message: CollectedMessage,
    open_tool: Option<(usize, String, String, String)>,
}

impl MessageAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: &CanonicalEvent) {
        match event {
            CanonicalEvent::MessageStart { id, model } => {
                self.message.id.clone_from(id);
                self.message.model.clone_from(model);
            }
            CanonicalEvent::BlockStart {
                index,
                kind: BlockKind::ToolUse,
                tool_id,
                tool_name,
            } => {
                self.open_tool = Some((
                    *index,
                    tool_id.clone().unwrap_or_default(),
                    tool_name.clone().unwrap_or_default(),
                    String::new(),
                ));
            }
            CanonicalEvent::BlockStart { .. } => {}
            CanonicalEvent::BlockDelta { index, delta } => match delta {
                Delta::Text(text) => self.message.text.push_str(text),
                Delta::Thinking(text) => self.message.thinking.push_str(text),
                Delta::ToolInput(fragment) => {
                    if let Some((open, _, _, json)) = self.open_tool.as_mut() {
                        if *open == *index {
                            json.push_str(fragment);
                        }
                    }
                }
            },
            CanonicalEvent::BlockStop { index } => {
                if self.open_tool.as_ref().is_some_and(|(open, ..)| open == index) {
                    if let Some((_, call_id, name, json)) = self.open_tool.take() {
                        let arguments = match serde_json::from_str::<Value>(&json) {
                            Ok(value) => ToolArguments::Parsed(value),
                            Err(_) if json.is_empty() => {
                                ToolArguments::Parsed(Value::Object(serde_json::Map::new()))
                            }
                            Err(_) => ToolArguments::Raw(json.clone()),
                        };
                        self.message.tool_invocations.push(ToolInvocation {
                            call_id,
                            name,
                            raw_fragments: vec![json],
                            arguments,
                        });
                    }
                }
            }
            CanonicalEvent::MessageDelta { stop_reason, usage } => {
                self.message.stop_reason = Some(stop_reason.clone());
                self.message.usage = *usage;
            }
            CanonicalEvent::MessageStop => {}
        }
    }

    #[must_use]
    pub fn finish(self) -> CollectedMessage {
        self.message
    }
}
