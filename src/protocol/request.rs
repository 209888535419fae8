use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One typed content part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default, deserialize_with = "text_or_parts")]
        content: String,
        #[serde(default)]
        is_error: bool,
    },
    Image {
        media_type: String,
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default = "empty_object")]
        input: Value,
    },
}

impl Part {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }
}

/// Message content: plain text or a list of typed parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<Part>),
}

impl Content {
    /// Concatenated text of all text parts.
    #[must_use]
    pub fn joined_text(&self) -> String {
        match self {
            Content::Text(text) => text.clone(),
            Content::Parts(parts) => {
                let mut out = String::new();
                for part in parts {
                    if let Part::Text { text } = part {
                        if !out.is_empty() {
                            out.push('\n');
                        }
                        out.push_str(text);
                    }
                }
                out
            }
        }
    }

    #[must_use]
    pub fn into_parts(self) -> Vec<Part> {
        match self {
            Content::Text(text) if text.is_empty() => Vec::new(),
            Content::Text(text) => vec![Part::Text { text }],
            Content::Parts(parts) => parts,
        }
    }

    #[must_use]
    pub fn parts(&self) -> &[Part] {
        match self {
            Content::Text(_) => &[],
            Content::Parts(parts) => parts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Content,
}

impl Message {
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Content::Text(text.into()),
        }
    }

    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Content::Text(text.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object", alias = "input_schema", alias = "parameters")]
    pub schema: Value,
}

/// The single request shape accepted by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    /// Logical end user, used for upstream cache affinity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default = "default_stream")]
    pub stream: bool,
}

fn default_stream() -> bool {
    true
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

fn text_or_parts<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(text) => text,
        Value::Null => String::new(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                item.as_str()
                    .or_else(|| item.get("text").and_then(Value::as_str))
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    })
}

impl UnifiedRequest {
    /// Reject requests no backend could serve.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] on an empty model or a
    /// conversation with no user or assistant turn (system messages are
    /// hoisted out by [`normalize`](Self::normalize)).
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.model.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("model is required".into()));
        }
        if self.messages.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "messages must not be empty".into(),
            ));
        }
        if self.messages.iter().all(|message| message.role == Role::System) {
            return Err(GatewayError::InvalidRequest(
                "messages must contain at least one user or assistant message".into(),
            ));
        }
        if let Some(tool) = self.tools.iter().find(|tool| tool.name.trim().is_empty()) {
            return Err(GatewayError::InvalidRequest(format!(
                "tool name must not be empty (description: '{}')",
                tool.description
            )));
        }
        Ok(())
    }

    /// Hoist system messages into `system` and optionally merge same-role runs.
    pub fn normalize(&mut self, merge_adjacent: bool) {
        let mut system_parts: Vec<String> = self.system.take().into_iter().collect();
        let mut conversation = Vec::with_capacity(self.messages.len());
        for message in std::mem::take(&mut self.messages) {
            if message.role == Role::System {
                system_parts.push(message.content.joined_text());
            } else {
                conversation.push(message);
            }
        }
        system_parts.retain(|s| !s.trim().is_empty());
        self.system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n"))
        };
        self.messages = if merge_adjacent {
            merge_adjacent_messages(conversation)
        } else {
            conversation
        };
    }

    /// Names of all declared tools.
    pub fn tool_names(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().map(|tool| tool.name.as_str())
    }
}

/// Merge runs of same-role messages.
///
/// Two plain texts are joined with a newline; otherwise the part lists are
/// concatenated.
#[must_use]
pub fn merge_adjacent_messages(messages: Vec<Message>) -> Vec<Message> {
    let mut merged: Vec<Message> = Vec::with_capacity(messages.len());
    for message in messages {
        let Some(last) = merged.last_mut() else {
            merged.push(message);
            continue;
        };
        if last.role != message.role {
            merged.push(message);
            continue;
        }
        let previous = std::mem::replace(&mut last.content, Content::Text(String::new()));
        last.content = match (previous, message.content) {
            (Content::Text(a), Content::Text(b)) => Content::Text(format!("{a}\n{b}")),
            (a, b) => {
                let mut parts = a.into_parts();
                parts.extend(b.into_parts());
                Content::Parts(parts)
            }
        };
    }
    merged
}
