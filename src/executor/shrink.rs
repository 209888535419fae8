//! Staged compression of an oversized request.
//!
//! Every level is applied to the original request, never to the output of a
//! previous level.

use rustc_hash::FxHashSet;

use crate::protocol::request::{merge_adjacent_messages, Content, Message, Part, Role, UnifiedRequest};
use crate::util::truncate_chars;

pub const SHRINK_LEVELS: usize = 4;

const TRUNCATION_MARKER: &str = "\n[truncated]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShrinkLevel {
    /// `(head, tail)` messages kept; `None` keeps everything.
    pub keep: Option<(usize, usize)>,
    pub max_message_chars: Option<usize>,
    pub max_tool_result_chars: Option<usize>,
    pub max_tool_description_chars: Option<usize>,
}

const LADDER: [ShrinkLevel; SHRINK_LEVELS] = [
    ShrinkLevel {
        keep: None,
        max_message_chars: None,
        max_tool_result_chars: Some(8_000),
        max_tool_description_chars: None,
    },
    ShrinkLevel {
        keep: None,
        max_message_chars: Some(6_000),
        max_tool_result_chars: Some(4_000),
        max_tool_description_chars: Some(3_000),
    },
    ShrinkLevel {
        keep: Some((2, 20)),
        max_message_chars: Some(4_000),
        max_tool_result_chars: Some(2_000),
        max_tool_description_chars: Some(1_000),
    },
    ShrinkLevel {
        keep: Some((1, 6)),
        max_message_chars: Some(2_000),
        max_tool_result_chars: Some(1_000),
        max_tool_description_chars: Some(500),
    },
];

/// Parameters of a 1-based level; out-of-range levels clamp to the last.
#[must_use]
pub fn level(level: usize) -> ShrinkLevel {
    LADDER[level.clamp(1, SHRINK_LEVELS) - 1]
}

/// Compress `original` to `level` (1-based).
#[must_use]
pub fn shrink(original: &UnifiedRequest, level_no: usize) -> UnifiedRequest {
    let params = level(level_no);
    let mut request = original.clone();

    if let Some((head, tail)) = params.keep {
        request.messages = keep_head_and_tail(std::mem::take(&mut request.messages), head, tail);
    }
    convert_orphan_tool_results(&mut request.messages);

    for message in &mut request.messages {
        truncate_content(&mut message.content, params);
    }
    if let Some(cap) = params.max_tool_description_chars {
        for tool in &mut request.tools {
            cap_in_place(&mut tool.description, cap);
        }
    }
    request.messages = merge_adjacent_messages(std::mem::take(&mut request.messages));

    tracing::debug!(
        level = level_no,
        messages_before = original.messages.len(),
        messages_after = request.messages.len(),
        "request compressed"
    );
    request
}

fn keep_head_and_tail(messages: Vec<Message>, head: usize, tail: usize) -> Vec<Message> {
    if messages.len() <= head + tail {
        return messages;
    }
    let omitted = messages.len() - head - tail;
    let mut kept = Vec::with_capacity(head + tail + 1);
    let mut iter = messages.into_iter();
    kept.extend(iter.by_ref().take(head));
    let note_role = match kept.last().map(|m| m.role) {
        Some(Role::User) => Role::Assistant,
        _ => Role::User,
    };
    kept.push(Message {
        role: note_role,
        content: Content::Text(format!(
            "[{omitted} earlier messages were omitted to fit the context window]"
        )),
    });
    kept.extend(iter.skip(omitted));
    kept
}

fn convert_orphan_tool_results(messages: &mut [Message]) {
    let known: FxHashSet<String> = messages
        .iter()
        .flat_map(|m| m.content.parts())
        .filter_map(|part| match part {
            Part::ToolUse { id, .. } => Some(id.clone()),
            _ => None,
        })
        .collect();
    for message in messages {
        let Content::Parts(parts) = &mut message.content else {
            continue;
        };
        for part in parts.iter_mut() {
            let Part::ToolResult {
                tool_use_id,
                content,
                ..
            } = part
            else {
                continue;
            };
            if known.contains(tool_use_id.as_str()) {
                continue;
            }
            let text = format!("[result of tool call {tool_use_id}]\n{content}");
            *part = Part::Text { text };
        }
    }
}

fn truncate_content(content: &mut Content, params: ShrinkLevel) {
    match content {
        Content::Text(text) => {
            if let Some(cap) = params.max_message_chars {
                cap_in_place(text, cap);
            }
        }
        Content::Parts(parts) => {
            for part in parts {
                match part {
                    Part::Text { text } => {
                        if let Some(cap) = params.max_message_chars {
                            cap_in_place(text, cap);
                        }
                    }
                    Part::ToolResult { content, .. } => {
                        if let Some(cap) = params.max_tool_result_chars {
                            cap_in_place(content, cap);
                        }
                    }
                    Part::Image { .. } | Part::ToolUse { .. } => {}
                }
            }
        }
    }
}

fn cap_in_place(text: &mut String, max_chars: usize) {
    let kept = truncate_chars(text, max_chars).len();
    if kept < text.len() {
        text.truncate(kept);
        text.push_str(TRUNCATION_MARKER);
    }
}
