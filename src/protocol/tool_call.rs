//! Tool-call argument assembly.
//!
//! Upstreams deliver tool arguments as JSON text split into arbitrary fragments.
//! [`ToolCallAssembler`] concatenates them per call and finalizes each call exactly
//! once, falling back to [`repair`] and then to the raw text when the arguments
//! are not valid JSON.

use serde_json::Value;

use crate::util::next_call_id;

/// Final form of a call's arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolArguments {
    Parsed(Value),
    /// Valid only after [`repair`].
    Repaired(Value),
    /// Unstructured; neither the text nor its repair parsed.
    Raw(String),
}

impl ToolArguments {
    #[must_use]
    pub fn is_structured(&self) -> bool {
        !matches!(self, ToolArguments::Raw(_))
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            ToolArguments::Parsed(value) | ToolArguments::Repaired(value) => value.clone(),
            ToolArguments::Raw(raw) => Value::String(raw.clone()),
        }
    }

    /// JSON text for a `tool_input` delta. Raw arguments are passed through verbatim.
    #[must_use]
    pub fn to_json_text(&self) -> String {
        match self {
            ToolArguments::Parsed(value) | ToolArguments::Repaired(value) => value.to_string(),
            ToolArguments::Raw(raw) => raw.clone(),
        }
    }
}

/// One finalized tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub call_id: String,
    /// Original (unshortened) tool name.
    pub name: String,
    pub raw_fragments: Vec<String>,
    pub arguments: ToolArguments,
}

#[derive(Debug)]
struct OpenCall {
    call_id: String,
    name: String,
    fragments: Vec<String>,
}

impl OpenCall {
    fn new(call_id: &str, name: &str) -> Self {
        Self {
            call_id: call_id.to_string(),
            name: name.to_string(),
            fragments: Vec::new(),
        }
    }

    fn finalize(self) -> ToolInvocation {
        let joined = self.fragments.concat();
        let arguments = finalize_arguments(&self.call_id, &joined);
        ToolInvocation {
            call_id: self.call_id,
            name: self.name,
            raw_fragments: self.fragments,
            arguments,
        }
    }
}

/// Accumulates argument fragments for at most one open call.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    open: Option<OpenCall>,
}

impl ToolCallAssembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn open_call_id(&self) -> Option<&str> {
        self.open.as_ref().map(|call| call.call_id.as_str())
    }

    #[must_use]
    pub fn is_open(&self, call_id: &str) -> bool {
        self.open_call_id() == Some(call_id)
    }

    /// Start a call. A different call still open is finalized first and returned.
    pub fn on_start(&mut self, call_id: &str, name: &str) -> Option<ToolInvocation> {
        if let Some(open) = self.open.as_mut() {
            if open.call_id == call_id {
                if open.name.is_empty() {
                    open.name = name.to_string();
                }
                return None;
            }
        }
        let finished = self.finish_open();
        self.open = Some(OpenCall::new(call_id, name));
        finished
    }

    /// Append a fragment. `None` targets the open call.
    ///
    /// A fragment for a call that is not open implicitly starts it with an empty
    /// name; a previously open call is finalized and returned.
    pub fn on_delta(&mut self, call_id: Option<&str>, fragment: &str) -> Option<ToolInvocation> {
        let mut finished = None;
        let needs_start = match (call_id, self.open.as_ref()) {
            (None, Some(_)) => false,
            (Some(id), Some(open)) => open.call_id != id,
            (_, None) => true,
        };
        if needs_start {
            let id = call_id.map_or_else(next_call_id, ToString::to_string);
            tracing::debug!(call_id = %id, "tool argument fragment before start; starting implicitly");
            finished = self.on_start(&id, "");
        }
        if let Some(open) = self.open.as_mut() {
            if !fragment.is_empty() {
                open.fragments.push(fragment.to_string());
            }
        }
        finished
    }

    /// Finalize the open call. `None` or a matching id closes it.
    pub fn on_done(&mut self, call_id: Option<&str>) -> Option<ToolInvocation> {
        match (call_id, self.open.as_ref()) {
            (Some(id), Some(open)) if open.call_id != id => {
                tracing::debug!(call_id = id, open = %open.call_id, "done for a call that is not open");
                None
            }
            _ => self.finish_open(),
        }
    }

    /// Finalize whatever is still open.
    pub fn finish_open(&mut self) -> Option<ToolInvocation> {
        self.open.take().map(OpenCall::finalize)
    }
}

fn finalize_arguments(call_id: &str, raw: &str) -> ToolArguments {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return ToolArguments::Parsed(Value::Object(serde_json::Map::new()));
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return ToolArguments::Parsed(value);
    }
    if let Ok(value) = serde_json::from_str::<Value>(&repair(trimmed)) {
        tracing::debug!(call_id, "tool arguments parsed after repair");
        return ToolArguments::Repaired(value);
    }
    tracing::warn!(
        call_id,
        bytes = raw.len(),
        "tool arguments malformed; passing through as unstructured text"
    );
    ToolArguments::Raw(raw.to_string())
}

/// Best-effort repair of almost-JSON tool arguments.
///
/// Applied in order, each step only inside string literals:
/// 1. a backslash before a character that is not a JSON escape is doubled;
/// 2. a `\u` escape with fewer than four hex digits becomes literal text, or is
///    dropped when the input ends inside it;
/// 3. raw newline, carriage return and tab are escaped.
#[must_use]
pub fn repair(input: &str) -> String {
    let step1 = normalize_escapes(input);
    let step2 = complete_unicode_escapes(&step1);
    escape_bare_controls(&step2)
}

fn normalize_escapes(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 8);
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    while let Some(ch) = chars.next() {
        if !in_string {
            if ch == '"' {
                in_string = true;
            }
            out.push(ch);
            continue;
        }
        match ch {
            '"' => {
                in_string = false;
                out.push(ch);
            }
            '\\' => match chars.peek().copied() {
                Some(next)
                    if matches!(next, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') =>
                {
                    out.push('\\');
                    out.push(next);
                    chars.next();
                }
                _ => out.push_str("\\\\"),
            },
            _ => out.push(ch),
        }
    }
    out
}

fn complete_unicode_escapes(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 8);
    let chars: Vec<char> = input.chars().collect();
    let mut in_string = false;
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        if !in_string {
            if ch == '"' {
                in_string = true;
            }
            out.push(ch);
            i += 1;
            continue;
        }
        match ch {
            '"' => {
                in_string = false;
                out.push(ch);
                i += 1;
            }
            '\\' if chars.get(i + 1) == Some(&'u') => {
                let digits = chars[i + 2..]
                    .iter()
                    .take(4)
                    .take_while(|c| c.is_ascii_hexdigit())
                    .count();
                let end = i + 2 + digits;
                if digits == 4 {
                    out.extend(&chars[i..end]);
                } else if end >= chars.len() {
                    // truncated at end of input
                } else {
                    out.push_str("\\\\u");
                    out.extend(&chars[i + 2..end]);
                }
                i = end;
            }
            '\\' => {
                out.push(ch);
                if let Some(&next) = chars.get(i + 1) {
                    out.push(next);
                }
                i += 2;
            }
            _ => {
                out.push(ch);
                i += 1;
            }
        }
    }
    out
}

fn escape_bare_controls(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 8);
    let mut in_string = false;
    let mut escaped = false;
    for ch in input.chars() {
        if !in_string {
            if ch == '"' {
                in_string = true;
            }
            out.push(ch);
            continue;
        }
        if escaped {
            escaped = false;
            out.push(ch);
            continue;
        }
        match ch {
            '\\' => {
                escaped = true;
                out.push(ch);
            }
            '"' => {
                in_string = false;
                out.push(ch);
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(ch),
        }
    }
    out
}
