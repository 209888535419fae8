//! Block bookkeeping shared by every backend mapper.
//!
//! [`StreamState`] turns "text arrived", "tool started", "upstream finished" into
//! correctly ordered canonical events: it opens and closes blocks, assigns block
//! indices, routes tool argument fragments through a [`ToolCallAssembler`] and
//! restores shortened tool names.

use crate::observability::token_counter::{estimate_tokens_from_bytes, merge_usage};
use crate::protocol::canonical::{BlockKind, CanonicalEvent, Delta, EventBatch, StopReason, Usage};
use crate::protocol::tool_call::{ToolCallAssembler, ToolInvocation};
use crate::protocol::tool_names::ToolNameMap;
use crate::util::next_call_id;

#[derive(Debug)]
pub struct StreamState {
    message_id: String,
    model: String,
    message_started: bool,
    thinking_open: Option<usize>,
    text_open: Option<usize>,
    /// Call id and block index of the open tool block.
    open_tool: Option<(String, usize)>,
    next_block_index: usize,
    usage: Usage,
    estimated_input: u64,
    output_bytes: usize,
    tool_invoked: bool,
    dedup_text: bool,
    last_delta: Option<String>,
    tools: ToolCallAssembler,
    names: ToolNameMap,
    invocations: Vec<ToolInvocation>,
    finished: bool,
}

impl StreamState {
    #[must_use]
    pub fn new(message_id: String, model: String, names: ToolNameMap, estimated_input: u64) -> Self {
        Self {
            message_id,
            model,
            message_started: false,
            thinking_open: None,
            text_open: None,
            open_tool: None,
            next_block_index: 0,
            usage: Usage::default(),
            estimated_input,
            output_bytes: 0,
            tool_invoked: false,
            dedup_text: false,
            last_delta: None,
            tools: ToolCallAssembler::new(),
            names,
            invocations: Vec::new(),
            finished: false,
        }
    }

    /// Drop a text delta identical to the one right before it.
    #[must_use]
    pub fn with_duplicate_suppression(mut self) -> Self {
        self.dedup_text = true;
        self
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    #[must_use]
    pub fn usage(&self) -> Usage {
        self.usage
    }

    /// Finalized tool calls so far, names restored.
    #[must_use]
    pub fn invocations(&self) -> &[ToolInvocation] {
        &self.invocations
    }

    pub fn set_message_id(&mut self, id: &str) {
        if !self.message_started && !id.is_empty() {
            self.message_id = id.to_string();
        }
    }

    /// Emit `MessageStart` unless it already went out.
    pub fn start(&mut self, out: &mut EventBatch) {
        if self.message_started {
            return;
        }
        self.message_started = true;
        out.push(CanonicalEvent::MessageStart {
            id: self.message_id.clone(),
            model: self.model.clone(),
        });
    }

    /// Record upstream-reported counters; zero or absent values keep what we had.
    pub fn record_usage(&mut self, input_tokens: Option<u64>, output_tokens: Option<u64>) {
        if let Some(input) = input_tokens.filter(|n| *n > 0) {
            self.usage.input_tokens = input;
        }
        if let Some(output) = output_tokens.filter(|n| *n > 0) {
            self.usage.output_tokens = output;
        }
    }

    pub fn text(&mut self, text: &str, out: &mut EventBatch) {
        if text.is_empty() {
            return;
        }
        if self.dedup_text && self.last_delta.as_deref() == Some(text) {
            tracing::debug!(bytes = text.len(), "dropping duplicate text delta");
            return;
        }
        self.start(out);
        self.close_tool(out);
        self.close_thinking(out);
        let index = match self.text_open {
            Some(index) => index,
            None => {
                let index = self.open_block(BlockKind::Text, None, None, out);
                self.text_open = Some(index);
                index
            }
        };
        self.output_bytes += text.len();
        out.push(CanonicalEvent::BlockDelta {
            index,
            delta: Delta::Text(text.to_string()),
        });
        if self.dedup_text {
            self.last_delta = Some(text.to_string());
        }
    }

    pub fn thinking(&mut self, text: &str, out: &mut EventBatch) {
        if text.is_empty() {
            return;
        }
        self.start(out);
        self.close_tool(out);
        self.close_text(out);
        self.last_delta = None;
        let index = match self.thinking_open {
            Some(index) => index,
            None => {
                let index = self.open_block(BlockKind::Thinking, None, None, out);
                self.thinking_open = Some(index);
                index
            }
        };
        self.output_bytes += text.len();
        out.push(CanonicalEvent::BlockDelta {
            index,
            delta: Delta::Thinking(text.to_string()),
        });
    }

    /// Open a tool block. A repeated start for the open call is ignored; a
    /// different open call is completed first. A start for a call that was
    /// already finalized is dropped.
    pub fn tool_start(&mut self, call_id: &str, upstream_name: &str, out: &mut EventBatch) {
        if self.tools.is_open(call_id) {
            return;
        }
        if self.is_finalized(call_id) {
            tracing::warn!(call_id, "dropping start for an already completed tool call");
            return;
        }
        self.start(out);
        self.close_tool(out);
        self.close_text(out);
        self.close_thinking(out);
        self.last_delta = None;
        let name = self.names.restore(upstream_name).to_string();
        if let Some(finished) = self.tools.on_start(call_id, &name) {
            self.emit_tool_completion(finished, out);
        }
        let index = self.open_block(
            BlockKind::ToolUse,
            Some(call_id.to_string()),
            Some(name),
            out,
        );
        self.open_tool = Some((call_id.to_string(), index));
    }

    /// Route an argument fragment; `None` targets the open call.
    ///
    /// A fragment for a call that never started opens it with an empty name;
    /// one for an already completed call is dropped.
    pub fn tool_delta(&mut self, call_id: Option<&str>, fragment: &str, out: &mut EventBatch) {
        if let Some(id) = call_id.filter(|id| self.is_finalized(id)) {
            tracing::warn!(call_id = id, "dropping arguments for an already completed tool call");
            return;
        }
        let needs_start = match (call_id, self.tools.open_call_id()) {
            (None, Some(_)) => false,
            (Some(id), Some(open)) => open != id,
            (_, None) => true,
        };
        if needs_start {
            let id = call_id.map_or_else(next_call_id, ToString::to_string);
            tracing::warn!(call_id = %id, "tool arguments arrived before the tool start");
            self.tool_start(&id, "", out);
        }
        self.output_bytes += fragment.len();
        if let Some(finished) = self.tools.on_delta(None, fragment) {
            self.emit_tool_completion(finished, out);
        }
    }

    /// Finalize the open call; `None` or its id closes it.
    pub fn tool_done(&mut self, call_id: Option<&str>, out: &mut EventBatch) {
        if let Some(finished) = self.tools.on_done(call_id) {
            self.emit_tool_completion(finished, out);
        }
    }

    /// Close every block and emit the closing `MessageDelta` + `MessageStop`.
    ///
    /// `upstream_reason` is the backend's own stop string; a tool call during the
    /// message always yields `tool_use`.
    pub fn finish(&mut self, upstream_reason: Option<&str>, out: &mut EventBatch) {
        if self.finished {
            return;
        }
        self.start(out);
        self.close_tool(out);
        self.close_text(out);
        self.close_thinking(out);

        let stop_reason = if self.tool_invoked {
            StopReason::ToolUse
        } else {
            upstream_reason.map_or(StopReason::EndTurn, StopReason::from_upstream)
        };
        let estimated_output = estimate_tokens_from_bytes(self.output_bytes);
        self.usage = merge_usage(self.usage, self.estimated_input, estimated_output);
        out.push(CanonicalEvent::MessageDelta {
            stop_reason,
            usage: self.usage,
        });
        out.push(CanonicalEvent::MessageStop);
        self.finished = true;
    }

    fn is_finalized(&self, call_id: &str) -> bool {
        self.invocations.iter().any(|done| done.call_id == call_id)
    }

    fn open_block(
        &mut self,
        kind: BlockKind,
        tool_id: Option<String>,
        tool_name: Option<String>,
        out: &mut EventBatch,
    ) -> usize {
        let index = self.next_block_index;
        self.next_block_index += 1;
        out.push(CanonicalEvent::BlockStart {
            index,
            kind,
            tool_id,
            tool_name,
        });
        index
    }

    fn close_text(&mut self, out: &mut EventBatch) {
        if let Some(index) = self.text_open.take() {
            out.push(CanonicalEvent::BlockStop { index });
        }
    }

    fn close_thinking(&mut self, out: &mut EventBatch) {
        if let Some(index) = self.thinking_open.take() {
            out.push(CanonicalEvent::BlockStop { index });
        }
    }

    fn close_tool(&mut self, out: &mut EventBatch) {
        if let Some(finished) = self.tools.finish_open() {
            self.emit_tool_completion(finished, out);
        }
    }

    fn emit_tool_completion(&mut self, invocation: ToolInvocation, out: &mut EventBatch) {
        let index = match self.open_tool.take() {
            Some((id, index)) if id == invocation.call_id => index,
            other => {
                // Invariant: the assembler and the block tracker open calls together.
                tracing::debug!(call_id = %invocation.call_id, tracked = ?other, "tool block index mismatch");
                match other {
                    Some((_, index)) => index,
                    None => return,
                }
            }
        };
        out.push(CanonicalEvent::BlockDelta {
            index,
            delta: Delta::ToolInput(invocation.arguments.to_json_text()),
        });
        out.push(CanonicalEvent::BlockStop { index });
        self.tool_invoked = true;
        self.invocations.push(invocation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> StreamState {
        StreamState::new("msg_1".into(), "m".into(), ToolNameMap::new(64), 7)
    }

    fn kinds(events: &[CanonicalEvent]) -> Vec<String> {
        events
            .iter()
            .map(|e| match e {
                CanonicalEvent::MessageStart { .. } => "start".to_string(),
                CanonicalEvent::BlockStart { index, kind, .. } => {
                    format!("open{index}:{}", kind.as_str())
                }
                CanonicalEvent::BlockDelta { index, .. } => format!("delta{index}"),
                CanonicalEvent::BlockStop { index } => format!("stop{index}"),
                CanonicalEvent::MessageDelta { stop_reason, .. } => {
                    format!("mdelta:{}", stop_reason.as_str())
                }
                CanonicalEvent::MessageStop => "mstop".to_string(),
            })
            .collect()
    }

    #[test]
    fn test_thinking_then_text_uses_separate_indices() {
        let mut s = state();
        let mut out = EventBatch::new();
        s.thinking("hmm", &mut out);
        s.text("Hello", &mut out);
        s.text(" world", &mut out);
        s.finish(Some("stop"), &mut out);
        assert_eq!(
            kinds(&out),
            vec![
                "start",
                "open0:thinking",
                "delta0",
                "stop0",
                "open1:text",
                "delta1",
                "delta1",
                "stop1",
                "mdelta:end_turn",
                "mstop"
            ]
        );
    }

    #[test]
    fn test_thinking_during_text_reopens() {
        let mut s = state();
        let mut out = EventBatch::new();
        s.text("a", &mut out);
        s.thinking("b", &mut out);
        s.text("c", &mut out);
        assert_eq!(
            kinds(&out),
            vec![
                "start",
                "open0:text",
                "delta0",
                "stop0",
                "open1:thinking",
                "delta1",
                "stop1",
                "open2:text",
                "delta2"
            ]
        );
    }

    #[test]
    fn test_tool_call_closes_text_and_sets_stop_reason() {
        let mut s = state();
        let mut out = EventBatch::new();
        s.text("calling", &mut out);
        s.tool_start("t1", "lookup", &mut out);
        s.tool_start("t1", "lookup", &mut out);
        s.tool_delta(Some("t1"), "{\"q\":", &mut out);
        s.tool_delta(Some("t1"), "1}", &mut out);
        s.tool_done(Some("t1"), &mut out);
        s.finish(Some("stop"), &mut out);
        assert_eq!(
            kinds(&out),
            vec![
                "start",
                "open0:text",
                "delta0",
                "stop0",
                "open1:tool_use",
                "delta1",
                "stop1",
                "mdelta:tool_use",
                "mstop"
            ]
        );
        match &out[5] {
            CanonicalEvent::BlockDelta {
                delta: Delta::ToolInput(json),
                ..
            } => assert_eq!(json, "{\"q\":1}"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(s.invocations().len(), 1);
    }

    #[test]
    fn test_second_tool_start_completes_first() {
        let mut s = state();
        let mut out = EventBatch::new();
        s.tool_start("a", "one", &mut out);
        s.tool_delta(None, "{}", &mut out);
        s.tool_start("b", "two", &mut out);
        s.finish(None, &mut out);
        assert_eq!(
            kinds(&out),
            vec![
                "start",
                "open0:tool_use",
                "delta0",
                "stop0",
                "open1:tool_use",
                "delta1",
                "stop1",
                "mdelta:tool_use",
                "mstop"
            ]
        );
        assert_eq!(s.invocations()[1].name, "two");
    }

    #[test]
    fn test_fragment_without_start_opens_call() {
        let mut s = state();
        let mut out = EventBatch::new();
        s.tool_delta(Some("t9"), "{\"x\":1}", &mut out);
        s.finish(None, &mut out);
        assert!(matches!(
            &out[1],
            CanonicalEvent::BlockStart { kind: BlockKind::ToolUse, tool_id: Some(id), tool_name: Some(name), .. }
                if id == "t9" && name.is_empty()
        ));
        assert_eq!(s.invocations()[0].call_id, "t9");
    }

    #[test]
    fn test_fragment_after_interrupting_text_is_dropped() {
        let mut s = state();
        let mut out = EventBatch::new();
        s.tool_start("t1", "lookup", &mut out);
        s.tool_delta(Some("t1"), "{\"q\":", &mut out);
        s.text("meanwhile", &mut out);
        s.tool_delta(Some("t1"), "1}", &mut out);
        s.tool_start("t1", "lookup", &mut out);
        s.tool_done(Some("t1"), &mut out);
        s.finish(None, &mut out);
        let tool_blocks = out
            .iter()
            .filter(|e| matches!(e, CanonicalEvent::BlockStart { kind: BlockKind::ToolUse, .. }))
            .count();
        assert_eq!(tool_blocks, 1);
        assert_eq!(s.invocations().len(), 1);
        assert_eq!(s.invocations()[0].name, "lookup");
        assert_eq!(
            kinds(&out),
            vec![
                "start",
                "open0:tool_use",
                "delta0",
                "stop0",
                "open1:text",
                "delta1",
                "stop1",
                "mdelta:tool_use",
                "mstop"
            ]
        );
    }

    #[test]
    fn test_restores_shortened_tool_name() {
        let long = "x".repeat(94);
        let names = ToolNameMap::build(64, [long.as_str()]);
        let upstream = names.upstream_name(&long).to_string();
        let mut s = StreamState::new("m1".into(), "m".into(), names, 0);
        let mut out = EventBatch::new();
        s.tool_start("t1", &upstream, &mut out);
        s.tool_done(None, &mut out);
        assert!(matches!(
            &out[1],
            CanonicalEvent::BlockStart { tool_name: Some(name), .. } if *name == long
        ));
        assert_eq!(s.invocations()[0].name, long);
    }

    #[test]
    fn test_duplicate_suppression_only_when_enabled() {
        let mut plain = state();
        let mut out = EventBatch::new();
        plain.text("same", &mut out);
        plain.text("same", &mut out);
        assert_eq!(out.iter().filter(|e| matches!(e, CanonicalEvent::BlockDelta { .. })).count(), 2);

        let mut dedup = state().with_duplicate_suppression();
        let mut out = EventBatch::new();
        dedup.text("same", &mut out);
        dedup.text("same", &mut out);
        dedup.text("other", &mut out);
        dedup.text("same", &mut out);
        assert_eq!(out.iter().filter(|e| matches!(e, CanonicalEvent::BlockDelta { .. })).count(), 3);
    }

    #[test]
    fn test_finish_is_idempotent_and_fills_usage() {
        let mut s = state();
        let mut out = EventBatch::new();
        s.record_usage(None, Some(3));
        s.text("abcdefgh", &mut out);
        s.finish(Some("length"), &mut out);
        s.finish(Some("stop"), &mut out);
        let deltas: Vec<_> = out
            .iter()
            .filter_map(|e| match e {
                CanonicalEvent::MessageDelta { stop_reason, usage } => Some((stop_reason.clone(), *usage)),
                _ => None,
            })
            .collect();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].0, StopReason::MaxTokens);
        assert_eq!(deltas[0].1.input_tokens, 7);
        assert_eq!(deltas[0].1.output_tokens, 3);
    }

    #[test]
    fn test_empty_message_still_well_formed() {
        let mut s = state();
        let mut out = EventBatch::new();
        s.finish(None, &mut out);
        assert_eq!(kinds(&out), vec!["start", "mdelta:end_turn", "mstop"]);
    }
}
