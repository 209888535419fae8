use crate::protocol::canonical::Usage;
use crate::protocol::request::{Content, Part, UnifiedRequest};
use std::time::Duration;
use tracing::info;

/// Estimate the number of tokens in `text`.
///
/// Uses a lightweight heuristic (`bytes / 4`) to avoid loading model BPE tables.
#[must_use]
pub fn estimate_tokens(text: &str) -> u64 {
    estimate_tokens_from_bytes(text.len())
}

/// Token estimate for `bytes` bytes of generated text.
#[must_use]
pub fn estimate_tokens_from_bytes(bytes: usize) -> u64 {
    (bytes as u64).div_ceil(4)
}

fn estimate_content_tokens(content: &Content) -> u64 {
    match content {
        Content::Text(text) => estimate_tokens(text),
        Content::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                Part::Text { text } => estimate_tokens(text),
                Part::ToolResult { content, .. } => estimate_tokens(content),
                Part::ToolUse { name, input, .. } => {
                    estimate_tokens(name) + estimate_tokens(&input.to_string())
                }
                // Images are not counted via text tokenization
                Part::Image { .. } => 0,
            })
            .sum(),
    }
}

/// Estimate the total input tokens for a request.
///
/// Sums tokens from the system prompt, all message content and serialized tool
/// definitions.
#[must_use]
pub fn estimate_request_tokens(request: &UnifiedRequest) -> u64 {
    let mut total: u64 = 0;

    if let Some(ref system) = request.system {
        total += estimate_tokens(system);
    }

    for msg in &request.messages {
        total += estimate_content_tokens(&msg.content);
    }

    for tool in &request.tools {
        total += estimate_tokens(&tool.schema.to_string());
        total += estimate_tokens(&tool.description);
        total += estimate_tokens(&tool.name);
    }

    total
}

/// Merge upstream-reported usage with local estimates.
///
/// Upstream non-zero values always win; only zero fields are filled.
#[must_use]
pub fn merge_usage(upstream: Usage, estimated_input: u64, estimated_output: u64) -> Usage {
    Usage {
        input_tokens: if upstream.input_tokens > 0 {
            upstream.input_tokens
        } else {
            estimated_input
        },
        output_tokens: if upstream.output_tokens > 0 {
            upstream.output_tokens
        } else {
            estimated_output
        },
    }
}

/// Log token usage for a completed request at INFO level.
pub fn log_request_usage(model: &str, usage: &Usage, duration: Duration) {
    info!(
        model = model,
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        total_tokens = usage.input_tokens + usage.output_tokens,
        duration_seconds = duration.as_secs_f64(),
        "request completed"
    );
}
