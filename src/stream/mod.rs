pub mod idle;
pub mod reassembler;
pub mod sse;

pub use idle::IdleTimeout;
pub use reassembler::FragmentReassembler;
pub use sse::{sse_frame_stream, SseParser};

/// A parsed SSE frame from the upstream.
#[derive(Debug, Clone, Default)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}
