pub mod canonical;
pub mod request;
pub mod tool_call;
pub mod tool_names;
pub mod wire;

pub use canonical::{BlockKind, CanonicalEvent, Delta, StopReason, Usage};
pub use request::{Content, Message, Part, Role, ToolSpec, UnifiedRequest};
pub use tool_call::{ToolArguments, ToolCallAssembler, ToolInvocation};
pub use tool_names::ToolNameMap;
