pub mod message;
pub mod tool;

pub use message::{Message, Role, TokenUsage, ToolInvocationRequest};
pub use tool::{ToolDescriptor, ToolInvocationResult};
