//! Agent execution: provider adapters, tool execution and the conversation
//! loop, plus the block executor and workflow run that plug the loop into the
//! core debug and batch machinery.

pub mod blocks;
pub mod conversation;
pub mod provider;
pub mod stats;
pub mod tools;

pub use blocks::{AgentBlockConfig, AgentBlockExecutor, WorkflowRun};
pub use conversation::{ConversationLoop, ConversationRequest, ExecutionResult};
pub use provider::{
    build_provider, AnthropicProvider, OpenAiProvider, ProviderAdapter, ProviderRequest,
    ProviderResponse,
};
pub use stats::HttpStatsSink;
pub use tools::{InMemoryToolRegistry, Tool, ToolExecutor, ToolRegistry};
