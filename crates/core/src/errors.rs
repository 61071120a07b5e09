use thiserror::Error;

use crate::debug::BlockId;
use crate::timing::TimingSummary;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("no credential configured for provider `{provider}`")]
    Authentication { provider: String },
    #[error("provider `{provider}` request failed: {message}")]
    Request { provider: String, status: Option<u16>, message: String },
    #[error("provider `{provider}` returned an undecodable response: {message}")]
    Decode { provider: String, message: String },
}

impl ProviderError {
    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }
}

/// Failure of a single tool call. Recovered by the conversation loop and
/// carried as the reason of a failed `ToolInvocationResult`.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ToolExecutionError {
    #[error("tool `{0}` is not registered")]
    NotFound(String),
    #[error("tool `{tool_id}` received arguments that are not a JSON object")]
    InvalidArguments { tool_id: String },
    #[error("tool `{tool_id}` failed: {message}")]
    Failed { tool_id: String, message: String },
}

/// A provider failure that aborted a conversation, with the timing collected
/// up to the failure point.
#[derive(Clone, Debug, Error)]
#[error("{source}")]
pub struct ConversationError {
    pub source: ProviderError,
    pub timing: TimingSummary,
}

impl ConversationError {
    pub fn is_authentication(&self) -> bool {
        self.source.is_authentication()
    }
}

#[derive(Debug, Error)]
pub enum DebugError {
    #[error("no debug session is active")]
    NotDebugging,
    #[error("a debug session is already active")]
    AlreadyDebugging,
    #[error("block plan is empty")]
    EmptyPlan,
    #[error("block `{0}` is declared more than once")]
    DuplicateBlock(BlockId),
    #[error("block `{block_id}` depends on unknown block `{dependency}`")]
    UnknownDependency { block_id: BlockId, dependency: BlockId },
    #[error("block plan contains a dependency cycle through {0:?}")]
    Cycle(Vec<BlockId>),
    #[error("block `{block_id}` failed: {source}")]
    BlockFailed {
        block_id: BlockId,
        #[source]
        source: Box<RunError>,
    },
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Conversation(#[from] ConversationError),
    #[error(transparent)]
    Debug(#[from] DebugError),
    #[error("block `{block_id}` has an invalid configuration: {message}")]
    InvalidBlockConfig { block_id: BlockId, message: String },
    #[error("run failed: {0}")]
    Other(String),
}

impl RunError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Conversation(error) if error.is_authentication() => {
                "The model provider rejected the run because no credential is configured."
            }
            Self::Conversation(_) => "The model provider request failed. Please retry shortly.",
            Self::Debug(DebugError::BlockFailed { source, .. }) => source.user_message(),
            Self::Debug(_) | Self::InvalidBlockConfig { .. } => {
                "The workflow could not be executed. Check its block configuration."
            }
            Self::Other(_) => "An unexpected error stopped the run.",
        }
    }
}

/// Terminal error of a batch: the first run that failed.
#[derive(Debug, Error)]
#[error("run {run_number} of {run_count} failed: {source}")]
pub struct BatchRunError {
    pub run_number: u32,
    pub run_count: u32,
    #[source]
    pub source: RunError,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StatsError {
    #[error("statistics endpoint is not configured")]
    NotConfigured,
    #[error("statistics request failed: {0}")]
    Request(String),
}
