pub mod batch;
pub mod config;
pub mod debug;
pub mod domain;
pub mod errors;
pub mod telemetry;
pub mod timing;

pub use batch::{BatchOutcome, BatchReport, BatchRun, RunBatcher, StatsSink};
pub use config::{AppConfig, ConfigError, ConfigOverrides, LlmConfig, LlmProvider, LoadOptions};
pub use debug::{
    Block, BlockContext, BlockExecutor, BlockId, BlockOutput, BlockPlan, DebugController,
    DebugMode, DebugState, StartOutcome, StepReport,
};
pub use domain::{
    Message, Role, TokenUsage, ToolDescriptor, ToolInvocationRequest, ToolInvocationResult,
};
pub use errors::{
    BatchRunError, ConversationError, DebugError, ProviderError, RunError, StatsError,
    ToolExecutionError,
};
pub use telemetry::{
    EngineEvent, EventCategory, InMemoryTelemetrySink, NotificationLevel, TelemetrySink,
    TracingTelemetrySink,
};
pub use timing::{SegmentKind, TimeSegment, TimingRecorder, TimingSummary};
