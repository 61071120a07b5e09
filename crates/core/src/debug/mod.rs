pub mod controller;
pub mod plan;

pub use controller::{
    BlockContext, BlockExecutor, BlockOutput, DebugController, DebugMode, DebugState,
    StartOutcome, StepReport,
};
pub use plan::{Block, BlockId, BlockPlan};
