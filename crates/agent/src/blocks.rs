use std::sync::{Arc, Mutex};

use agentrun_core::batch::BatchRun;
use agentrun_core::debug::{
    Block, BlockContext, BlockExecutor, BlockOutput, BlockPlan, DebugController, DebugMode,
    StartOutcome,
};
use agentrun_core::domain::{Message, ToolDescriptor};
use agentrun_core::errors::RunError;
use agentrun_core::telemetry::TelemetrySink;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::conversation::{ConversationLoop, ConversationRequest};

/// Per-block settings, decoded from `Block::config`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentBlockConfig {
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub user_prompt: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub response_schema: Option<Value>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// Executes agent blocks with a shared conversation loop and tool catalog.
pub struct AgentBlockExecutor {
    conversation: ConversationLoop,
    default_model: String,
    catalog: Vec<ToolDescriptor>,
}

impl AgentBlockExecutor {
    pub fn new(conversation: ConversationLoop, default_model: impl Into<String>) -> Self {
        Self { conversation, default_model: default_model.into(), catalog: Vec::new() }
    }

    pub fn with_tool(mut self, descriptor: ToolDescriptor) -> Self {
        self.catalog.push(descriptor);
        self
    }

    fn decode(&self, block: &Block) -> Result<AgentBlockConfig, RunError> {
        serde_json::from_value(block.config.clone()).map_err(|error| RunError::InvalidBlockConfig {
            block_id: block.id.clone(),
            message: error.to_string(),
        })
    }

    fn resolve_tools(
        &self,
        block: &Block,
        tool_ids: &[String],
    ) -> Result<Vec<ToolDescriptor>, RunError> {
        tool_ids
            .iter()
            .map(|tool_id| {
                self.catalog.iter().find(|tool| &tool.id == tool_id).cloned().ok_or_else(|| {
                    RunError::InvalidBlockConfig {
                        block_id: block.id.clone(),
                        message: format!("unknown tool `{tool_id}`"),
                    }
                })
            })
            .collect()
    }
}

#[async_trait]
impl BlockExecutor for AgentBlockExecutor {
    async fn execute(
        &self,
        block: &Block,
        context: &BlockContext,
    ) -> Result<BlockOutput, RunError> {
        let config = self.decode(block)?;
        let tools = self.resolve_tools(block, &config.tools)?;

        let mut request = ConversationRequest::new(
            config.model.clone().unwrap_or_else(|| self.default_model.clone()),
        )
        .with_correlation_id(context.run_id.clone())
        .with_message(Message::user(config.user_prompt.clone()));
        request.system_prompt = config.system_prompt.clone();
        request.context = upstream_context(block, context, config.context.as_deref());
        request.tools = tools;
        request.response_schema = config.response_schema.clone();
        request.temperature = config.temperature;
        request.max_tokens = config.max_tokens;

        let result = self.conversation.run(request).await?;
        info!(
            event_name = "agent.block.completed",
            correlation_id = %context.run_id,
            block_id = %block.id,
            iterations = result.timing.iterations,
            total_tokens = result.usage.total,
            "agent block completed"
        );

        let content = match config.response_schema {
            Some(_) => serde_json::from_str(&result.content)
                .unwrap_or_else(|_| Value::String(result.content.clone())),
            None => Value::String(result.content.clone()),
        };
        Ok(BlockOutput::new(json!({
            "content": content,
            "model": result.model,
            "usage": result.usage,
            "timing": result.timing,
            "toolResults": result.tool_results,
        })))
    }
}

/// Joins the configured context with the outputs of the block's dependencies.
fn upstream_context(
    block: &Block,
    context: &BlockContext,
    configured: Option<&str>,
) -> Option<String> {
    let mut sections: Vec<String> = configured.map(str::to_owned).into_iter().collect();

    for dependency in &block.depends_on {
        let Some(output) = context.output(dependency) else {
            continue;
        };
        let text = match output.content.get("content").unwrap_or(&output.content) {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        sections.push(format!("Output of `{dependency}`:\n{text}"));
    }

    (!sections.is_empty()).then(|| sections.join("\n\n"))
}

/// One workflow execution per batch run. With debug mode on, each run is
/// stepped block by block so every block reports through telemetry.
pub struct WorkflowRun<E> {
    plan: BlockPlan,
    executor: Arc<E>,
    mode: DebugMode,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    completed: Mutex<Vec<BlockContext>>,
}

impl<E> WorkflowRun<E>
where
    E: BlockExecutor + 'static,
{
    pub fn new(plan: BlockPlan, executor: Arc<E>) -> Self {
        Self {
            plan,
            executor,
            mode: DebugMode::new(false),
            telemetry: None,
            completed: Mutex::new(Vec::new()),
        }
    }

    pub fn with_debug_mode(mut self, mode: DebugMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Contexts of the runs that finished, in run order.
    pub fn completed_runs(&self) -> Vec<BlockContext> {
        match self.completed.lock() {
            Ok(completed) => completed.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl<E> BatchRun for WorkflowRun<E>
where
    E: BlockExecutor + 'static,
{
    async fn run(&self, run_number: u32) -> Result<(), RunError> {
        let mut controller = DebugController::new(Arc::clone(&self.executor), self.mode.clone());
        if let Some(telemetry) = &self.telemetry {
            controller = controller.with_telemetry(Arc::clone(telemetry));
        }

        let context = match controller.start(self.plan.clone()).await? {
            StartOutcome::Completed(context) => context,
            StartOutcome::Paused { .. } => loop {
                let report = controller.step().await?;
                debug!(
                    event_name = "agent.workflow.block_stepped",
                    run_number,
                    block_id = %report.executed,
                    pending = report.pending.len(),
                    "workflow block stepped"
                );
                if let Some(context) = report.completed {
                    break context;
                }
            },
        };

        info!(
            event_name = "agent.workflow.run_completed",
            correlation_id = %context.run_id,
            run_number,
            blocks = context.outputs.len(),
            "workflow run completed"
        );
        match self.completed.lock() {
            Ok(mut completed) => completed.push(context),
            Err(poisoned) => poisoned.into_inner().push(context),
        }
        Ok(())
    }
}
