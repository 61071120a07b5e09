use std::sync::Arc;

use agentrun_agent::{
    build_provider, AgentBlockExecutor, ConversationLoop, HttpStatsSink, InMemoryToolRegistry,
    ToolExecutor, WorkflowRun,
};
use agentrun_core::batch::{BatchOutcome, BatchReport, RunBatcher};
use agentrun_core::config::{AppConfig, ConfigError, LoadOptions};
use agentrun_core::debug::{Block, BlockPlan, DebugMode};
use agentrun_core::errors::{DebugError, RunError};
use agentrun_core::telemetry::{TelemetrySink, TracingTelemetrySink};
use anyhow::Context;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::CommandResult;

const COMMAND: &str = "run";
const BLOCK_ID: &str = "prompt";

#[derive(Clone, Debug)]
pub struct RunArgs {
    pub prompt: String,
    pub system: Option<String>,
    pub count: u32,
}

type PromptRun = WorkflowRun<AgentBlockExecutor>;

pub async fn run(options: LoadOptions, args: RunArgs) -> CommandResult {
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => return config_failure(error),
    };
    crate::init_logging(&config);

    let batcher = match build_batcher(&config, &args) {
        Ok(batcher) => batcher,
        Err(error) => {
            return CommandResult::failure(
                COMMAND,
                "engine_setup",
                format!("{error:#}"),
                5,
            )
        }
    };

    let cancellation = CancellationToken::new();
    let ctrl_c = {
        let cancellation = cancellation.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!(
                    event_name = "cli.run.interrupt_received",
                    "interrupt received, finishing the current run before stopping"
                );
                cancellation.cancel();
            }
        })
    };

    let report = batcher.run(args.count, &cancellation).await;
    ctrl_c.abort();

    render_report(report, batcher.runner())
}

fn build_batcher(config: &AppConfig, args: &RunArgs) -> anyhow::Result<RunBatcher<PromptRun>> {
    let provider = build_provider(&config.llm).context("could not initialize model provider")?;
    let conversation = ConversationLoop::new(
        provider,
        ToolExecutor::new(Arc::new(InMemoryToolRegistry::default())),
    )
    .with_max_iterations(config.engine.max_iterations);
    let executor = AgentBlockExecutor::new(conversation, config.llm.model.clone());

    let plan = BlockPlan::new(vec![prompt_block(config, args)])
        .context("could not build the workflow plan")?;
    let telemetry: Arc<dyn TelemetrySink> = Arc::new(TracingTelemetrySink);
    let workflow = WorkflowRun::new(plan, Arc::new(executor))
        .with_debug_mode(DebugMode::from_config(&config.engine))
        .with_telemetry(Arc::clone(&telemetry));
    let mut batcher = RunBatcher::new(workflow, telemetry);

    if config.stats.endpoint.is_some() {
        let stats = HttpStatsSink::from_config(&config.stats)
            .context("could not initialize the statistics sink")?;
        batcher = batcher.with_stats_sink(Arc::new(stats));
    }

    Ok(batcher)
}

fn prompt_block(config: &AppConfig, args: &RunArgs) -> Block {
    let mut block_config = json!({ "user_prompt": args.prompt });
    if let Some(system) = &args.system {
        block_config["system_prompt"] = json!(system);
    }
    if let Some(temperature) = config.llm.temperature {
        block_config["temperature"] = json!(temperature);
    }
    if let Some(max_tokens) = config.llm.max_tokens {
        block_config["max_tokens"] = json!(max_tokens);
    }
    Block::new(BLOCK_ID, "Prompt").with_config(block_config)
}

fn render_report(report: BatchReport, runner: &PromptRun) -> CommandResult {
    let outputs: Vec<Value> = runner
        .completed_runs()
        .iter()
        .filter_map(|context| context.output(&BLOCK_ID.into()))
        .map(|output| output.content.clone())
        .collect();
    let details = json!({
        "batch_id": report.batch_id,
        "run_count": report.run_count,
        "completed_runs": report.completed_runs,
        "outputs": outputs,
    });

    match &report.outcome {
        BatchOutcome::Completed => CommandResult::report(
            COMMAND,
            "ok",
            None,
            report.summary,
            details,
            0,
        ),
        BatchOutcome::Cancelled => CommandResult::report(
            COMMAND,
            "cancelled",
            None,
            report.summary,
            details,
            130,
        ),
        BatchOutcome::Failed(error) => {
            let (error_class, exit_code) = classify(&error.source);
            CommandResult::report(
                COMMAND,
                "error",
                Some(error_class),
                report.summary,
                details,
                exit_code,
            )
        }
    }
}

fn classify(error: &RunError) -> (&'static str, u8) {
    match error {
        RunError::Conversation(error) if error.is_authentication() => {
            ("provider_authentication", 3)
        }
        RunError::Conversation(_) => ("provider_request", 4),
        RunError::Debug(DebugError::BlockFailed { source, .. }) => classify(source),
        RunError::Debug(_) | RunError::InvalidBlockConfig { .. } => ("workflow_invalid", 4),
        RunError::Other(_) => ("run_failed", 4),
    }
}

fn config_failure(error: ConfigError) -> CommandResult {
    CommandResult::failure(COMMAND, "config_validation", error.to_string(), 2)
}

#[cfg(test)]
mod tests {
    use agentrun_core::debug::BlockId;
    use agentrun_core::errors::{ConversationError, DebugError, ProviderError, RunError};
    use agentrun_core::timing::TimingSummary;

    use super::classify;

    fn conversation(source: ProviderError) -> RunError {
        RunError::Conversation(ConversationError { source, timing: TimingSummary::default() })
    }

    #[test]
    fn nested_block_failures_classify_by_root_cause() {
        let auth = conversation(ProviderError::Authentication { provider: "openai".to_owned() });
        let nested = RunError::Debug(DebugError::BlockFailed {
            block_id: BlockId::from("prompt"),
            source: Box::new(auth),
        });

        assert_eq!(classify(&nested), ("provider_authentication", 3));
    }

    #[test]
    fn request_failures_and_config_problems_are_distinct() {
        let request = conversation(ProviderError::Request {
            provider: "anthropic".to_owned(),
            status: Some(500),
            message: "boom".to_owned(),
        });
        let invalid = RunError::InvalidBlockConfig {
            block_id: BlockId::from("prompt"),
            message: "missing user_prompt".to_owned(),
        };

        assert_eq!(classify(&request).0, "provider_request");
        assert_eq!(classify(&invalid).0, "workflow_invalid");
    }
}
