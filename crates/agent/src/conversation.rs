//! Multi-turn model/tool loop.
//!
//! The loop calls the provider, executes any requested tools sequentially,
//! feeds their results back, and repeats until the model stops asking for
//! tools or the iteration cap is reached. Reaching the cap is not an error.

use std::sync::Arc;

use agentrun_core::config::DEFAULT_MAX_ITERATIONS;
use agentrun_core::domain::{
    Message, TokenUsage, ToolDescriptor, ToolInvocationRequest, ToolInvocationResult,
};
use agentrun_core::errors::{ConversationError, ToolExecutionError};
use agentrun_core::timing::{SegmentKind, TimingRecorder, TimingSummary};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::provider::{ProviderAdapter, ProviderRequest, ProviderResponse};
use crate::tools::ToolExecutor;

pub const INITIAL_RESPONSE_LABEL: &str = "Initial response";

#[derive(Clone, Debug, PartialEq)]
pub struct ConversationRequest {
    pub correlation_id: String,
    pub model: String,
    pub system_prompt: Option<String>,
    /// Sent as a user message ahead of `messages`.
    pub context: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDescriptor>,
    pub response_schema: Option<Value>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl ConversationRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            model: model.into(),
            system_prompt: None,
            context: None,
            messages: Vec::new(),
            tools: Vec::new(),
            response_schema: None,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_tool(mut self, tool: ToolDescriptor) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_response_schema(mut self, schema: Value) -> Self {
        self.response_schema = Some(schema);
        self
    }

    fn initial_transcript(&self) -> Vec<Message> {
        let mut transcript = Vec::with_capacity(self.messages.len() + 2);
        if let Some(system_prompt) = &self.system_prompt {
            transcript.push(Message::system(system_prompt.clone()));
        }
        if let Some(context) = &self.context {
            transcript.push(Message::user(context.clone()));
        }
        transcript.extend(self.messages.iter().cloned());
        transcript
    }

    fn tool(&self, tool_id: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|tool| tool.id == tool_id)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionResult {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
    /// Calls that were dispatched to the executor, in order.
    pub tool_calls: Vec<ToolInvocationRequest>,
    /// Successful results only, in order.
    pub tool_results: Vec<ToolInvocationResult>,
    pub transcript: Vec<Message>,
    pub timing: TimingSummary,
}

pub struct ConversationLoop {
    provider: Arc<dyn ProviderAdapter>,
    executor: ToolExecutor,
    max_iterations: u32,
}

impl ConversationLoop {
    pub fn new(provider: Arc<dyn ProviderAdapter>, executor: ToolExecutor) -> Self {
        Self { provider, executor, max_iterations: DEFAULT_MAX_ITERATIONS }
    }

    /// Caps tool iterations, not model calls: a run makes at most
    /// `max_iterations + 1` model calls.
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Tool iterations allowed per run; model calls may exceed it by one.
    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub async fn run(
        &self,
        request: ConversationRequest,
    ) -> Result<ExecutionResult, ConversationError> {
        let mut state = LoopState::new(request.initial_transcript());

        let mut response = self.call_model(&request, &mut state, INITIAL_RESPONSE_LABEL).await?;
        let mut content = response.content.clone().unwrap_or_default();
        let mut model = response.model.take().unwrap_or_else(|| request.model.clone());
        let mut iteration = 0_u32;

        while !response.tool_calls.is_empty() && iteration < self.max_iterations {
            let attempted = self.execute_tools(&request, &mut state, &response.tool_calls).await;

            let declared: Vec<ToolInvocationRequest> =
                attempted.iter().map(|(call, _)| call.clone()).collect();
            let turn_text = response.content.take();
            if turn_text.is_some() || !declared.is_empty() {
                state.transcript.push(Message::assistant_tool_calls(turn_text, declared));
            }
            for (call, result) in attempted {
                state.tool_calls.push(call);
                if let Some(result) = result {
                    let message =
                        Message::tool_result(result.call_id.clone(), result.transcript_content());
                    state.transcript.push(message);
                    state.tool_results.push(result);
                }
            }

            let label = format!("Model response (iteration {})", iteration + 1);
            response = self.call_model(&request, &mut state, &label).await?;
            if let Some(text) = response.content.clone() {
                content = text;
            }
            if let Some(reported) = response.model.take() {
                model = reported;
            }
            iteration += 1;
        }

        if !response.tool_calls.is_empty() {
            info!(
                event_name = "agent.conversation.iteration_cap_reached",
                correlation_id = %request.correlation_id,
                max_iterations = self.max_iterations,
                unanswered_tool_calls = response.tool_calls.len(),
                "iteration cap reached, returning partial result"
            );
        }
        if let Some(text) = response.content.take() {
            state.transcript.push(Message::assistant(text));
        }

        let timing = state.timing.summary(state.model_calls);
        info!(
            event_name = "agent.conversation.completed",
            correlation_id = %request.correlation_id,
            model = %model,
            iterations = timing.iterations,
            total_tokens = state.usage.total,
            total_ms = timing.total.as_millis() as u64,
            "conversation completed"
        );

        Ok(ExecutionResult {
            content,
            model,
            usage: state.usage,
            tool_calls: state.tool_calls,
            tool_results: state.tool_results,
            transcript: state.transcript,
            timing,
        })
    }

    async fn call_model(
        &self,
        request: &ConversationRequest,
        state: &mut LoopState,
        label: &str,
    ) -> Result<ProviderResponse, ConversationError> {
        let provider_request = ProviderRequest {
            tools: request.tools.clone(),
            response_schema: request.response_schema.clone(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            ..ProviderRequest::from_transcript(request.model.clone(), &state.transcript)
        };

        let outcome = state
            .timing
            .time(SegmentKind::Model, label, self.provider.complete(&provider_request))
            .await;
        state.model_calls += 1;

        match outcome {
            Ok(response) => {
                state.usage.accumulate(&response.usage);
                info!(
                    event_name = "agent.conversation.model_call_completed",
                    correlation_id = %request.correlation_id,
                    provider = self.provider.provider_id(),
                    label,
                    prompt_tokens = response.usage.prompt,
                    completion_tokens = response.usage.completion,
                    tool_calls = response.tool_calls.len(),
                    "model call completed"
                );
                Ok(response)
            }
            Err(source) => {
                warn!(
                    event_name = "agent.conversation.model_call_failed",
                    correlation_id = %request.correlation_id,
                    provider = self.provider.provider_id(),
                    label,
                    error = %source,
                    "model call failed, aborting conversation"
                );
                Err(ConversationError { source, timing: state.timing.summary(state.model_calls) })
            }
        }
    }

    /// Returns each dispatched call with its result when it succeeded.
    async fn execute_tools(
        &self,
        request: &ConversationRequest,
        state: &mut LoopState,
        calls: &[ToolInvocationRequest],
    ) -> Vec<(ToolInvocationRequest, Option<ToolInvocationResult>)> {
        let mut attempted = Vec::with_capacity(calls.len());

        for call in calls {
            let Some(descriptor) = request.tool(&call.tool_id) else {
                warn!(
                    event_name = "agent.tool.skipped",
                    correlation_id = %request.correlation_id,
                    call_id = %call.id,
                    tool_id = %call.tool_id,
                    "model requested a tool that was not offered"
                );
                continue;
            };

            let result = match descriptor.merge_arguments(&call.arguments) {
                Some(arguments) => {
                    state
                        .timing
                        .time(
                            SegmentKind::Tool,
                            call.tool_id.clone(),
                            self.executor.execute(&call.id, &call.tool_id, arguments),
                        )
                        .await
                }
                None => {
                    let error =
                        ToolExecutionError::InvalidArguments { tool_id: call.tool_id.clone() };
                    ToolInvocationResult::failed(&call.id, &call.tool_id, error.to_string())
                }
            };

            if result.success {
                attempted.push((call.clone(), Some(result)));
            } else {
                warn!(
                    event_name = "agent.tool.result_dropped",
                    correlation_id = %request.correlation_id,
                    call_id = %call.id,
                    tool_id = %call.tool_id,
                    reason = result.error.as_deref().unwrap_or("unknown"),
                    "tool call failed, continuing without its result"
                );
                attempted.push((call.clone(), None));
            }
        }

        attempted
    }
}

struct LoopState {
    transcript: Vec<Message>,
    timing: TimingRecorder,
    usage: TokenUsage,
    model_calls: u32,
    tool_calls: Vec<ToolInvocationRequest>,
    tool_results: Vec<ToolInvocationResult>,
}

impl LoopState {
    fn new(transcript: Vec<Message>) -> Self {
        Self {
            transcript,
            timing: TimingRecorder::new(),
            usage: TokenUsage::default(),
            model_calls: 0,
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
        }
    }
}
