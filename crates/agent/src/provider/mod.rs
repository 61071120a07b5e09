//! Normalized contract between the conversation loop and model vendors.
//!
//! Each adapter owns its wire format. The loop only sees `ProviderRequest` and
//! `ProviderResponse`.

pub mod anthropic;
pub mod openai;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use agentrun_core::config::{LlmConfig, LlmProvider};
use agentrun_core::domain::{Message, Role, TokenUsage, ToolDescriptor, ToolInvocationRequest};
use agentrun_core::errors::ProviderError;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::Value;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;

const ERROR_BODY_LIMIT: usize = 512;

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider_id(&self) -> &str;

    /// Issues exactly one outbound call. No retries.
    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProviderRequest {
    pub model: String,
    pub system_prompt: Option<String>,
    /// Transcript without the system prompt.
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDescriptor>,
    pub response_schema: Option<Value>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl ProviderRequest {
    /// Splits system messages off the transcript into `system_prompt`.
    pub fn from_transcript(model: impl Into<String>, transcript: &[Message]) -> Self {
        let system_parts: Vec<&str> = transcript
            .iter()
            .filter(|message| message.role == Role::System)
            .filter_map(|message| message.content.as_deref())
            .collect();
        let system_prompt = (!system_parts.is_empty()).then(|| system_parts.join("\n\n"));

        Self {
            model: model.into(),
            system_prompt,
            messages: transcript
                .iter()
                .filter(|message| message.role != Role::System)
                .cloned()
                .collect(),
            tools: Vec::new(),
            response_schema: None,
            temperature: None,
            max_tokens: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProviderResponse {
    /// Model id reported by the vendor, when present.
    pub model: Option<String>,
    pub content: Option<String>,
    pub usage: TokenUsage,
    pub tool_calls: Vec<ToolInvocationRequest>,
}

/// Selects the adapter named by `llm.provider`.
pub fn build_provider(config: &LlmConfig) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
    let timeout = Duration::from_secs(config.timeout_secs);
    let adapter: Arc<dyn ProviderAdapter> = match config.provider {
        LlmProvider::OpenAi => Arc::new(OpenAiProvider::new(
            config.api_key.clone(),
            config.base_url.clone(),
            timeout,
        )?),
        LlmProvider::Anthropic => Arc::new(AnthropicProvider::new(
            config.api_key.clone(),
            config.base_url.clone(),
            timeout,
        )?),
    };
    Ok(adapter)
}

/// Ids of the tool calls that a tool-result message answers. Vendors reject
/// declared calls without a result, so adapters drop the unanswered ones.
pub(crate) fn answered_calls(messages: &[Message]) -> HashSet<&str> {
    messages
        .iter()
        .filter(|message| message.role == Role::Tool)
        .filter_map(|message| message.tool_call_id.as_deref())
        .collect()
}

pub(crate) fn http_client(provider: &str, timeout: Duration) -> Result<Client, ProviderError> {
    Client::builder().timeout(timeout).build().map_err(|error| ProviderError::Request {
        provider: provider.to_owned(),
        status: None,
        message: format!("could not build http client: {error}"),
    })
}

pub(crate) async fn send_json<T>(provider: &str, request: RequestBuilder) -> Result<T, ProviderError>
where
    T: DeserializeOwned,
{
    let response = request.send().await.map_err(|error| ProviderError::Request {
        provider: provider.to_owned(),
        status: error.status().map(|status| status.as_u16()),
        message: error.to_string(),
    })?;

    let status = response.status();
    let body = response.text().await.map_err(|error| ProviderError::Request {
        provider: provider.to_owned(),
        status: Some(status.as_u16()),
        message: format!("could not read response body: {error}"),
    })?;

    if !status.is_success() {
        return Err(ProviderError::Request {
            provider: provider.to_owned(),
            status: Some(status.as_u16()),
            message: truncate(&body, ERROR_BODY_LIMIT),
        });
    }

    serde_json::from_str(&body).map_err(|error| ProviderError::Decode {
        provider: provider.to_owned(),
        message: error.to_string(),
    })
}

pub(crate) fn trimmed_base_url(base_url: Option<String>, default: &str) -> String {
    base_url.unwrap_or_else(|| default.to_owned()).trim_end_matches('/').to_owned()
}

fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((index, _)) => format!("{}...", &text[..index]),
        None => text.to_owned(),
    }
}
