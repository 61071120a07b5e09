use std::collections::HashSet;
use std::time::Duration;

use agentrun_core::domain::{Message, Role, TokenUsage, ToolDescriptor, ToolInvocationRequest};
use agentrun_core::errors::ProviderError;
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use super::{
    answered_calls, http_client, send_json, trimmed_base_url, ProviderAdapter, ProviderRequest,
    ProviderResponse,
};

const PROVIDER_ID: &str = "anthropic";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;
/// Tool whose forced input carries structured output.
const STRUCTURED_TOOL: &str = "structured_response";

/// Messages API adapter.
pub struct AnthropicProvider {
    client: Client,
    api_key: Option<SecretString>,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(
        api_key: Option<SecretString>,
        base_url: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(PROVIDER_ID, timeout)?,
            api_key,
            base_url: trimmed_base_url(base_url, DEFAULT_BASE_URL),
        })
    }

    fn credential(&self) -> Result<&SecretString, ProviderError> {
        self.api_key
            .as_ref()
            .filter(|key| !key.expose_secret().trim().is_empty())
            .ok_or_else(|| ProviderError::Authentication { provider: PROVIDER_ID.to_owned() })
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicProvider {
    fn provider_id(&self) -> &str {
        PROVIDER_ID
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let api_key = self.credential()?;
        let body = MessagesRequest::from_request(request);
        debug!(
            event_name = "agent.provider.request",
            provider = PROVIDER_ID,
            model = %request.model,
            messages = body.messages.len(),
            tools = body.tools.as_ref().map_or(0, Vec::len),
            "sending messages request"
        );

        let response: MessagesResponse = send_json(
            PROVIDER_ID,
            self.client
                .post(format!("{}/messages", self.base_url))
                .header("x-api-key", api_key.expose_secret())
                .header("anthropic-version", API_VERSION)
                .json(&body),
        )
        .await?;

        Ok(response.into_provider_response())
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

impl MessagesRequest {
    fn from_request(request: &ProviderRequest) -> Self {
        let mut tools: Vec<WireTool> = request.tools.iter().map(WireTool::from_descriptor).collect();

        // With no other tools the structured tool is forced; otherwise the model
        // must pick some tool, the structured one included.
        let tool_choice = request.response_schema.as_ref().map(|schema| {
            tools.push(WireTool {
                name: STRUCTURED_TOOL.to_owned(),
                description: "Return the final answer using this schema.".to_owned(),
                input_schema: schema.clone(),
            });
            if request.tools.is_empty() {
                json!({ "type": "tool", "name": STRUCTURED_TOOL })
            } else {
                json!({ "type": "any" })
            }
        });

        Self {
            model: request.model.clone(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system: request.system_prompt.clone(),
            messages: merge_turns(&request.messages),
            tools: (!tools.is_empty()).then_some(tools),
            tool_choice,
            temperature: request.temperature,
        }
    }
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
    ToolResult { tool_use_id: String, content: String },
}

#[derive(Debug, Serialize)]
struct WireTool {
    name: String,
    description: String,
    input_schema: Value,
}

impl WireTool {
    fn from_descriptor(descriptor: &ToolDescriptor) -> Self {
        Self {
            name: descriptor.id.clone(),
            description: descriptor.description.clone(),
            input_schema: descriptor.parameters.clone(),
        }
    }
}

/// Converts the transcript into alternating user/assistant turns. Tool results
/// travel as user content, and consecutive same-role messages share one turn.
fn merge_turns(messages: &[Message]) -> Vec<WireMessage> {
    let answered: HashSet<&str> = answered_calls(messages);
    let mut turns: Vec<WireMessage> = Vec::with_capacity(messages.len());

    for message in messages {
        let (role, blocks) = match message.role {
            Role::System => continue,
            Role::User => ("user", text_blocks(message)),
            Role::Tool => (
                "user",
                vec![ContentBlock::ToolResult {
                    tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                    content: message.content.clone().unwrap_or_default(),
                }],
            ),
            Role::Assistant => {
                let mut blocks = text_blocks(message);
                let kept =
                    message.tool_calls.iter().filter(|call| answered.contains(call.id.as_str()));
                blocks.extend(kept.map(|call| ContentBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.tool_id.clone(),
                    input: tool_input(&call.arguments),
                }));
                ("assistant", blocks)
            }
        };

        if blocks.is_empty() {
            continue;
        }
        match turns.last_mut() {
            Some(last) if last.role == role => last.content.extend(blocks),
            _ => turns.push(WireMessage { role, content: blocks }),
        }
    }

    turns
}

fn text_blocks(message: &Message) -> Vec<ContentBlock> {
    message
        .content
        .as_ref()
        .filter(|text| !text.is_empty())
        .map(|text| vec![ContentBlock::Text { text: text.clone() }])
        .unwrap_or_default()
}

fn tool_input(arguments: &Value) -> Value {
    match arguments {
        Value::Object(_) => arguments.clone(),
        _ => json!({}),
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    model: Option<String>,
    #[serde(default)]
    content: Vec<ResponseBlock>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl MessagesResponse {
    fn into_provider_response(self) -> ProviderResponse {
        let mut text = String::new();
        let mut structured = None;
        let mut tool_calls = Vec::new();

        for block in self.content {
            match block {
                ResponseBlock::Text { text: part } => text.push_str(&part),
                ResponseBlock::ToolUse { name, input, .. } if name == STRUCTURED_TOOL => {
                    structured = Some(input.to_string());
                }
                ResponseBlock::ToolUse { id, name, input } => {
                    tool_calls.push(ToolInvocationRequest { id, tool_id: name, arguments: input });
                }
                ResponseBlock::Other => {}
            }
        }

        let usage = self.usage.unwrap_or_default();
        ProviderResponse {
            model: self.model,
            content: structured.or_else(|| (!text.is_empty()).then_some(text)),
            usage: TokenUsage::new(usage.input_tokens, usage.output_tokens),
            tool_calls,
        }
    }
}
