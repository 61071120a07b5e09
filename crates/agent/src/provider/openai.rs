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

const PROVIDER_ID: &str = "openai";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const SCHEMA_NAME: &str = "structured_response";

/// Chat Completions adapter.
pub struct OpenAiProvider {
    client: Client,
    api_key: Option<SecretString>,
    base_url: String,
}

impl OpenAiProvider {
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
impl ProviderAdapter for OpenAiProvider {
    fn provider_id(&self) -> &str {
        PROVIDER_ID
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let api_key = self.credential()?;
        let body = ChatCompletionRequest::from_request(request);
        debug!(
            event_name = "agent.provider.request",
            provider = PROVIDER_ID,
            model = %request.model,
            messages = body.messages.len(),
            tools = body.tools.as_ref().map_or(0, Vec::len),
            "sending chat completion request"
        );

        let response: ChatCompletionResponse = send_json(
            PROVIDER_ID,
            self.client
                .post(format!("{}/chat/completions", self.base_url))
                .bearer_auth(api_key.expose_secret())
                .json(&body),
        )
        .await?;

        response.into_provider_response()
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

impl ChatCompletionRequest {
    fn from_request(request: &ProviderRequest) -> Self {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system_prompt) = &request.system_prompt {
            messages.push(WireMessage {
                role: "system",
                content: Some(system_prompt.clone()),
                tool_calls: None,
                tool_call_id: None,
            });
        }
        let answered = answered_calls(&request.messages);
        messages.extend(
            request
                .messages
                .iter()
                .filter_map(|message| WireMessage::from_message(message, &answered)),
        );

        let tools = (!request.tools.is_empty())
            .then(|| request.tools.iter().map(WireTool::from_descriptor).collect());

        let response_format = request.response_schema.as_ref().map(|schema| {
            json!({
                "type": "json_schema",
                "json_schema": { "name": SCHEMA_NAME, "schema": schema },
            })
        });

        Self {
            model: request.model.clone(),
            messages,
            tools,
            response_format,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        }
    }
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl WireMessage {
    /// `None` for an assistant turn left empty once unanswered calls are dropped.
    fn from_message(message: &Message, answered: &HashSet<&str>) -> Option<Self> {
        let role = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        let calls: Vec<WireToolCall> = message
            .tool_calls
            .iter()
            .filter(|call| answered.contains(call.id.as_str()))
            .map(|call| WireToolCall {
                id: call.id.clone(),
                kind: "function".to_owned(),
                function: WireFunctionCall {
                    name: call.tool_id.clone(),
                    arguments: call.arguments.to_string(),
                },
            })
            .collect();

        if message.role == Role::Assistant && message.content.is_none() && calls.is_empty() {
            return None;
        }

        Some(Self {
            role,
            content: message.content.clone(),
            tool_calls: (!calls.is_empty()).then_some(calls),
            tool_call_id: message.tool_call_id.clone(),
        })
    }
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction,
}

impl WireTool {
    fn from_descriptor(descriptor: &ToolDescriptor) -> Self {
        Self {
            kind: "function",
            function: WireFunction {
                name: descriptor.id.clone(),
                description: descriptor.description.clone(),
                parameters: descriptor.parameters.clone(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: WireFunctionCall,
}

fn function_kind() -> String {
    "function".to_owned()
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    total_tokens: Option<u64>,
}

impl From<Usage> for TokenUsage {
    fn from(usage: Usage) -> Self {
        let mut normalized = TokenUsage::new(usage.prompt_tokens, usage.completion_tokens);
        if let Some(total) = usage.total_tokens {
            normalized.total = total;
        }
        normalized
    }
}

impl ChatCompletionResponse {
    fn into_provider_response(self) -> Result<ProviderResponse, ProviderError> {
        let Some(choice) = self.choices.into_iter().next() else {
            return Err(ProviderError::Decode {
                provider: PROVIDER_ID.to_owned(),
                message: "response contained no choices".to_owned(),
            });
        };

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| ToolInvocationRequest {
                id: call.id,
                tool_id: call.function.name,
                arguments: parse_arguments(call.function.arguments),
            })
            .collect();

        Ok(ProviderResponse {
            model: self.model,
            content: choice.message.content.filter(|content| !content.is_empty()),
            usage: self.usage.map(TokenUsage::from).unwrap_or_default(),
            tool_calls,
        })
    }
}

/// Unparsable argument text is kept verbatim as a JSON string so the caller
/// can reject it instead of silently dropping it.
fn parse_arguments(raw: String) -> Value {
    if raw.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use agentrun_core::domain::{Message, ToolDescriptor, ToolInvocationRequest};
    use serde_json::json;

    use super::{ChatCompletionRequest, ChatCompletionResponse, OpenAiProvider};
    use crate::provider::{ProviderAdapter, ProviderRequest};

    fn request() -> ProviderRequest {
        let mut request = ProviderRequest::from_transcript(
            "gpt-4o",
            &[Message::system("you are a planner"), Message::user("plan a trip")],
        );
        request.tools = vec![ToolDescriptor::new(
            "search",
            "web search",
            json!({"type": "object", "properties": {"query": {"type": "string"}}}),
        )];
        request
    }

    #[tokio::test]
    async fn missing_credential_fails_before_any_network_call() {
        let provider = OpenAiProvider::new(
            None,
            Some("http://127.0.0.1:9".to_owned()),
            Duration::from_secs(1),
        )
        .expect("client");

        let error = provider.complete(&request()).await.expect_err("no credential");

        assert!(error.is_authentication());
    }

    #[test]
    fn tools_and_schema_are_translated_to_native_declarations() {
        let mut request = request();
        request.response_schema = Some(json!({"type": "object"}));
        request.messages.push(Message::assistant_tool_calls(
            None,
            vec![ToolInvocationRequest {
                id: "call_1".to_owned(),
                tool_id: "search".to_owned(),
                arguments: json!({"query": "lisbon"}),
            }],
        ));
        request.messages.push(Message::tool_result("call_1", "sunny"));

        let body = serde_json::to_value(ChatCompletionRequest::from_request(&request))
            .expect("serialize");

        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "search");
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["response_format"]["json_schema"]["schema"], json!({"type": "object"}));
        assert_eq!(
            body["messages"][2]["tool_calls"][0]["function"]["arguments"],
            "{\"query\":\"lisbon\"}"
        );
        assert_eq!(body["messages"][3]["tool_call_id"], "call_1");
    }

    #[test]
    fn failed_calls_are_not_declared_on_the_wire() {
        let mut request = request();
        request.messages.push(Message::assistant_tool_calls(
            None,
            vec![
                ToolInvocationRequest {
                    id: "call_broken".to_owned(),
                    tool_id: "search".to_owned(),
                    arguments: json!({}),
                },
                ToolInvocationRequest {
                    id: "call_ok".to_owned(),
                    tool_id: "search".to_owned(),
                    arguments: json!({"query": "porto"}),
                },
            ],
        ));
        request.messages.push(Message::tool_result("call_ok", "cloudy"));
        request.messages.push(Message::assistant_tool_calls(
            None,
            vec![ToolInvocationRequest {
                id: "call_lost".to_owned(),
                tool_id: "search".to_owned(),
                arguments: json!({}),
            }],
        ));

        let body = serde_json::to_value(ChatCompletionRequest::from_request(&request))
            .expect("serialize");
        let messages = body["messages"].as_array().expect("messages");

        assert_eq!(messages.len(), 4);
        let declared = messages[2]["tool_calls"].as_array().expect("tool calls");
        assert_eq!(declared.len(), 1);
        assert_eq!(declared[0]["id"], "call_ok");
        assert_eq!(messages[3]["role"], "tool");
    }

    #[test]
    fn response_normalizes_tool_calls_and_usage() {
        let response: ChatCompletionResponse = serde_json::from_value(json!({
            "model": "gpt-4o-2024-08-06",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [
                        {"id": "call_1", "type": "function", "function": {"name": "search", "arguments": "{\"query\":\"rust\"}"}},
                        {"id": "call_2", "type": "function", "function": {"name": "search", "arguments": "not json"}}
                    ]
                }
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 8, "total_tokens": 20}
        }))
        .expect("decode");

        let normalized = response.into_provider_response().expect("normalize");

        assert_eq!(normalized.content, None);
        assert_eq!(normalized.usage.total, 20);
        assert_eq!(normalized.tool_calls[0].arguments, json!({"query": "rust"}));
        assert_eq!(normalized.tool_calls[1].arguments, json!("not json"));
    }
}
