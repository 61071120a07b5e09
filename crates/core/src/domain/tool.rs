use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A tool offered to the model for one request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub id: String,
    pub description: String,
    pub parameters: Value,
    /// Caller-supplied values merged under the model's arguments before execution.
    #[serde(default)]
    pub defaults: Map<String, Value>,
}

impl ToolDescriptor {
    pub fn new(id: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self { id: id.into(), description: description.into(), parameters, defaults: Map::new() }
    }

    pub fn with_default(mut self, key: impl Into<String>, value: Value) -> Self {
        self.defaults.insert(key.into(), value);
        self
    }

    /// Defaults form the base object; arguments overwrite matching keys.
    ///
    /// Returns `None` when the arguments are neither an object nor null.
    pub fn merge_arguments(&self, arguments: &Value) -> Option<Value> {
        let mut merged = self.defaults.clone();
        match arguments {
            Value::Object(provided) => {
                for (key, value) in provided {
                    merged.insert(key.clone(), value.clone());
                }
            }
            Value::Null => {}
            _ => return None,
        }
        Some(Value::Object(merged))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocationResult {
    pub call_id: String,
    pub tool_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolInvocationResult {
    pub fn succeeded(call_id: impl Into<String>, tool_id: impl Into<String>, output: Value) -> Self {
        Self {
            call_id: call_id.into(),
            tool_id: tool_id.into(),
            success: true,
            output: Some(output),
            error: None,
        }
    }

    pub fn failed(
        call_id: impl Into<String>,
        tool_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tool_id: tool_id.into(),
            success: false,
            output: None,
            error: Some(reason.into()),
        }
    }

    /// Text fed back to the model in the tool-result message.
    pub fn transcript_content(&self) -> String {
        match &self.output {
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ToolDescriptor, ToolInvocationResult};

    #[test]
    fn arguments_overwrite_defaults_on_collision() {
        let tool = ToolDescriptor::new("search", "web search", json!({"type": "object"}))
            .with_default("limit", json!(5))
            .with_default("region", json!("eu"));

        let merged = tool.merge_arguments(&json!({"query": "rust", "limit": 10}));

        assert_eq!(merged, Some(json!({"query": "rust", "limit": 10, "region": "eu"})));
    }

    #[test]
    fn null_arguments_yield_defaults_and_scalars_are_rejected() {
        let tool = ToolDescriptor::new("clock", "current time", json!({"type": "object"}))
            .with_default("tz", json!("UTC"));

        assert_eq!(tool.merge_arguments(&json!(null)), Some(json!({"tz": "UTC"})));
        assert_eq!(tool.merge_arguments(&json!("not-json")), None);
    }

    #[test]
    fn string_outputs_are_passed_through_verbatim() {
        let result = ToolInvocationResult::succeeded("c1", "echo", json!("plain text"));
        assert_eq!(result.transcript_content(), "plain text");

        let result = ToolInvocationResult::succeeded("c2", "calc", json!({"sum": 3}));
        assert_eq!(result.transcript_content(), "{\"sum\":3}");
    }
}
