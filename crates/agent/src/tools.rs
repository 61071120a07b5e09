use std::collections::HashMap;
use std::sync::Arc;

use agentrun_core::domain::ToolInvocationResult;
use agentrun_core::errors::ToolExecutionError;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

/// A capability the model can invoke by id.
#[async_trait]
pub trait Tool: Send + Sync {
    fn id(&self) -> &str;
    async fn invoke(&self, arguments: Value) -> Result<Value, ToolExecutionError>;
}

pub trait ToolRegistry: Send + Sync {
    fn lookup(&self, tool_id: &str) -> Option<Arc<dyn Tool>>;
}

#[derive(Clone, Default)]
pub struct InMemoryToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl InMemoryToolRegistry {
    pub fn register<T>(&mut self, tool: T)
    where
        T: Tool + 'static,
    {
        self.tools.insert(tool.id().to_string(), Arc::new(tool));
    }

    pub fn with_tool<T>(mut self, tool: T) -> Self
    where
        T: Tool + 'static,
    {
        self.register(tool);
        self
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl ToolRegistry for InMemoryToolRegistry {
    fn lookup(&self, tool_id: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(tool_id).cloned()
    }
}

/// Runs one tool call against the injected registry. Never fails: every
/// problem is reported through the returned result.
#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<dyn ToolRegistry>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<dyn ToolRegistry>) -> Self {
        Self { registry }
    }

    pub async fn execute(
        &self,
        call_id: &str,
        tool_id: &str,
        arguments: Value,
    ) -> ToolInvocationResult {
        let Some(tool) = self.registry.lookup(tool_id) else {
            let error = ToolExecutionError::NotFound(tool_id.to_string());
            warn!(
                event_name = "agent.tool.not_found",
                call_id,
                tool_id,
                "tool is not registered"
            );
            return ToolInvocationResult::failed(call_id, tool_id, error.to_string());
        };

        match tool.invoke(arguments).await {
            Ok(output) => {
                debug!(event_name = "agent.tool.completed", call_id, tool_id, "tool call succeeded");
                ToolInvocationResult::succeeded(call_id, tool_id, output)
            }
            Err(error) => {
                warn!(
                    event_name = "agent.tool.failed",
                    call_id,
                    tool_id,
                    error = %error,
                    "tool call failed"
                );
                ToolInvocationResult::failed(call_id, tool_id, error.to_string())
            }
        }
    }
}
