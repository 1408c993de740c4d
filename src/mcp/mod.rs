use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod executor;
pub mod gateway;
pub mod http_client;
pub mod personal;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema as a raw string; forwarded to the completion backend untouched.
    #[serde(default)]
    pub input_schema: Option<String>,
}

impl McpToolDefinition {
    pub fn new(name: &str, description: &str, input_schema: Option<&str>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: input_schema.map(Into::into),
        }
    }
}

fn new_call_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolCall {
    #[serde(default = "new_call_id")]
    pub id: String,
    pub tool_name: String,
    /// Opaque argument payload, usually a JSON object.
    #[serde(default)]
    pub arguments: String,
}

impl McpToolCall {
    #[cfg(test)]
    pub fn new(tool_name: &str, arguments: impl Into<String>) -> Self {
        Self { id: new_call_id(), tool_name: tool_name.into(), arguments: arguments.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolResult {
    pub tool_call_id: String,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

impl McpToolResult {
    pub fn ok(call: &McpToolCall, content: impl Into<String>) -> Self {
        Self { tool_call_id: call.id.clone(), content: content.into(), is_error: false }
    }

    pub fn error(call: &McpToolCall, content: impl Into<String>) -> Self {
        Self { tool_call_id: call.id.clone(), content: content.into(), is_error: true }
    }
}

/// Uniform handle over one external system's tools. The orchestrator never looks past this trait.
#[async_trait]
pub trait ToolClient: Send + Sync {
    async fn list_tools(&self) -> anyhow::Result<Vec<McpToolDefinition>>;
    async fn execute_tool(&self, call: &McpToolCall) -> anyhow::Result<McpToolResult>;
    async fn is_healthy(&self) -> anyhow::Result<bool>;
}
