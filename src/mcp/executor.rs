use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::gateway::ToolGateway;
use super::{McpToolCall, McpToolResult};
use crate::catalog::AgentType;

/// Runs tool calls for a completion loop. Never fails: every problem, including a
/// missing client, comes back as an error-flagged result the model can read.
#[derive(Clone)]
pub struct ToolExecutor {
    gateway: ToolGateway,
}

impl ToolExecutor {
    pub fn new(gateway: ToolGateway) -> Self {
        Self { gateway }
    }

    pub async fn execute(&self, agent_type: AgentType, call: &McpToolCall, cancel: &CancellationToken) -> McpToolResult {
        info!(tool = %call.tool_name, agent = %agent_type, "executing tool");

        let run = async {
            let client = self.gateway.client(agent_type)?;
            client.execute_tool(call).await
        };
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(anyhow::anyhow!("cancelled")),
            res = run => res,
        };

        let result = match outcome {
            Ok(result) => {
                info!(tool = %call.tool_name, is_error = result.is_error, "tool executed");
                result
            }
            Err(err) => {
                error!(tool = %call.tool_name, agent = %agent_type, error = %err, "failed to execute tool");
                McpToolResult::error(call, format!("Tool execution failed: {}", err))
            }
        };
        let outcome = if result.is_error { "error" } else { "ok" };
        counter!("ops_hub_tool_executions_total", "agent" => agent_type.as_str(), "outcome" => outcome).increment(1);
        result
    }
}
