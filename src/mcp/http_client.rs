use async_trait::async_trait;
use url::Url;

use super::{McpToolCall, McpToolDefinition, McpToolResult, ToolClient};

/// Proxies tool calls to an external tool server:
/// `GET tools`, `POST tools/call` and `GET health`, relative to the base url.
#[derive(Clone)]
pub struct HttpToolClient {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpToolClient {
    pub fn new(mut base_url: Url) -> Self {
        // Url::join drops the last segment unless the path ends with a slash.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self { client: reqwest::Client::new(), base_url }
    }

    fn endpoint(&self, path: &str) -> anyhow::Result<Url> {
        Ok(self.base_url.join(path)?)
    }
}

#[async_trait]
impl ToolClient for HttpToolClient {
    async fn list_tools(&self) -> anyhow::Result<Vec<McpToolDefinition>> {
        let resp = self.client.get(self.endpoint("tools")?).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("list tools failed: {}", resp.status());
        }
        Ok(resp.json().await?)
    }

    async fn execute_tool(&self, call: &McpToolCall) -> anyhow::Result<McpToolResult> {
        let resp = self.client.post(self.endpoint("tools/call")?).json(call).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("tool call {} failed: {}", call.tool_name, resp.status());
        }
        Ok(resp.json().await?)
    }

    async fn is_healthy(&self) -> anyhow::Result<bool> {
        let resp = self.client.get(self.endpoint("health")?).send().await?;
        Ok(resp.status().is_success())
    }
}
