use clap::Args;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::catalog::AgentType;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CompletionParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Everything the completion backend needs to reach an OpenAI-compatible endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub params: CompletionParams,
}

/// Binds an agent type to the base URL of its tool server, written `Type=URL`.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolEndpoint {
    pub agent_type: AgentType,
    pub base_url: Url,
}

pub fn parse_tool_endpoint(raw: &str) -> Result<ToolEndpoint, String> {
    let (agent, url) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected AGENT=URL, got `{}`", raw))?;
    let agent_type = agent.parse::<AgentType>().map_err(|e| e.to_string())?;
    let base_url = Url::parse(url.trim()).map_err(|e| format!("invalid tool endpoint url `{}`: {}", url, e))?;
    Ok(ToolEndpoint { agent_type, base_url })
}

#[derive(Debug, Clone, Args)]
pub struct HubSettings {
    #[arg(long, env = "OPS_HUB_LISTEN", default_value = "127.0.0.1:7171")]
    pub listen: String,

    /// SQLite url; defaults to the XDG data directory.
    #[arg(long, env = "OPS_HUB_DATABASE_URL")]
    pub database_url: Option<String>,

    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub completion_base_url: String,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub completion_api_key: Option<String>,

    #[arg(long, env = "OPS_HUB_MODEL", default_value = "gpt-4o-mini")]
    pub model: String,

    #[arg(long)]
    pub temperature: Option<f32>,

    #[arg(long)]
    pub max_tokens: Option<u32>,

    #[arg(
        long = "tool-endpoint",
        env = "OPS_HUB_TOOL_ENDPOINTS",
        value_delimiter = ',',
        value_parser = parse_tool_endpoint
    )]
    pub tool_endpoints: Vec<ToolEndpoint>,
}

impl HubSettings {
    pub fn completion(&self) -> CompletionSettings {
        CompletionSettings {
            base_url: self.completion_base_url.clone(),
            api_key: self.completion_api_key.clone(),
            model: self.model.clone(),
            params: CompletionParams {
                temperature: self.temperature,
                max_tokens: self.max_tokens,
            },
        }
    }

    /// Explicitly configured endpoint for `agent_type`; the last entry wins.
    pub fn tool_endpoint(&self, agent_type: AgentType) -> Option<&Url> {
        self.tool_endpoints
            .iter()
            .rev()
            .find(|e| e.agent_type == agent_type)
            .map(|e| &e.base_url)
    }
}
