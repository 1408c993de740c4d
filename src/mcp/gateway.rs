use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};

use super::http_client::HttpToolClient;
use super::personal::PersonalToolClient;
use super::ToolClient;
use crate::catalog::{AgentCatalog, AgentType};
use crate::error::{HubError, HubResult};
use crate::settings::HubSettings;

/// Agent type to tool client table. Filled once at startup, read-only afterwards.
#[derive(Clone, Default)]
pub struct ToolGateway {
    clients: Arc<HashMap<AgentType, Arc<dyn ToolClient>>>,
}

impl ToolGateway {
    pub fn new(clients: impl IntoIterator<Item = (AgentType, Arc<dyn ToolClient>)>) -> Self {
        Self { clients: Arc::new(clients.into_iter().collect()) }
    }

    /// Wires every enabled catalog agent to its tool backend: an explicit
    /// `--tool-endpoint`, else the definition's own endpoint, else the in-process
    /// plugins for the personal agent. Anything else stays unregistered.
    pub fn from_config(catalog: &AgentCatalog, settings: &HubSettings) -> anyhow::Result<Self> {
        let mut clients: Vec<(AgentType, Arc<dyn ToolClient>)> = Vec::new();
        for agent in catalog.all().iter().filter(|a| a.enabled) {
            let endpoint = match settings.tool_endpoint(agent.agent_type) {
                Some(url) => Some(url.clone()),
                None => agent.tool_endpoint.as_deref().map(url::Url::parse).transpose()?,
            };
            match endpoint {
                Some(url) => {
                    info!(agent = %agent.agent_type, endpoint = %url, "registered http tool client");
                    clients.push((agent.agent_type, Arc::new(HttpToolClient::new(url))));
                }
                None if agent.agent_type == AgentType::Personal => {
                    info!(agent = %agent.agent_type, "registered personal plugin tool client");
                    clients.push((agent.agent_type, Arc::new(PersonalToolClient::with_default_plugins())));
                }
                None => info!(agent = %agent.agent_type, "no tool backend configured"),
            }
        }
        Ok(Self::new(clients))
    }

    pub fn client(&self, agent_type: AgentType) -> HubResult<Arc<dyn ToolClient>> {
        self.clients
            .get(&agent_type)
            .cloned()
            .ok_or(HubError::NoClientRegistered(agent_type))
    }

    pub fn registered(&self) -> Vec<AgentType> {
        let mut types: Vec<_> = self.clients.keys().copied().collect();
        types.sort();
        types
    }

    /// Probes every client concurrently. A probe that errors counts as unhealthy.
    pub async fn health_status(&self) -> BTreeMap<AgentType, bool> {
        let probes = self.clients.iter().map(|(agent_type, client)| async move {
            let healthy = match client.is_healthy().await {
                Ok(healthy) => healthy,
                Err(err) => {
                    warn!(agent = %agent_type, error = %err, "health probe failed");
                    false
                }
            };
            (*agent_type, healthy)
        });
        join_all(probes).await.into_iter().collect()
    }
}
