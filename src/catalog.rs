use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Domain an agent operates in. One catalog entry and at most one tool client per type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AgentType {
    GitHub,
    Azure,
    AzureDevOps,
    DotNetDev,
    AiLlm,
    DevOps,
    Personal,
}

impl AgentType {
    pub const ALL: [AgentType; 7] = [
        AgentType::GitHub,
        AgentType::Azure,
        AgentType::AzureDevOps,
        AgentType::DotNetDev,
        AgentType::AiLlm,
        AgentType::DevOps,
        AgentType::Personal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::GitHub => "GitHub",
            AgentType::Azure => "Azure",
            AgentType::AzureDevOps => "AzureDevOps",
            AgentType::DotNetDev => "DotNetDev",
            AgentType::AiLlm => "AiLlm",
            AgentType::DevOps => "DevOps",
            AgentType::Personal => "Personal",
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| anyhow::anyhow!("unknown agent type: {}", s))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    pub agent_type: AgentType,
    pub system_prompt: String,
    pub avatar_url: Option<String>,
    /// Base URL of the tool server backing this agent, if it has one.
    pub tool_endpoint: Option<String>,
    pub enabled: bool,
}

impl AgentDefinition {
    pub fn new(id: &str, name: &str, agent_type: AgentType, description: &str, system_prompt: &str) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            agent_type,
            system_prompt: system_prompt.into(),
            avatar_url: None,
            tool_endpoint: None,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UserProfile {
    pub id: String,
    pub display_name: String,
    pub email: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub assigned_agents: Vec<AgentType>,
}

/// Read-only registry of agent definitions, built once at startup.
#[derive(Debug, Clone)]
pub struct AgentCatalog {
    agents: Vec<AgentDefinition>,
}

impl AgentCatalog {
    /// Builds a catalog from `agents`, keeping the first definition of each type.
    pub fn new(agents: Vec<AgentDefinition>) -> Self {
        let mut seen = HashSet::new();
        let agents = agents
            .into_iter()
            .filter(|a| {
                let fresh = seen.insert(a.agent_type);
                if !fresh {
                    tracing::warn!(agent = %a.agent_type, id = %a.id, "duplicate agent type in catalog, ignoring");
                }
                fresh
            })
            .collect();
        Self { agents }
    }

    pub fn builtin() -> Self {
        Self::new(vec![
            AgentDefinition::new(
                "github-agent",
                "GitHub Agent",
                AgentType::GitHub,
                "Manages GitHub repositories, pull requests, issues, and workflows.",
                "You are a GitHub operations assistant. Help users manage repositories, review pull requests, triage issues, and configure GitHub Actions workflows. Keep guidance concise and actionable.",
            ),
            AgentDefinition::new(
                "azure-agent",
                "Azure Agent",
                AgentType::Azure,
                "Manages Azure cloud resources, deployments, and monitoring.",
                "You are an Azure cloud assistant. Help users provision and manage Azure resources, troubleshoot deployments, monitor services, and keep cloud costs under control.",
            ),
            AgentDefinition::new(
                "ado-agent",
                "Azure DevOps Agent",
                AgentType::AzureDevOps,
                "Manages Azure DevOps projects, pipelines, boards, and artifacts.",
                "You are an Azure DevOps assistant. Help users manage work items, configure build and release pipelines, organize boards, and manage artifacts.",
            ),
            AgentDefinition::new(
                "dotnet-dev-agent",
                ".NET Developer Agent",
                AgentType::DotNetDev,
                "Assists with .NET development, code reviews, and architectural guidance.",
                "You are a .NET development assistant. Help users write, review, and refactor C# and .NET code, and advise on architecture, testing, and performance.",
            ),
            AgentDefinition::new(
                "ai-llm-agent",
                "AI/LLM Agent",
                AgentType::AiLlm,
                "Assists with AI model integration, prompt engineering, and LLM operations.",
                "You are an AI and LLM operations assistant. Help users integrate models, craft prompts, manage model deployments, and apply responsible AI practices.",
            ),
            AgentDefinition::new(
                "devops-agent",
                "DevOps Agent",
                AgentType::DevOps,
                "Manages infrastructure as code, CI/CD pipelines, and platform engineering.",
                "You are a DevOps and platform engineering assistant. Help users manage infrastructure as code, CI/CD pipelines, monitoring, and reliability practices.",
            ),
            AgentDefinition::new(
                "personal-agent",
                "Personal Assistant Agent",
                AgentType::Personal,
                "Provides general productivity assistance, scheduling, and task management.",
                "You are a personal productivity assistant. Help users manage tasks and calendars, organize information, and draft communications.",
            ),
        ])
    }

    pub fn all(&self) -> &[AgentDefinition] {
        &self.agents
    }

    pub fn get(&self, agent_type: AgentType) -> Option<&AgentDefinition> {
        self.agents.iter().find(|a| a.agent_type == agent_type)
    }

    /// Enabled agents visible to `user`. An empty assignment list means every enabled agent.
    pub fn for_user(&self, user: &UserProfile) -> Vec<&AgentDefinition> {
        self.agents
            .iter()
            .filter(|a| a.enabled)
            .filter(|a| user.assigned_agents.is_empty() || user.assigned_agents.contains(&a.agent_type))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_lookup_matches_query_type() {
        let catalog = AgentCatalog::builtin();
        assert_eq!(catalog.all().len(), AgentType::ALL.len());
        for t in AgentType::ALL {
            let def = catalog.get(t).unwrap();
            assert!(def.enabled);
            assert_eq!(def.agent_type, t);
            assert!(!def.system_prompt.is_empty());
        }
    }

    #[test]
    fn for_user_filters_by_assignment_and_enablement() {
        let mut azure = AgentDefinition::new("azure", "Azure", AgentType::Azure, "Azure agent", "You are Azure agent.");
        azure.enabled = false;
        let catalog = AgentCatalog::new(vec![
            AgentDefinition::new("github", "GitHub", AgentType::GitHub, "GitHub agent", "You are GitHub agent."),
            azure,
            AgentDefinition::new("devops", "DevOps", AgentType::DevOps, "DevOps agent", "You are DevOps agent."),
        ]);

        let everyone = UserProfile::default();
        let types: Vec<_> = catalog.for_user(&everyone).iter().map(|a| a.agent_type).collect();
        assert_eq!(types, vec![AgentType::GitHub, AgentType::DevOps]);

        let assigned = UserProfile {
            assigned_agents: vec![AgentType::Azure, AgentType::DevOps],
            ..UserProfile::default()
        };
        let types: Vec<_> = catalog.for_user(&assigned).iter().map(|a| a.agent_type).collect();
        assert_eq!(types, vec![AgentType::DevOps]);
    }

    #[test]
    fn duplicate_types_keep_first_definition() {
        let catalog = AgentCatalog::new(vec![
            AgentDefinition::new("first", "First", AgentType::GitHub, "", "one"),
            AgentDefinition::new("second", "Second", AgentType::GitHub, "", "two"),
        ]);
        assert_eq!(catalog.all().len(), 1);
        assert_eq!(catalog.get(AgentType::GitHub).unwrap().id, "first");
        assert!(catalog.get(AgentType::Azure).is_none());
    }

    #[test]
    fn agent_type_parses_case_insensitively() {
        assert_eq!("azuredevops".parse::<AgentType>().unwrap(), AgentType::AzureDevOps);
        assert_eq!(" GitHub ".parse::<AgentType>().unwrap(), AgentType::GitHub);
        assert!("jira".parse::<AgentType>().is_err());
    }
}
