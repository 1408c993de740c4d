use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::{AgentDefinition, AgentType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatRole {
    User,
    Assistant,
    System,
    Tool,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "User",
            ChatRole::Assistant => "Assistant",
            ChatRole::System => "System",
            ChatRole::Tool => "Tool",
        }
    }
}

impl FromStr for ChatRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "User" => Ok(ChatRole::User),
            "Assistant" => Ok(ChatRole::Assistant),
            "System" => Ok(ChatRole::System),
            "Tool" => Ok(ChatRole::Tool),
            other => anyhow::bail!("unknown chat role: {}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Idle,
    Thinking,
    Working,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "Idle",
            SessionStatus::Thinking => "Thinking",
            SessionStatus::Working => "Working",
            SessionStatus::Error => "Error",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Idle" => Ok(SessionStatus::Idle),
            "Thinking" => Ok(SessionStatus::Thinking),
            "Working" => Ok(SessionStatus::Working),
            "Error" => Ok(SessionStatus::Error),
            other => anyhow::bail!("unknown session status: {}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub role: ChatRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Only set on `Tool` messages.
    pub tool_call_id: Option<String>,
    pub tool_name: Option<String>,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            created_at: Utc::now(),
            tool_call_id: None,
            tool_name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }

    #[cfg(test)]
    pub fn tool(tool_call_id: &str, tool_name: &str, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            tool_name: Some(tool_name.into()),
            ..Self::new(ChatRole::Tool, content)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSession {
    pub id: Uuid,
    pub user_id: String,
    pub agent_type: AgentType,
    pub agent: AgentDefinition,
    pub status: SessionStatus,
    pub messages: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl AgentSession {
    /// A fresh idle session whose transcript holds only the agent's system prompt.
    pub fn new(user_id: impl Into<String>, agent: AgentDefinition) -> Self {
        let now = Utc::now();
        let seed = ChatMessage::system(agent.system_prompt.clone());
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            agent_type: agent.agent_type,
            agent,
            status: SessionStatus::Idle,
            messages: vec![seed],
            created_at: now,
            last_activity_at: now,
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
        self.last_activity_at = Utc::now();
    }
}
