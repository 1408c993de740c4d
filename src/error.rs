use thiserror::Error;
use uuid::Uuid;

use crate::catalog::AgentType;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("no agent found for type {0}")]
    UnknownAgent(AgentType),
    #[error("no tool client registered for agent type {0}")]
    NoClientRegistered(AgentType),
    #[error("failed to create session {0}, please try again")]
    SessionConflict(Uuid),
    #[error("session {0} not found")]
    SessionNotFound(Uuid),
    #[error("completion backend failed: {0:#}")]
    Completion(#[source] anyhow::Error),
    #[error("session store failed: {0:#}")]
    Store(#[source] anyhow::Error),
    #[error("turn cancelled")]
    Cancelled,
}

pub type HubResult<T> = Result<T, HubError>;
