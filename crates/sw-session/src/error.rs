use sw_bridge::event_bus::BusError;
use sw_core::completion::CompletionError;
use sw_core::history::HistoryError;
use sw_core::types::SessionMode;

use crate::registry::RegistryError;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    #[error("session not found: `{0}`")]
    SessionNotFound(String),

    #[error("session already exists: `{0}`")]
    SessionExists(String),

    #[error("agent not registered: `{0}`")]
    AgentNotRegistered(String),

    #[error("swarm not registered: `{0}`")]
    SwarmNotRegistered(String),

    #[error("tool not registered: `{0}`")]
    ToolNotRegistered(String),

    #[error("agent `{agent}` is not part of swarm `{swarm}`")]
    AgentNotInSwarm { agent: String, swarm: String },

    #[error("topic `{0}` is reserved for internal use")]
    ReservedTopic(String),

    #[error("{method} requires a {expected} session, client `{client_id}` is {actual}")]
    ModeMismatch {
        method: &'static str,
        client_id: String,
        expected: SessionMode,
        actual: SessionMode,
    },

    #[error("agent `{agent}` is not the active agent of client `{client_id}`")]
    AgentNotActive { client_id: String, agent: String },

    #[error("navigation loop: client `{client_id}` already visited `{agent}`")]
    NavigationRecursion { client_id: String, agent: String },

    #[error("agent change failed for client `{client_id}`: {reason}")]
    Dispatcher { client_id: String, reason: String },

    #[error("tool failed: {0}")]
    Tool(String),

    #[error("execution task failed: {0}")]
    Join(String),

    #[error(transparent)]
    Completion(#[from] CompletionError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

pub type Result<T> = std::result::Result<T, SwarmError>;

impl From<tokio::task::JoinError> for SwarmError {
    fn from(err: tokio::task::JoinError) -> Self {
        SwarmError::Join(err.to_string())
    }
}
