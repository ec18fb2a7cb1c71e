use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{AgentName, ClientId, ExecutionMode, ModelMessage, ToolName};

/// Function schema advertised to a completion for one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: ToolName,
    pub description: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// Everything a completion provider receives for one model call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionArgs {
    pub client_id: ClientId,
    pub agent_name: AgentName,
    pub mode: ExecutionMode,
    pub messages: Vec<ModelMessage>,
    #[serde(default)]
    pub tools: Vec<ToolSchema>,
}

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("completion provider failed: {0}")]
    Provider(String),
    #[error("completion returned an invalid message: {0}")]
    InvalidMessage(String),
}

/// A language-model backend. Implementations return one assistant message,
/// which may carry tool calls.
#[async_trait]
pub trait Completion: Send + Sync {
    async fn get_completion(&self, args: CompletionArgs) -> Result<ModelMessage, CompletionError>;
}
