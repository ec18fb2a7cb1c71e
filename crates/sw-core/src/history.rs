//! Per-client conversation log shared by every agent of a swarm.
//!
//! The log is a single ordered list per client. Each agent reads it through
//! its own [`ClientHistory`] handle, which filters out what the agent should
//! not see when building a completion request.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::types::{AgentName, ClientId, ExecutionMode, MessageRole, ModelMessage};

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("history storage failed: {0}")]
    Storage(String),
}

/// Storage backend for client histories.
#[async_trait]
pub trait HistoryAdapter: Send + Sync {
    async fn push(&self, client_id: &str, message: ModelMessage) -> Result<(), HistoryError>;
    async fn list(&self, client_id: &str) -> Result<Vec<ModelMessage>, HistoryError>;
    async fn dispose(&self, client_id: &str) -> Result<(), HistoryError>;
}

// ---------------------------------------------------------------------------
// InMemoryHistory
// ---------------------------------------------------------------------------

/// Default adapter: one `Vec` per client, held in memory.
#[derive(Debug, Default)]
pub struct InMemoryHistory {
    items: DashMap<ClientId, Vec<ModelMessage>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryAdapter for InMemoryHistory {
    async fn push(&self, client_id: &str, message: ModelMessage) -> Result<(), HistoryError> {
        self.items
            .entry(client_id.to_string())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn list(&self, client_id: &str) -> Result<Vec<ModelMessage>, HistoryError> {
        Ok(self
            .items
            .get(client_id)
            .map(|v| v.clone())
            .unwrap_or_default())
    }

    async fn dispose(&self, client_id: &str) -> Result<(), HistoryError> {
        self.items.remove(client_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ClientHistory
// ---------------------------------------------------------------------------

/// One agent's handle onto a client's shared log.
#[derive(Clone)]
pub struct ClientHistory {
    client_id: ClientId,
    agent_name: AgentName,
    keep_messages: usize,
    adapter: Arc<dyn HistoryAdapter>,
}

impl std::fmt::Debug for ClientHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHistory")
            .field("client_id", &self.client_id)
            .field("agent_name", &self.agent_name)
            .field("keep_messages", &self.keep_messages)
            .finish()
    }
}

impl ClientHistory {
    pub fn new(
        client_id: impl Into<ClientId>,
        agent_name: impl Into<AgentName>,
        keep_messages: usize,
        adapter: Arc<dyn HistoryAdapter>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            agent_name: agent_name.into(),
            keep_messages,
            adapter,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub async fn push(&self, message: ModelMessage) -> Result<(), HistoryError> {
        debug!(
            client_id = %self.client_id,
            agent_name = %self.agent_name,
            role = %message.role,
            "history push"
        );
        self.adapter.push(&self.client_id, message).await
    }

    /// Push a message attributed to this handle's agent.
    pub async fn push_as(
        &self,
        role: MessageRole,
        content: impl Into<String>,
        mode: ExecutionMode,
    ) -> Result<(), HistoryError> {
        self.push(ModelMessage::new(role, self.agent_name.clone(), content, mode))
            .await
    }

    /// The full log, unfiltered.
    pub async fn to_array_for_raw(&self) -> Result<Vec<ModelMessage>, HistoryError> {
        self.adapter.list(&self.client_id).await
    }

    /// The messages sent to a completion on behalf of this agent.
    pub async fn to_array_for_agent(&self, prompt: &str) -> Result<Vec<ModelMessage>, HistoryError> {
        let raw = self.adapter.list(&self.client_id).await?;
        Ok(agent_view(&raw, &self.agent_name, prompt, self.keep_messages))
    }

    /// Releases this handle. The shared log belongs to the client and
    /// survives agent swaps; it is dropped only through the adapter.
    pub async fn dispose(&self) -> Result<(), HistoryError> {
        debug!(client_id = %self.client_id, agent_name = %self.agent_name, "history handle disposed");
        Ok(())
    }
}

/// Build an agent's completion view of a raw log.
///
/// Layout: the prompt as a system message, then the agent's own system
/// messages, then the trailing `keep` conversation messages. A flush marker
/// discards everything before it. Tool results and tool-call requests from
/// other agents are hidden.
pub fn agent_view(
    raw: &[ModelMessage],
    agent_name: &str,
    prompt: &str,
    keep: usize,
) -> Vec<ModelMessage> {
    let start = raw
        .iter()
        .rposition(|m| m.role == MessageRole::Flush)
        .map(|idx| idx + 1)
        .unwrap_or(0);
    let window = &raw[start..];

    let system = window
        .iter()
        .filter(|m| m.role == MessageRole::System && m.agent_name == agent_name);

    let common: Vec<&ModelMessage> = window
        .iter()
        .filter(|m| m.role != MessageRole::System)
        .filter(|m| {
            let foreign = m.agent_name != agent_name;
            !(foreign && (m.role == MessageRole::Tool || m.has_tool_calls()))
        })
        .collect();
    let skip = common.len().saturating_sub(keep);

    let mut out = Vec::with_capacity(1 + common.len() - skip);
    out.push(ModelMessage::new(
        MessageRole::System,
        agent_name,
        prompt,
        ExecutionMode::Tool,
    ));
    out.extend(system.cloned());
    out.extend(common.into_iter().skip(skip).cloned());
    out
}

/// Messages attributed to one agent, in log order.
pub fn filter_by_agent(raw: &[ModelMessage], agent_name: &str) -> Vec<ModelMessage> {
    raw.iter()
        .filter(|m| m.agent_name == agent_name)
        .cloned()
        .collect()
}

/// Most recent message with the given role.
pub fn last_with_role(raw: &[ModelMessage], role: MessageRole) -> Option<&ModelMessage> {
    raw.iter().rev().find(|m| m.role == role)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolCall;

    fn msg(role: MessageRole, agent: &str, content: &str) -> ModelMessage {
        ModelMessage::new(role, agent, content, ExecutionMode::User)
    }

    #[test]
    fn agent_view_starts_with_prompt() {
        let view = agent_view(&[], "triage", "you triage", 5);
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].role, MessageRole::System);
        assert_eq!(view[0].content, "you triage");
    }

    #[test]
    fn agent_view_hides_foreign_tool_traffic() {
        let raw = vec![
            msg(MessageRole::User, "sales", "hi"),
            msg(MessageRole::Assistant, "sales", "calling")
                .with_tool_calls(vec![ToolCall::new("lookup", serde_json::json!({}))]),
            msg(MessageRole::Tool, "sales", "result"),
            msg(MessageRole::Assistant, "sales", "done"),
        ];
        let view = agent_view(&raw, "triage", "p", 10);
        let contents: Vec<&str> = view.iter().skip(1).map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["hi", "done"]);
    }

    #[test]
    fn agent_view_keeps_only_own_system_messages() {
        let raw = vec![
            msg(MessageRole::System, "sales", "sales rule"),
            msg(MessageRole::System, "triage", "triage rule"),
            msg(MessageRole::User, "triage", "hello"),
        ];
        let view = agent_view(&raw, "triage", "p", 10);
        assert_eq!(view.len(), 3);
        assert_eq!(view[1].content, "triage rule");
        assert_eq!(view[2].content, "hello");
    }

    #[test]
    fn agent_view_truncates_to_keep() {
        let raw: Vec<ModelMessage> = (0..10)
            .map(|i| msg(MessageRole::User, "a", &i.to_string()))
            .collect();
        let view = agent_view(&raw, "a", "p", 3);
        let contents: Vec<&str> = view.iter().skip(1).map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["7", "8", "9"]);
    }

    #[test]
    fn flush_discards_earlier_messages() {
        let raw = vec![
            msg(MessageRole::System, "a", "old rule"),
            msg(MessageRole::User, "a", "old"),
            msg(MessageRole::Flush, "a", ""),
            msg(MessageRole::User, "a", "new"),
        ];
        let view = agent_view(&raw, "a", "p", 10);
        assert_eq!(view.len(), 2);
        assert_eq!(view[1].content, "new");
    }

    #[test]
    fn last_with_role_finds_latest() {
        let raw = vec![
            msg(MessageRole::User, "a", "first"),
            msg(MessageRole::Assistant, "a", "reply"),
            msg(MessageRole::User, "a", "second"),
        ];
        assert_eq!(last_with_role(&raw, MessageRole::User).unwrap().content, "second");
        assert!(last_with_role(&raw, MessageRole::Tool).is_none());
    }

    #[tokio::test]
    async fn in_memory_history_isolates_clients() {
        let adapter: Arc<dyn HistoryAdapter> = Arc::new(InMemoryHistory::new());
        let c1 = ClientHistory::new("c1", "a", 5, adapter.clone());
        let c2 = ClientHistory::new("c2", "a", 5, adapter.clone());
        c1.push_as(MessageRole::User, "hello", ExecutionMode::User)
            .await
            .unwrap();
        assert_eq!(c1.to_array_for_raw().await.unwrap().len(), 1);
        assert!(c2.to_array_for_raw().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn handle_dispose_keeps_shared_log() {
        let adapter: Arc<dyn HistoryAdapter> = Arc::new(InMemoryHistory::new());
        let a = ClientHistory::new("c1", "a", 5, adapter.clone());
        a.push_as(MessageRole::User, "hello", ExecutionMode::User)
            .await
            .unwrap();
        a.dispose().await.unwrap();
        let b = ClientHistory::new("c1", "b", 5, adapter.clone());
        assert_eq!(b.to_array_for_raw().await.unwrap().len(), 1);
        adapter.dispose("c1").await.unwrap();
        assert!(b.to_array_for_raw().await.unwrap().is_empty());
    }
}
