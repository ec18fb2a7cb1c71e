//! Read-only views over a client's conversation log.

use sw_core::history::{filter_by_agent, last_with_role};
use sw_core::types::{MessageRole, ModelMessage};
use sw_harness::context::MethodContext;

use crate::error::Result;
use crate::runtime::{enter, SwarmRuntime};

impl SwarmRuntime {
    /// The client's whole log, in commit order.
    pub async fn get_raw_history(&self, client_id: &str) -> Result<Vec<ModelMessage>> {
        let ctx = MethodContext::new("get_raw_history", client_id);
        enter(ctx, self.raw_history(client_id)).await
    }

    /// Messages committed by or on behalf of `agent_name`.
    pub async fn get_agent_history(
        &self,
        client_id: &str,
        agent_name: &str,
    ) -> Result<Vec<ModelMessage>> {
        let ctx = MethodContext::new("get_agent_history", client_id).with_agent(agent_name);
        enter(ctx, async {
            self.inner.registry.validate_agent(agent_name)?;
            let raw = self.raw_history(client_id).await?;
            Ok(filter_by_agent(&raw, agent_name))
        })
        .await
    }

    pub async fn get_last_user_message(&self, client_id: &str) -> Result<Option<String>> {
        self.last_content("get_last_user_message", client_id, MessageRole::User)
            .await
    }

    pub async fn get_last_assistant_message(&self, client_id: &str) -> Result<Option<String>> {
        self.last_content("get_last_assistant_message", client_id, MessageRole::Assistant)
            .await
    }

    pub async fn get_last_system_message(&self, client_id: &str) -> Result<Option<String>> {
        self.last_content("get_last_system_message", client_id, MessageRole::System)
            .await
    }

    async fn last_content(
        &self,
        method: &'static str,
        client_id: &str,
        role: MessageRole,
    ) -> Result<Option<String>> {
        let ctx = MethodContext::new(method, client_id);
        enter(ctx, async {
            let raw = self.raw_history(client_id).await?;
            Ok(last_with_role(&raw, role).map(|m| m.content.clone()))
        })
        .await
    }

    async fn raw_history(&self, client_id: &str) -> Result<Vec<ModelMessage>> {
        self.inner.sessions.validate(client_id)?;
        Ok(self.inner.history.list(client_id).await?)
    }
}
