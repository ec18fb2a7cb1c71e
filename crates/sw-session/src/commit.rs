//! History writes that only land while the named agent is still active.
//!
//! Every operation takes the agent the caller believes is active. If a
//! navigation replaced that agent in the meantime the write is logged and
//! dropped. The `_force` siblings write to whichever agent is active.

use std::future::Future;
use std::sync::Arc;

use sw_core::types::{ExecutionMode, ToolRequest};
use sw_harness::context::MethodContext;

use crate::agent::ClientAgent;
use crate::error::Result;
use crate::runtime::{enter, SwarmRuntime};

impl SwarmRuntime {
    /// Shared body of every commit: validate, resolve the target agent, then
    /// write. The check and the write share the `change-agent` lane, so a
    /// write either lands before a switch or is skipped. `Ok(None)` means
    /// the write was skipped.
    async fn commit_with<F, Fut, T>(
        &self,
        method: &'static str,
        client_id: &str,
        agent_name: Option<&str>,
        write: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce(Arc<ClientAgent>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut ctx = MethodContext::new(method, client_id);
        if let Some(agent_name) = agent_name {
            ctx = ctx.with_agent(agent_name);
        }
        enter(
            ctx,
            self.with_active_agent(method, client_id, agent_name, |_, agent| write(agent)),
        )
        .await
    }

    pub async fn commit_assistant_message(
        &self,
        content: &str,
        client_id: &str,
        agent_name: &str,
    ) -> Result<()> {
        self.commit_with("commit_assistant_message", client_id, Some(agent_name), |agent| async move {
            agent.commit_assistant_message(content).await
        })
        .await
        .map(drop)
    }

    pub async fn commit_assistant_message_force(&self, content: &str, client_id: &str) -> Result<()> {
        self.commit_with("commit_assistant_message_force", client_id, None, |agent| async move {
            agent.commit_assistant_message(content).await
        })
        .await
        .map(drop)
    }

    pub async fn commit_system_message(
        &self,
        content: &str,
        client_id: &str,
        agent_name: &str,
    ) -> Result<()> {
        self.commit_with("commit_system_message", client_id, Some(agent_name), |agent| async move {
            agent.commit_system_message(content).await
        })
        .await
        .map(drop)
    }

    pub async fn commit_system_message_force(&self, content: &str, client_id: &str) -> Result<()> {
        self.commit_with("commit_system_message_force", client_id, None, |agent| async move {
            agent.commit_system_message(content).await
        })
        .await
        .map(drop)
    }

    pub async fn commit_developer_message(
        &self,
        content: &str,
        client_id: &str,
        agent_name: &str,
    ) -> Result<()> {
        self.commit_with("commit_developer_message", client_id, Some(agent_name), |agent| async move {
            agent.commit_developer_message(content).await
        })
        .await
        .map(drop)
    }

    pub async fn commit_developer_message_force(&self, content: &str, client_id: &str) -> Result<()> {
        self.commit_with("commit_developer_message_force", client_id, None, |agent| async move {
            agent.commit_developer_message(content).await
        })
        .await
        .map(drop)
    }

    pub async fn commit_user_message(
        &self,
        content: &str,
        mode: ExecutionMode,
        client_id: &str,
        agent_name: &str,
    ) -> Result<()> {
        self.commit_with("commit_user_message", client_id, Some(agent_name), |agent| async move {
            agent.commit_user_message(content, mode).await
        })
        .await
        .map(drop)
    }

    pub async fn commit_user_message_force(
        &self,
        content: &str,
        mode: ExecutionMode,
        client_id: &str,
    ) -> Result<()> {
        self.commit_with("commit_user_message_force", client_id, None, |agent| async move {
            agent.commit_user_message(content, mode).await
        })
        .await
        .map(drop)
    }

    /// Answer tool call `tool_id` with `content`.
    pub async fn commit_tool_output(
        &self,
        tool_id: &str,
        content: &str,
        client_id: &str,
        agent_name: &str,
    ) -> Result<()> {
        self.commit_with("commit_tool_output", client_id, Some(agent_name), |agent| async move {
            agent.commit_tool_output(tool_id, content).await
        })
        .await
        .map(drop)
    }

    pub async fn commit_tool_output_force(
        &self,
        tool_id: &str,
        content: &str,
        client_id: &str,
    ) -> Result<()> {
        self.commit_with("commit_tool_output_force", client_id, None, |agent| async move {
            agent.commit_tool_output(tool_id, content).await
        })
        .await
        .map(drop)
    }

    /// Start the agent's completion view over after this point.
    pub async fn commit_flush(&self, client_id: &str, agent_name: &str) -> Result<()> {
        self.commit_with("commit_flush", client_id, Some(agent_name), |agent| async move {
            agent.commit_flush().await
        })
        .await
        .map(drop)
    }

    pub async fn commit_flush_force(&self, client_id: &str) -> Result<()> {
        self.commit_with("commit_flush_force", client_id, None, |agent| async move {
            agent.commit_flush().await
        })
        .await
        .map(drop)
    }

    /// Skip the remaining tool calls of the agent's current turn.
    pub async fn commit_stop_tools(&self, client_id: &str, agent_name: &str) -> Result<()> {
        self.commit_with("commit_stop_tools", client_id, Some(agent_name), |agent| async move {
            agent.commit_stop_tools();
            Ok(())
        })
        .await
        .map(drop)
    }

    pub async fn commit_stop_tools_force(&self, client_id: &str) -> Result<()> {
        self.commit_with("commit_stop_tools_force", client_id, None, |agent| async move {
            agent.commit_stop_tools();
            Ok(())
        })
        .await
        .map(drop)
    }

    /// Record tool calls as if the model had requested them. Returns the
    /// generated call ids, or an empty list when skipped.
    pub async fn commit_tool_request(
        &self,
        requests: Vec<ToolRequest>,
        client_id: &str,
        agent_name: &str,
    ) -> Result<Vec<String>> {
        self.commit_with("commit_tool_request", client_id, Some(agent_name), |agent| async move {
            agent.commit_tool_request(requests).await
        })
        .await
        .map(Option::unwrap_or_default)
    }

    pub async fn commit_tool_request_force(
        &self,
        requests: Vec<ToolRequest>,
        client_id: &str,
    ) -> Result<Vec<String>> {
        self.commit_with("commit_tool_request_force", client_id, None, |agent| async move {
            agent.commit_tool_request(requests).await
        })
        .await
        .map(Option::unwrap_or_default)
    }
}
