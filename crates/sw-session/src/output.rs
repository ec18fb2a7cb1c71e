//! Output surfaces of `makeConnection` sessions: pushing text straight to
//! the client and cancelling a pending output.

use serde_json::json;
use tracing::{debug, warn};

use sw_bridge::protocol::{BusEvent, BusEventContext, EventSource};
use sw_core::types::{OutgoingMessage, SessionMode};
use sw_harness::context::MethodContext;

use crate::error::Result;
use crate::runtime::{enter, SwarmRuntime};

impl SwarmRuntime {
    /// Hand `data` to the client's receive callback.
    async fn deliver(&self, method: &'static str, client_id: &str, agent_name: &str, data: &str) {
        let Some(receive) = self.inner.sessions.receiver(client_id) else {
            warn!(method, client_id, "no receive callback connected");
            return;
        };
        receive(OutgoingMessage {
            client_id: client_id.to_string(),
            agent_name: agent_name.to_string(),
            data: data.to_string(),
        })
        .await;
        self.inner.bus.publish(
            BusEvent::internal(EventSource::SessionBus, "emit", client_id)
                .with_input(json!({ "method": method }))
                .with_output(json!({ "result": data }))
                .with_context(BusEventContext::agent(agent_name)),
        );
    }

    /// Send `content` to the client without running a completion, if
    /// `agent_name` is still active.
    pub async fn emit(&self, content: &str, client_id: &str, agent_name: &str) -> Result<()> {
        let ctx = MethodContext::new("emit", client_id).with_agent(agent_name);
        enter(ctx, async {
            self.inner
                .sessions
                .require_mode("emit", client_id, SessionMode::MakeConnection)?;
            let Some((_, agent_name)) = self.resolve_target("emit", client_id, Some(agent_name))? else {
                return Ok(());
            };
            self.deliver("emit", client_id, &agent_name, content).await;
            Ok(())
        })
        .await
    }

    /// Send `content` to the client on behalf of whichever agent is active.
    pub async fn emit_force(&self, content: &str, client_id: &str) -> Result<()> {
        let ctx = MethodContext::new("emit_force", client_id);
        enter(ctx, async {
            self.inner
                .sessions
                .require_mode("emit_force", client_id, SessionMode::MakeConnection)?;
            let Some((_, agent_name)) = self.resolve_target("emit_force", client_id, None)? else {
                return Ok(());
            };
            self.deliver("emit_force", client_id, &agent_name, content).await;
            Ok(())
        })
        .await
    }

    /// Out-of-band notice to the client. Nothing is checked or stored.
    pub async fn notify_force(&self, content: &str, client_id: &str) -> Result<()> {
        let ctx = MethodContext::new("notify_force", client_id);
        enter(ctx, async {
            self.inner
                .sessions
                .require_mode("notify_force", client_id, SessionMode::MakeConnection)?;
            let swarm = self.session_swarm(client_id)?;
            self.deliver("notify_force", client_id, &swarm.get_agent_name(), content)
                .await;
            Ok(())
        })
        .await
    }

    /// Resolve a pending output wait with an empty result and stop the
    /// agent's tool run, if `agent_name` is still active.
    pub async fn cancel_output(&self, client_id: &str, agent_name: &str) -> Result<()> {
        let ctx = MethodContext::new("cancel_output", client_id).with_agent(agent_name);
        enter(ctx, self.cancel_output_inner("cancel_output", client_id, Some(agent_name))).await
    }

    pub async fn cancel_output_force(&self, client_id: &str) -> Result<()> {
        let ctx = MethodContext::new("cancel_output_force", client_id);
        enter(ctx, self.cancel_output_inner("cancel_output_force", client_id, None)).await
    }

    async fn cancel_output_inner(
        &self,
        method: &'static str,
        client_id: &str,
        agent_name: Option<&str>,
    ) -> Result<()> {
        self.inner
            .sessions
            .require_mode(method, client_id, SessionMode::MakeConnection)?;
        self.with_active_agent(method, client_id, agent_name, |swarm, agent| async move {
            agent.commit_cancel_output();
            let reached = swarm.cancel_output();
            debug!(method, client_id, agent_name = %agent.agent_name(), reached, "output cancelled");
            Ok(())
        })
        .await
        .map(drop)
    }

    /// Publish `content` as the active agent's output, resolving the turn
    /// currently waiting on this client. Works in every session mode.
    pub(crate) fn emit_output_force(&self, content: &str, client_id: &str) -> Result<()> {
        let swarm = self.session_swarm(client_id)?;
        let reached = swarm.emit(content);
        debug!(client_id, reached, "output published");
        Ok(())
    }
}
