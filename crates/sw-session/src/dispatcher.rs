//! Agent changes. Every switch for one client runs on that client's lane of
//! the `change-agent` queue, so concurrent requests apply one at a time in
//! submission order.

use tracing::{error, info, warn};

use sw_harness::context::MethodContext;

use crate::error::{Result, SwarmError};
use crate::runtime::{enter, SwarmRuntime};
use crate::swarm::ClientSwarm;

/// Which agent a switch lands on.
#[derive(Debug, Clone)]
enum Target {
    Named(String),
    Default,
    Previous,
}

impl SwarmRuntime {
    /// Make `agent_name` the client's active agent. Returns `false` without
    /// switching when the agent was already visited during this turn or does
    /// not belong to the client's swarm.
    pub async fn change_to_agent(&self, agent_name: &str, client_id: &str) -> Result<bool> {
        let ctx = MethodContext::new("change_to_agent", client_id).with_agent(agent_name);
        enter(ctx, self.switch_agent("change_to_agent", client_id, Target::Named(agent_name.to_string()))).await
    }

    /// Switch back to the swarm's default agent.
    pub async fn change_to_default_agent(&self, client_id: &str) -> Result<bool> {
        let ctx = MethodContext::new("change_to_default_agent", client_id);
        enter(ctx, self.switch_agent("change_to_default_agent", client_id, Target::Default)).await
    }

    /// Pop the navigation stack and switch to the agent beneath the current
    /// one, or to the default agent once the stack is empty.
    pub async fn change_to_prev_agent(&self, client_id: &str) -> Result<bool> {
        let ctx = MethodContext::new("change_to_prev_agent", client_id);
        enter(ctx, self.switch_agent("change_to_prev_agent", client_id, Target::Previous)).await
    }

    async fn switch_agent(&self, method: &'static str, client_id: &str, target: Target) -> Result<bool> {
        self.inner.sessions.validate(client_id)?;
        let swarm = self.session_swarm(client_id)?;
        if let Target::Named(agent_name) = &target {
            self.inner.registry.validate_agent(agent_name)?;
            if !swarm.agent_list().iter().any(|a| a == agent_name) {
                warn!(
                    method,
                    client_id,
                    agent_name = %agent_name,
                    swarm_name = %swarm.swarm_name(),
                    "agent is not part of the swarm, change skipped"
                );
                return Ok(false);
            }
            let current = swarm.get_agent_name();
            if !self.inner.registry.has_dependency(&current, agent_name) {
                error!(
                    method,
                    client_id,
                    from = %current,
                    to = %agent_name,
                    "agent change without a declared dependency"
                );
            }
        }

        let key = client_id.to_string();
        self.inner
            .dispatcher
            .run(key, async {
                let (agent_name, push) = match target {
                    Target::Named(agent_name) => (agent_name, true),
                    Target::Default => (swarm.default_agent().to_string(), true),
                    Target::Previous => (swarm.navigation_pop(), false),
                };
                if push
                    && !self.inner.navigation.should_navigate(
                        client_id,
                        swarm.swarm_name(),
                        &agent_name,
                    )?
                {
                    warn!(method, client_id, agent_name = %agent_name, "navigation loop, change skipped");
                    return Ok(false);
                }
                self.apply_switch(&swarm, &agent_name, push).await?;
                Ok::<_, SwarmError>(true)
            })
            .await
    }

    /// Notify live agents, dispose the current one and install a fresh
    /// instance of `agent_name` as active. A failure after the dispose is
    /// reported as a dispatcher fault and nothing is rolled back.
    async fn apply_switch(&self, swarm: &ClientSwarm, agent_name: &str, push: bool) -> Result<()> {
        let client_id = swarm.client_id();
        for agent in swarm.agent_refs() {
            agent.commit_agent_change();
        }
        let current = swarm.get_agent_name();
        if let Some(previous) = swarm.take_agent_ref(&current) {
            previous.dispose().await?;
        }

        let fault = |err: SwarmError| SwarmError::Dispatcher {
            client_id: client_id.to_string(),
            reason: err.to_string(),
        };
        let fresh = self.create_agent(swarm, agent_name).map_err(fault)?;
        if let Some(stale) = swarm.take_agent_ref(agent_name) {
            stale.dispose().await.map_err(fault)?;
        }
        swarm.set_agent_ref(agent_name, fresh).map_err(fault)?;

        if push {
            swarm.set_agent_name(agent_name);
        } else {
            swarm.restore_agent_name(agent_name);
        }
        info!(client_id, from = %current, to = agent_name, "agent changed");
        Ok(())
    }
}
