//! Per (client, swarm) state: the active-agent pointer, live agent
//! references, the navigation stack and the output channel.

use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, info};

use sw_bridge::event_bus::EventBus;
use sw_bridge::protocol::{BusEvent, BusEventContext, EventSource};
use sw_core::types::{AgentName, ClientId, OutgoingMessage, SwarmName};

use crate::agent::ClientAgent;
use crate::error::{Result, SwarmError};

const OUTPUT_CAPACITY: usize = 64;

#[derive(Debug)]
struct Pointer {
    active: AgentName,
    stack: Vec<AgentName>,
}

pub struct ClientSwarm {
    client_id: ClientId,
    swarm_name: SwarmName,
    default_agent: AgentName,
    agent_list: Vec<AgentName>,
    pointer: Mutex<Pointer>,
    agents: DashMap<AgentName, Arc<ClientAgent>>,
    output: broadcast::Sender<OutgoingMessage>,
    bus: EventBus,
}

impl std::fmt::Debug for ClientSwarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSwarm")
            .field("client_id", &self.client_id)
            .field("swarm_name", &self.swarm_name)
            .field("pointer", &*self.lock())
            .finish()
    }
}

impl ClientSwarm {
    pub(crate) fn new(
        client_id: impl Into<ClientId>,
        swarm_name: impl Into<SwarmName>,
        default_agent: impl Into<AgentName>,
        agent_list: Vec<AgentName>,
        bus: EventBus,
    ) -> Self {
        let default_agent = default_agent.into();
        let (output, _) = broadcast::channel(OUTPUT_CAPACITY);
        Self {
            client_id: client_id.into(),
            swarm_name: swarm_name.into(),
            pointer: Mutex::new(Pointer {
                active: default_agent.clone(),
                stack: Vec::new(),
            }),
            default_agent,
            agent_list,
            agents: DashMap::new(),
            output,
            bus,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Pointer> {
        self.pointer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, kind: &str, input: Value, output: Value) {
        self.bus.publish(
            BusEvent::internal(EventSource::SwarmBus, kind, self.client_id.clone())
                .with_input(input)
                .with_output(output)
                .with_context(BusEventContext::swarm(self.swarm_name.clone())),
        );
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn swarm_name(&self) -> &str {
        &self.swarm_name
    }

    pub fn default_agent(&self) -> &str {
        &self.default_agent
    }

    pub fn agent_list(&self) -> &[AgentName] {
        &self.agent_list
    }

    // -----------------------------------------------------------------------
    // Active agent
    // -----------------------------------------------------------------------

    pub fn get_agent_name(&self) -> AgentName {
        self.lock().active.clone()
    }

    /// Make `agent_name` active and push it on the navigation stack.
    pub(crate) fn set_agent_name(&self, agent_name: &str) {
        {
            let mut pointer = self.lock();
            pointer.active = agent_name.to_string();
            pointer.stack.push(agent_name.to_string());
        }
        info!(client_id = %self.client_id, swarm_name = %self.swarm_name, agent_name, "active agent changed");
        self.publish("set-agent-name", json!({ "agent_name": agent_name }), Value::Null);
    }

    /// Make `agent_name` active without touching the navigation stack.
    pub(crate) fn restore_agent_name(&self, agent_name: &str) {
        self.lock().active = agent_name.to_string();
        info!(client_id = %self.client_id, swarm_name = %self.swarm_name, agent_name, "active agent restored");
        self.publish("set-agent-name", json!({ "agent_name": agent_name }), Value::Null);
    }

    /// Drop the current agent from the navigation stack and return the one
    /// beneath it, or the default agent when the stack runs out.
    pub(crate) fn navigation_pop(&self) -> AgentName {
        let prev = {
            let mut pointer = self.lock();
            let active = pointer.active.clone();
            if pointer.stack.last() == Some(&active) {
                pointer.stack.pop();
            }
            pointer
                .stack
                .last()
                .cloned()
                .unwrap_or_else(|| self.default_agent.clone())
        };
        self.publish("navigation-pop", Value::Null, json!({ "agent_name": prev }));
        prev
    }

    pub fn navigation_stack(&self) -> Vec<AgentName> {
        self.lock().stack.clone()
    }

    // -----------------------------------------------------------------------
    // Agent references
    // -----------------------------------------------------------------------

    pub(crate) fn agent_ref(&self, agent_name: &str) -> Option<Arc<ClientAgent>> {
        self.agents.get(agent_name).map(|a| a.clone())
    }

    /// Install `agent` as the live instance of `agent_name`.
    pub(crate) fn set_agent_ref(&self, agent_name: &str, agent: Arc<ClientAgent>) -> Result<()> {
        if !self.agent_list.iter().any(|a| a == agent_name) {
            return Err(SwarmError::AgentNotInSwarm {
                agent: agent_name.to_string(),
                swarm: self.swarm_name.clone(),
            });
        }
        self.agents.insert(agent_name.to_string(), agent);
        debug!(client_id = %self.client_id, agent_name, "agent ref set");
        Ok(())
    }

    /// Existing live instance of `agent_name`, or the one `create` builds.
    pub(crate) fn agent_or_insert_with<F>(&self, agent_name: &str, create: F) -> Arc<ClientAgent>
    where
        F: FnOnce() -> Arc<ClientAgent>,
    {
        self.agents
            .entry(agent_name.to_string())
            .or_insert_with(create)
            .clone()
    }

    pub(crate) fn take_agent_ref(&self, agent_name: &str) -> Option<Arc<ClientAgent>> {
        self.agents.remove(agent_name).map(|(_, agent)| agent)
    }

    pub(crate) fn agent_refs(&self) -> Vec<Arc<ClientAgent>> {
        self.agents.iter().map(|e| e.value().clone()).collect()
    }

    // -----------------------------------------------------------------------
    // Output
    // -----------------------------------------------------------------------

    pub(crate) fn output_sender(&self) -> broadcast::Sender<OutgoingMessage> {
        self.output.clone()
    }

    /// Receiver for every output published after this call.
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<OutgoingMessage> {
        self.output.subscribe()
    }

    /// Publish `data` as output of the active agent. Returns the number of
    /// waiters reached.
    pub(crate) fn emit(&self, data: &str) -> usize {
        let agent_name = self.get_agent_name();
        let reached = self
            .output
            .send(OutgoingMessage {
                client_id: self.client_id.clone(),
                agent_name: agent_name.clone(),
                data: data.to_string(),
            })
            .unwrap_or(0);
        self.publish("emit", json!({ "agent_name": agent_name }), json!({ "result": data }));
        reached
    }

    /// Resolve every pending output wait with an empty result.
    pub(crate) fn cancel_output(&self) -> usize {
        let reached = self.emit("");
        debug!(client_id = %self.client_id, reached, "output cancelled");
        self.publish("cancel-output", Value::Null, Value::Null);
        reached
    }

    /// Next output published on this swarm. `None` if the channel closed.
    pub async fn wait_for_output(&self) -> Option<OutgoingMessage> {
        next_output(&mut self.subscribe()).await
    }
}

/// Next message from an output receiver, skipping over lag.
pub(crate) async fn next_output(
    rx: &mut broadcast::Receiver<OutgoingMessage>,
) -> Option<OutgoingMessage> {
    loop {
        match rx.recv().await {
            Ok(message) => return Some(message),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "output receiver lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
