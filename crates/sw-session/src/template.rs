//! Ready-made navigation tool body: hand the conversation to another agent
//! from inside a tool call, with loop protection.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use sw_core::types::{AgentName, ClientId};
use sw_harness::context::MethodContext;

use crate::error::Result;
use crate::runtime::{enter, SwarmRuntime};

const DEFAULT_FLUSH_MESSAGE: &str = "Sorry, I missed that. Could you repeat please";

/// What a navigation message is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigateRequest {
    pub client_id: ClientId,
    pub agent_name: AgentName,
    pub last_user_message: String,
}

pub type MessageFn = Arc<dyn Fn(&NavigateRequest) -> String + Send + Sync>;

/// What the new agent does right after a successful handoff.
#[derive(Clone)]
pub enum FollowUp {
    /// Run the message on the new agent and let it answer.
    Execute(MessageFn),
    /// Send the message to the client as the new agent's output.
    Emit(MessageFn),
}

impl fmt::Debug for FollowUp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FollowUp::Execute(_) => f.write_str("FollowUp::Execute"),
            FollowUp::Emit(_) => f.write_str("FollowUp::Emit"),
        }
    }
}

/// Messages used by [`SwarmRuntime::navigate_to_agent`]. Without a follow-up
/// the new agent answers the last user message.
#[derive(Clone, Default)]
pub struct NavigateOptions {
    tool_output: Option<MessageFn>,
    flush_message: Option<MessageFn>,
    follow_up: Option<FollowUp>,
}

impl fmt::Debug for NavigateOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NavigateOptions")
            .field("tool_output", &self.tool_output.is_some())
            .field("flush_message", &self.flush_message.is_some())
            .field("follow_up", &self.follow_up)
            .finish()
    }
}

impl NavigateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tool output committed for the navigating call.
    pub fn with_tool_output<F>(mut self, f: F) -> Self
    where
        F: Fn(&NavigateRequest) -> String + Send + Sync + 'static,
    {
        self.tool_output = Some(Arc::new(f));
        self
    }

    /// Message sent when the target was already visited this turn.
    pub fn with_flush_message<F>(mut self, f: F) -> Self
    where
        F: Fn(&NavigateRequest) -> String + Send + Sync + 'static,
    {
        self.flush_message = Some(Arc::new(f));
        self
    }

    pub fn with_execute_message<F>(mut self, f: F) -> Self
    where
        F: Fn(&NavigateRequest) -> String + Send + Sync + 'static,
    {
        self.follow_up = Some(FollowUp::Execute(Arc::new(f)));
        self
    }

    pub fn with_emit_message<F>(mut self, f: F) -> Self
    where
        F: Fn(&NavigateRequest) -> String + Send + Sync + 'static,
    {
        self.follow_up = Some(FollowUp::Emit(Arc::new(f)));
        self
    }

    fn tool_output(&self, request: &NavigateRequest) -> String {
        match &self.tool_output {
            Some(f) => f(request),
            None => format!("Successfully navigated to {}", request.agent_name),
        }
    }

    fn flush_message(&self, request: &NavigateRequest) -> String {
        match &self.flush_message {
            Some(f) => f(request),
            None => DEFAULT_FLUSH_MESSAGE.to_string(),
        }
    }
}

impl SwarmRuntime {
    /// Body of a navigation tool called as `tool_id`.
    ///
    /// On the first visit to `agent_name` this turn: answer the tool call,
    /// switch agents and run the follow-up. On a revisit: flush the
    /// conversation and send the flush message instead of switching.
    /// Returns whether the handoff happened.
    pub async fn navigate_to_agent(
        &self,
        tool_id: &str,
        client_id: &str,
        agent_name: &str,
        options: &NavigateOptions,
    ) -> Result<bool> {
        let ctx = MethodContext::new("navigate_to_agent", client_id).with_agent(agent_name);
        enter(ctx, async {
            let request = NavigateRequest {
                client_id: client_id.to_string(),
                agent_name: agent_name.to_string(),
                last_user_message: self
                    .get_last_user_message(client_id)
                    .await?
                    .unwrap_or_default(),
            };

            if !self.has_navigation(client_id, agent_name)? {
                self.commit_tool_output_force(tool_id, &options.tool_output(&request), client_id)
                    .await?;
                if self.change_to_agent(agent_name, client_id).await? {
                    match &options.follow_up {
                        Some(FollowUp::Emit(message)) => {
                            self.emit_output_force(&message(&request), client_id)?;
                        }
                        Some(FollowUp::Execute(message)) => {
                            self.execute_force(&message(&request), client_id).await?;
                        }
                        None => {
                            self.execute_force(&request.last_user_message, client_id)
                                .await?;
                        }
                    }
                    debug!(client_id, agent_name, "navigation done");
                    return Ok(true);
                }
            }

            warn!(client_id, agent_name, "navigation loop, flushing conversation");
            self.commit_flush_force(client_id).await?;
            self.emit_output_force(&options.flush_message(&request), client_id)?;
            Ok(false)
        })
        .await
    }
}
