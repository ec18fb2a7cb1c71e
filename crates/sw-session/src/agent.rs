//! One agent bound to one client: completion turns, tool runs and history
//! writes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

use sw_bridge::event_bus::EventBus;
use sw_bridge::protocol::{BusEvent, BusEventContext, EventSource};
use sw_core::completion::CompletionArgs;
use sw_core::config::SwarmConfig;
use sw_core::history::ClientHistory;
use sw_core::types::{
    ClientId, ExecutionMode, MessageRole, ModelMessage, OutgoingMessage, ToolCall,
    ToolRequest,
};
use sw_harness::context::ContextSnapshot;

use crate::error::Result;
use crate::registry::{AgentSchema, Registry, ToolContext};
use crate::runtime::SwarmRuntime;

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TurnOutcome {
    Finished,
    /// The tool run stopped after an abort. Whoever aborted it is expected
    /// to produce the output.
    Aborted,
}

/// Live agent instance for one client.
///
/// Writes go to the client's shared history tagged with this agent's name.
/// Output is published on the owning swarm's output channel, where the
/// execution pipeline waits for it.
pub struct ClientAgent {
    client_id: ClientId,
    schema: Arc<AgentSchema>,
    registry: Arc<Registry>,
    history: ClientHistory,
    config: Arc<SwarmConfig>,
    bus: EventBus,
    output: broadcast::Sender<OutgoingMessage>,
    /// Bumped by stop-tools, agent change and cancel; a running tool batch
    /// stops once it sees a newer value than it started with.
    abort_epoch: AtomicU64,
    abort_notify: Notify,
    disposed: AtomicBool,
}

impl std::fmt::Debug for ClientAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientAgent")
            .field("client_id", &self.client_id)
            .field("agent_name", &self.schema.name)
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish()
    }
}

impl ClientAgent {
    pub(crate) fn new(
        client_id: impl Into<ClientId>,
        schema: Arc<AgentSchema>,
        registry: Arc<Registry>,
        history: ClientHistory,
        config: Arc<SwarmConfig>,
        bus: EventBus,
        output: broadcast::Sender<OutgoingMessage>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            schema,
            registry,
            history,
            config,
            bus,
            output,
            abort_epoch: AtomicU64::new(0),
            abort_notify: Notify::new(),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn agent_name(&self) -> &str {
        &self.schema.name
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn history(&self) -> &ClientHistory {
        &self.history
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn publish(&self, kind: &str, input: Value, output: Value) {
        self.bus.publish(
            BusEvent::internal(EventSource::AgentBus, kind, self.client_id.clone())
                .with_input(input)
                .with_output(output)
                .with_context(BusEventContext::agent(self.schema.name.clone())),
        );
    }

    // -----------------------------------------------------------------------
    // Completion turns
    // -----------------------------------------------------------------------

    /// Completion view: main prompt, schema system prompts, then history.
    async fn messages(&self) -> Result<Vec<ModelMessage>> {
        let mut messages = self.history.to_array_for_agent(&self.schema.prompt).await?;
        let extra = self.schema.system.iter().map(|prompt| {
            ModelMessage::new(
                MessageRole::System,
                self.schema.name.clone(),
                prompt.clone(),
                ExecutionMode::Tool,
            )
        });
        let rest = messages.split_off(1.min(messages.len()));
        messages.extend(extra);
        messages.extend(rest);
        Ok(messages)
    }

    async fn completion(
        &self,
        mode: ExecutionMode,
        messages: Vec<ModelMessage>,
        with_tools: bool,
    ) -> Result<ModelMessage> {
        let tools = if with_tools {
            self.registry.tool_schemas(&self.schema.name)
        } else {
            Vec::new()
        };
        let args = CompletionArgs {
            client_id: self.client_id.clone(),
            agent_name: self.schema.name.clone(),
            mode,
            messages,
            tools,
        };
        Ok(self.schema.completion.get_completion(args).await?)
    }

    /// Run one turn: store the incoming message, ask the model, then either
    /// run the requested tools or emit the reply.
    ///
    /// With `commit_input == false` the incoming message is assumed to be in
    /// history already.
    pub(crate) async fn execute(
        &self,
        runtime: &SwarmRuntime,
        incoming: &str,
        mode: ExecutionMode,
        commit_input: bool,
    ) -> Result<TurnOutcome> {
        let incoming = incoming.trim();
        debug!(
            client_id = %self.client_id,
            agent_name = %self.schema.name,
            %mode,
            "agent execute"
        );
        if commit_input {
            self.history
                .push_as(MessageRole::User, incoming, mode)
                .await?;
        }
        let epoch = self.abort_epoch.load(Ordering::SeqCst);
        let messages = self.messages().await?;
        let message = self.completion(mode, messages, true).await?;

        if message.has_tool_calls() {
            let calls = message.tool_calls.clone();
            self.history
                .push(
                    ModelMessage::new(
                        MessageRole::Assistant,
                        self.schema.name.clone(),
                        message.content.clone(),
                        mode,
                    )
                    .with_tool_calls(calls.clone()),
                )
                .await?;
            self.publish(
                "execute",
                json!({ "incoming": incoming, "mode": mode.to_string() }),
                json!({ "tool_calls": calls.len() }),
            );
            return self.run_tools(runtime, mode, calls, epoch).await;
        }

        let content = message.content.trim().to_string();
        if content.is_empty() {
            warn!(
                client_id = %self.client_id,
                agent_name = %self.schema.name,
                "empty model output, emitting placeholder"
            );
            let placeholder = self.config.completion.placeholder();
            self.emit_output(mode, &placeholder);
            return Ok(TurnOutcome::Finished);
        }
        self.history
            .push(ModelMessage::new(
                MessageRole::Assistant,
                self.schema.name.clone(),
                content.clone(),
                mode,
            ))
            .await?;
        self.publish(
            "execute",
            json!({ "incoming": incoming, "mode": mode.to_string() }),
            json!({ "result": content }),
        );
        self.emit_output(mode, &content);
        Ok(TurnOutcome::Finished)
    }

    /// Run the tool calls of one completion in order. Stops early on an
    /// abort and recovers the conversation when a tool fails.
    async fn run_tools(
        &self,
        runtime: &SwarmRuntime,
        mode: ExecutionMode,
        calls: Vec<ToolCall>,
        epoch: u64,
    ) -> Result<TurnOutcome> {
        let total = calls.len();
        for (idx, call) in calls.into_iter().enumerate() {
            if self.aborted_since(epoch) {
                debug!(
                    client_id = %self.client_id,
                    agent_name = %self.schema.name,
                    remaining = total - idx,
                    "tool run aborted"
                );
                return Ok(TurnOutcome::Aborted);
            }

            let tool_name = call.function.name.clone();
            let tool = match self
                .schema
                .tools
                .iter()
                .any(|t| *t == tool_name)
                .then(|| self.registry.tool(&tool_name))
            {
                Some(Ok(tool)) => tool,
                _ => {
                    let reason = format!("tool `{tool_name}` is not available to this agent");
                    self.recover(mode, &reason).await?;
                    return Ok(TurnOutcome::Finished);
                }
            };

            let ctx = ToolContext {
                tool_id: call.id.clone(),
                client_id: self.client_id.clone(),
                agent_name: self.schema.name.clone(),
                params: call.function.arguments.clone(),
                is_last: idx + 1 == total,
                runtime: runtime.clone(),
            };
            info!(
                client_id = %self.client_id,
                agent_name = %self.schema.name,
                tool = %tool_name,
                tool_id = %call.id,
                "tool call"
            );

            // The tool runs as its own task: an abort stops waiting for it
            // but never cancels it halfway.
            let handle = tokio::spawn(ContextSnapshot::capture().scope(async move {
                tool.call(ctx).await
            }));
            tokio::select! {
                biased;
                joined = handle => match joined {
                    Ok(Ok(())) => {
                        self.publish(
                            "tool-call",
                            json!({ "tool": tool_name, "tool_id": call.id }),
                            Value::Null,
                        );
                    }
                    Ok(Err(err)) => {
                        warn!(client_id = %self.client_id, tool = %tool_name, error = %err, "tool failed");
                        self.recover(mode, &err.to_string()).await?;
                        return Ok(TurnOutcome::Finished);
                    }
                    Err(join) => {
                        warn!(client_id = %self.client_id, tool = %tool_name, error = %join, "tool task failed");
                        self.recover(mode, &join.to_string()).await?;
                        return Ok(TurnOutcome::Finished);
                    }
                },
                _ = self.wait_abort(epoch) => {
                    debug!(
                        client_id = %self.client_id,
                        agent_name = %self.schema.name,
                        tool = %tool_name,
                        "stopped waiting for tool after abort"
                    );
                    return Ok(TurnOutcome::Aborted);
                }
            }
        }
        Ok(TurnOutcome::Finished)
    }

    /// Flush the broken exchange and ask the model to start over.
    async fn recover(&self, mode: ExecutionMode, reason: &str) -> Result<()> {
        warn!(
            client_id = %self.client_id,
            agent_name = %self.schema.name,
            reason,
            "recovering conversation after tool failure"
        );
        self.history
            .push_as(MessageRole::Flush, reason, ExecutionMode::Tool)
            .await?;
        self.history
            .push_as(
                MessageRole::User,
                self.config.completion.tool_call_exception_prompt.clone(),
                ExecutionMode::Tool,
            )
            .await?;
        let messages = self.messages().await?;
        let message = self.completion(mode, messages, false).await?;
        let content = message.content.trim().to_string();
        self.publish("recover", json!({ "reason": reason }), json!({ "result": content }));
        if content.is_empty() || message.has_tool_calls() {
            self.history
                .push_as(MessageRole::Flush, "", ExecutionMode::Tool)
                .await?;
            let placeholder = self.config.completion.placeholder();
            self.emit_output(mode, &placeholder);
            return Ok(());
        }
        self.history
            .push_as(MessageRole::Assistant, content.clone(), mode)
            .await?;
        self.emit_output(mode, &content);
        Ok(())
    }

    /// Stateless completion: history is read, never written, and tools are
    /// not offered. A reply that asks for tools yields an empty string.
    pub async fn run(&self, incoming: &str) -> Result<String> {
        let incoming = incoming.trim();
        debug!(client_id = %self.client_id, agent_name = %self.schema.name, "agent run");
        let mut messages = self.messages().await?;
        messages.push(ModelMessage::new(
            MessageRole::User,
            self.schema.name.clone(),
            incoming,
            ExecutionMode::User,
        ));
        let message = self.completion(ExecutionMode::User, messages, false).await?;
        let result = if message.has_tool_calls() {
            warn!(client_id = %self.client_id, agent_name = %self.schema.name, "stateless run requested tools, ignored");
            String::new()
        } else {
            message.content.trim().to_string()
        };
        self.publish("run", json!({ "incoming": incoming }), json!({ "result": result }));
        Ok(result)
    }

    fn emit_output(&self, mode: ExecutionMode, data: &str) {
        let receivers = self
            .output
            .send(OutgoingMessage {
                client_id: self.client_id.clone(),
                agent_name: self.schema.name.clone(),
                data: data.to_string(),
            })
            .unwrap_or(0);
        debug!(client_id = %self.client_id, agent_name = %self.schema.name, receivers, "agent output");
        self.publish(
            "emit-output",
            json!({ "mode": mode.to_string() }),
            json!({ "result": data }),
        );
    }

    // -----------------------------------------------------------------------
    // Abort signalling
    // -----------------------------------------------------------------------

    fn abort(&self, reason: &str) {
        let epoch = self.abort_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.abort_notify.notify_waiters();
        debug!(client_id = %self.client_id, agent_name = %self.schema.name, reason, epoch, "tool run abort");
    }

    fn aborted_since(&self, epoch: u64) -> bool {
        self.abort_epoch.load(Ordering::SeqCst) != epoch
    }

    async fn wait_abort(&self, epoch: u64) {
        loop {
            let notified = self.abort_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.aborted_since(epoch) {
                return;
            }
            notified.await;
        }
    }

    // -----------------------------------------------------------------------
    // Commits
    // -----------------------------------------------------------------------

    pub async fn commit_user_message(&self, content: &str, mode: ExecutionMode) -> Result<()> {
        self.history
            .push_as(MessageRole::User, content.trim(), mode)
            .await?;
        self.publish("commit-user-message", json!({ "content": content, "mode": mode.to_string() }), Value::Null);
        Ok(())
    }

    pub async fn commit_assistant_message(&self, content: &str) -> Result<()> {
        self.history
            .push_as(MessageRole::Assistant, content.trim(), ExecutionMode::Tool)
            .await?;
        self.publish("commit-assistant-message", json!({ "content": content }), Value::Null);
        Ok(())
    }

    pub async fn commit_system_message(&self, content: &str) -> Result<()> {
        self.history
            .push_as(MessageRole::System, content.trim(), ExecutionMode::Tool)
            .await?;
        self.publish("commit-system-message", json!({ "content": content }), Value::Null);
        Ok(())
    }

    pub async fn commit_developer_message(&self, content: &str) -> Result<()> {
        self.history
            .push_as(MessageRole::Developer, content.trim(), ExecutionMode::Tool)
            .await?;
        self.publish("commit-developer-message", json!({ "content": content }), Value::Null);
        Ok(())
    }

    pub async fn commit_tool_output(&self, tool_id: &str, content: &str) -> Result<()> {
        self.history
            .push(
                ModelMessage::new(
                    MessageRole::Tool,
                    self.schema.name.clone(),
                    content.trim(),
                    ExecutionMode::Tool,
                )
                .with_tool_call_id(tool_id),
            )
            .await?;
        self.publish(
            "commit-tool-output",
            json!({ "tool_id": tool_id, "content": content }),
            Value::Null,
        );
        Ok(())
    }

    /// Push a flush marker; the agent's view starts after it.
    pub async fn commit_flush(&self) -> Result<()> {
        self.history
            .push_as(MessageRole::Flush, "", ExecutionMode::Tool)
            .await?;
        self.publish("commit-flush", Value::Null, Value::Null);
        Ok(())
    }

    /// Record tool calls made on the model's behalf. Returns the call ids.
    pub async fn commit_tool_request(&self, requests: Vec<ToolRequest>) -> Result<Vec<String>> {
        for request in &requests {
            self.registry.validate_tool(&request.tool_name)?;
        }
        let calls: Vec<ToolCall> = requests
            .into_iter()
            .map(|r| ToolCall::new(r.tool_name, r.params))
            .collect();
        let ids: Vec<String> = calls.iter().map(|c| c.id.clone()).collect();
        self.history
            .push(
                ModelMessage::new(
                    MessageRole::Assistant,
                    self.schema.name.clone(),
                    "",
                    ExecutionMode::Tool,
                )
                .with_tool_calls(calls),
            )
            .await?;
        self.publish("commit-tool-request", Value::Null, json!({ "ids": ids }));
        Ok(ids)
    }

    pub fn commit_stop_tools(&self) {
        self.abort("stop-tools");
        self.publish("commit-stop-tools", Value::Null, Value::Null);
    }

    pub fn commit_agent_change(&self) {
        self.abort("agent-change");
        self.publish("commit-agent-change", Value::Null, Value::Null);
    }

    pub fn commit_cancel_output(&self) {
        self.abort("cancel-output");
        self.publish("commit-cancel-output", Value::Null, Value::Null);
    }

    /// Release the agent. Any tool batch still running is stopped.
    pub async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.abort("dispose");
        self.history.dispose().await?;
        self.publish("dispose", Value::Null, Value::Null);
        info!(client_id = %self.client_id, agent_name = %self.schema.name, "agent disposed");
        Ok(())
    }
}
