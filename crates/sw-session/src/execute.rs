//! Execution pipeline: runs content against an agent inside a fresh
//! execution scope, with performance accounting and execution-bus events.

use std::future::Future;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, Instrument};

use sw_bridge::protocol::{BusEvent, BusEventContext, EventSource};
use sw_core::types::ExecutionMode;
use sw_harness::context::{run_in_execution, ContextSnapshot, ExecutionContext, MethodContext};
use sw_telemetry::spans::execution_span;

use crate::agent::{ClientAgent, TurnOutcome};
use crate::error::Result;
use crate::runtime::{enter, SwarmRuntime};
use crate::swarm::{next_output, ClientSwarm};

/// Open execution: perf start plus `commit-execution-begin`. Closed exactly
/// once, on `finish` or on drop, with perf end plus `commit-execution-end`.
struct ExecutionGuard<'a> {
    runtime: &'a SwarmRuntime,
    execution_id: String,
    client_id: String,
    swarm_name: String,
    finished: bool,
}

impl<'a> ExecutionGuard<'a> {
    fn start(
        runtime: &'a SwarmRuntime,
        execution_id: &str,
        client_id: &str,
        swarm_name: &str,
        input_len: usize,
    ) -> Self {
        runtime
            .inner
            .perf
            .start_execution(execution_id, client_id, input_len);
        runtime.publish_execution("commit-execution-begin", client_id, swarm_name, execution_id);
        Self {
            runtime,
            execution_id: execution_id.to_string(),
            client_id: client_id.to_string(),
            swarm_name: swarm_name.to_string(),
            finished: false,
        }
    }

    fn finish(&mut self, output_len: usize) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.runtime
            .inner
            .perf
            .end_execution(&self.execution_id, &self.client_id, output_len);
        self.runtime.publish_execution(
            "commit-execution-end",
            &self.client_id,
            &self.swarm_name,
            &self.execution_id,
        );
    }
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        self.finish(0);
    }
}

impl SwarmRuntime {
    fn publish_execution(&self, kind: &str, client_id: &str, swarm_name: &str, execution_id: &str) {
        self.inner.bus.publish(
            BusEvent::internal(EventSource::ExecutionBus, kind, client_id)
                .with_input(json!({ "execution_id": execution_id }))
                .with_context(BusEventContext::swarm(swarm_name)),
        );
    }

    /// Wrap `fut` in a new execution scope with balanced perf accounting and
    /// begin/end events. The end side also runs when `fut` fails or is
    /// dropped.
    pub(crate) async fn accounted<F>(
        &self,
        method: &'static str,
        client_id: &str,
        swarm_name: &str,
        input_len: usize,
        fut: F,
    ) -> Result<String>
    where
        F: Future<Output = Result<String>>,
    {
        let ctx = ExecutionContext::new(client_id, self.inner.config.general.process_id.clone());
        let execution_id = ctx.execution_id.clone();
        let span = execution_span(method, client_id, &execution_id);
        run_in_execution(ctx, async {
            let mut guard = ExecutionGuard::start(self, &execution_id, client_id, swarm_name, input_len);
            let result = fut.await;
            guard.finish(result.as_ref().map(String::len).unwrap_or(0));
            result
        })
        .instrument(span)
        .await
    }

    /// Run one turn of `agent` and wait for the first output the swarm
    /// publishes. A turn that finishes without output yields an empty string.
    pub(crate) async fn session_execute(
        &self,
        swarm: &Arc<ClientSwarm>,
        agent: Arc<ClientAgent>,
        content: &str,
        mode: ExecutionMode,
        commit_input: bool,
    ) -> Result<String> {
        let agent_name = agent.agent_name().to_string();
        let mut rx = swarm.subscribe();
        let runtime = self.clone();
        let incoming = content.to_string();
        // Tools may call back into the runtime and wait on this swarm's
        // output themselves, so the turn runs as its own task.
        let mut task = tokio::spawn(ContextSnapshot::capture().scope(async move {
            agent.execute(&runtime, &incoming, mode, commit_input).await
        }));
        let outcome = tokio::select! {
            biased;
            output = next_output(&mut rx) => return Ok(output.map(|m| m.data).unwrap_or_default()),
            joined = &mut task => joined??,
        };
        if let Ok(message) = rx.try_recv() {
            return Ok(message.data);
        }
        match outcome {
            // A navigation or stop request interrupted the tools; the output
            // comes from whoever took over.
            TurnOutcome::Aborted => {
                debug!(client_id = %swarm.client_id(), agent_name = %agent_name, "turn aborted, waiting for output");
                Ok(next_output(&mut rx).await.map(|m| m.data).unwrap_or_default())
            }
            TurnOutcome::Finished => {
                debug!(client_id = %swarm.client_id(), agent_name = %agent_name, "turn finished without output");
                Ok(String::new())
            }
        }
    }

    /// A user turn on the client's active agent. The navigation route is
    /// reset first.
    pub(crate) async fn user_turn(
        &self,
        method: &'static str,
        client_id: &str,
        swarm_name: &str,
        content: &str,
        commit_input: bool,
    ) -> Result<String> {
        self.inner.sessions.validate(client_id)?;
        self.inner.sessions.touch(client_id);
        self.inner.navigation.begin_monit(client_id, swarm_name);
        let Some((swarm, agent)) = self
            .with_active_agent(method, client_id, None, |swarm, agent| async move { Ok((swarm, agent)) })
            .await?
        else {
            return Ok(String::new());
        };
        self.accounted(
            method,
            client_id,
            swarm_name,
            content.len(),
            self.session_execute(&swarm, agent, content, ExecutionMode::User, commit_input),
        )
        .await
    }

    /// Run `content` as a tool-role message on `agent_name`. Returns an
    /// empty string without running anything if the agent is no longer
    /// active.
    pub async fn execute(&self, content: &str, client_id: &str, agent_name: &str) -> Result<String> {
        let ctx = MethodContext::new("execute", client_id).with_agent(agent_name);
        enter(ctx, self.execute_inner("execute", content, client_id, Some(agent_name))).await
    }

    /// Like [`SwarmRuntime::execute`] on whichever agent is active.
    pub async fn execute_force(&self, content: &str, client_id: &str) -> Result<String> {
        let ctx = MethodContext::new("execute_force", client_id);
        enter(ctx, self.execute_inner("execute_force", content, client_id, None)).await
    }

    async fn execute_inner(
        &self,
        method: &'static str,
        content: &str,
        client_id: &str,
        expected_agent: Option<&str>,
    ) -> Result<String> {
        let Some((swarm, agent)) = self
            .with_active_agent(method, client_id, expected_agent, |swarm, agent| async move {
                Ok((swarm, agent))
            })
            .await?
        else {
            return Ok(String::new());
        };
        self.inner.sessions.touch(client_id);
        self.accounted(
            method,
            client_id,
            swarm.swarm_name(),
            content.len(),
            self.session_execute(&swarm, agent, content, ExecutionMode::Tool, true),
        )
        .await
    }

    /// Complete `content` on `agent_name` without writing history. Returns an
    /// empty string if the agent is no longer active.
    pub async fn run_stateless(
        &self,
        content: &str,
        client_id: &str,
        agent_name: &str,
    ) -> Result<String> {
        let ctx = MethodContext::new("run_stateless", client_id).with_agent(agent_name);
        enter(ctx, self.run_stateless_inner("run_stateless", content, client_id, Some(agent_name))).await
    }

    /// Like [`SwarmRuntime::run_stateless`] on whichever agent is active.
    pub async fn run_stateless_force(&self, content: &str, client_id: &str) -> Result<String> {
        let ctx = MethodContext::new("run_stateless_force", client_id);
        enter(ctx, self.run_stateless_inner("run_stateless_force", content, client_id, None)).await
    }

    async fn run_stateless_inner(
        &self,
        method: &'static str,
        content: &str,
        client_id: &str,
        expected_agent: Option<&str>,
    ) -> Result<String> {
        let Some((swarm, agent)) = self
            .with_active_agent(method, client_id, expected_agent, |swarm, agent| async move {
                Ok((swarm, agent))
            })
            .await?
        else {
            return Ok(String::new());
        };
        self.inner.sessions.touch(client_id);
        self.accounted(method, client_id, swarm.swarm_name(), content.len(), async {
            agent.run(content).await
        })
        .await
    }
}
