use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info, Instrument};

use sw_bridge::event_bus::EventBus;
use sw_core::config::SwarmConfig;
use sw_core::history::{ClientHistory, HistoryAdapter, InMemoryHistory};
use sw_core::types::{AgentName, ClientId, SessionMode, SwarmName};
use sw_harness::context::{begin_context, run_in_method, MethodContext};
use sw_harness::keyed_queue::KeyedQueue;
use sw_harness::shutdown::{DrainResult, ShutdownSignal};
use sw_telemetry::perf::PerfService;
use sw_telemetry::spans::method_span;

use crate::agent::ClientAgent;
use crate::error::{Result, SwarmError};
use crate::navigation::NavigationTracker;
use crate::registry::Registry;
use crate::session_registry::SessionRegistry;
use crate::swarm::ClientSwarm;

pub(crate) type SwarmKey = (ClientId, SwarmName);

/// Run a public operation in a fresh method scope. Method and execution
/// scopes inherited from the caller are not visible inside `fut`.
pub(crate) async fn enter<F: Future>(ctx: MethodContext, fut: F) -> F::Output {
    let span = method_span(&ctx.method_name, &ctx.client_id);
    begin_context(run_in_method(ctx, fut)).instrument(span).await
}

pub(crate) struct RuntimeInner {
    pub(crate) config: Arc<SwarmConfig>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) sessions: Arc<SessionRegistry>,
    pub(crate) history: Arc<dyn HistoryAdapter>,
    pub(crate) bus: EventBus,
    pub(crate) perf: PerfService,
    pub(crate) navigation: NavigationTracker,
    pub(crate) swarms: DashMap<SwarmKey, Arc<ClientSwarm>>,
    /// Agent changes, one lane per client.
    pub(crate) dispatcher: KeyedQueue<ClientId>,
    /// User turns, one lane per (client, swarm).
    pub(crate) executions: KeyedQueue<SwarmKey>,
    pub(crate) shutdown: ShutdownSignal,
}

/// Entry point of the swarm runtime. Cheap to clone; every clone shares the
/// same sessions, agents, bus and accounting.
#[derive(Clone)]
pub struct SwarmRuntime {
    pub(crate) inner: Arc<RuntimeInner>,
}

impl fmt::Debug for SwarmRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwarmRuntime")
            .field("sessions", &self.inner.sessions.len())
            .field("swarms", &self.inner.swarms.len())
            .field("bus", &self.inner.bus)
            .finish()
    }
}

impl SwarmRuntime {
    /// Runtime backed by in-memory history.
    pub fn new(registry: Registry, config: SwarmConfig) -> Self {
        Self::with_history(registry, config, Arc::new(InMemoryHistory::new()))
    }

    pub fn with_history(
        registry: Registry,
        config: SwarmConfig,
        history: Arc<dyn HistoryAdapter>,
    ) -> Self {
        let sessions = Arc::new(SessionRegistry::new());
        let gate = sessions.clone();
        let bus = EventBus::new().with_session_gate(move |client| gate.has_session(client));
        let shutdown = ShutdownSignal::new();
        let ttl = config.dispatcher.ttl();
        let gc = config.dispatcher.gc_interval();
        info!(
            process_id = %config.general.process_id,
            ttl_secs = ttl.as_secs(),
            keep_messages = config.history.keep_messages,
            "swarm runtime created"
        );
        Self {
            inner: Arc::new(RuntimeInner {
                navigation: NavigationTracker::new(config.navigation.throw_on_recursion),
                config: Arc::new(config),
                registry: Arc::new(registry),
                sessions,
                history,
                bus,
                perf: PerfService::new(),
                swarms: DashMap::new(),
                dispatcher: KeyedQueue::with_shutdown("change-agent", ttl, gc, shutdown.clone()),
                executions: KeyedQueue::with_shutdown("execution", ttl, gc, shutdown.clone()),
                shutdown,
            }),
        }
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn perf(&self) -> &PerfService {
        &self.inner.perf
    }

    pub fn navigation(&self) -> &NavigationTracker {
        &self.inner.navigation
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.inner.shutdown
    }

    // -----------------------------------------------------------------------
    // Session queries
    // -----------------------------------------------------------------------

    pub fn has_session(&self, client_id: &str) -> bool {
        self.inner.sessions.has_session(client_id)
    }

    pub fn session_list(&self) -> Vec<ClientId> {
        self.inner.sessions.session_list()
    }

    pub fn get_session_mode(&self, client_id: &str) -> Result<SessionMode> {
        self.inner.sessions.get_session_mode(client_id)
    }

    pub fn get_swarm_name(&self, client_id: &str) -> Result<SwarmName> {
        self.inner.sessions.get_swarm(client_id)
    }

    /// Name of the client's active agent.
    pub fn get_agent_name(&self, client_id: &str) -> Result<AgentName> {
        let swarm = self.session_swarm(client_id)?;
        Ok(swarm.get_agent_name())
    }

    /// Whether `agent_name` was already navigated to during the client's
    /// current turn.
    pub fn has_navigation(&self, client_id: &str, agent_name: &str) -> Result<bool> {
        let swarm_name = self.inner.sessions.get_swarm(client_id)?;
        Ok(self
            .inner
            .navigation
            .has_navigation(client_id, &swarm_name, agent_name))
    }

    // -----------------------------------------------------------------------
    // Internal state
    // -----------------------------------------------------------------------

    /// Swarm state of `client_id`, created on first use.
    pub(crate) fn swarm_state(&self, client_id: &str, swarm_name: &str) -> Result<Arc<ClientSwarm>> {
        let key = (client_id.to_string(), swarm_name.to_string());
        if let Some(swarm) = self.inner.swarms.get(&key) {
            return Ok(swarm.clone());
        }
        let schema = self.inner.registry.swarm(swarm_name)?;
        let swarm = self
            .inner
            .swarms
            .entry(key)
            .or_insert_with(|| {
                debug!(client_id, swarm_name, "swarm state created");
                Arc::new(ClientSwarm::new(
                    client_id,
                    swarm_name,
                    schema.default_agent.clone(),
                    schema.agents.clone(),
                    self.inner.bus.clone(),
                ))
            })
            .clone();
        Ok(swarm)
    }

    /// Validate the session and return its swarm state.
    pub(crate) fn session_swarm(&self, client_id: &str) -> Result<Arc<ClientSwarm>> {
        let swarm_name = self.inner.sessions.get_swarm(client_id)?;
        self.inner.registry.validate_swarm(&swarm_name)?;
        self.swarm_state(client_id, &swarm_name)
    }

    /// Resolve the agent a call acts on: `expected_agent` if it is still
    /// active, the active agent when `expected_agent` is `None`. Returns
    /// `None` when the call targets an agent that is no longer active.
    pub(crate) fn resolve_target(
        &self,
        method: &'static str,
        client_id: &str,
        expected_agent: Option<&str>,
    ) -> Result<Option<(Arc<ClientSwarm>, AgentName)>> {
        self.inner.sessions.validate(client_id)?;
        if let Some(agent_name) = expected_agent {
            self.inner.registry.validate_agent(agent_name)?;
        }
        let swarm = self.session_swarm(client_id)?;
        let current = swarm.get_agent_name();
        match expected_agent {
            Some(agent_name) if agent_name != current => {
                debug!(
                    method,
                    client_id,
                    agent_name,
                    current_agent = %current,
                    "skipped due to the agent change"
                );
                Ok(None)
            }
            Some(agent_name) => Ok(Some((swarm, agent_name.to_string()))),
            None => Ok(Some((swarm, current))),
        }
    }

    /// Run `body` on the client's `change-agent` lane with the agent a call
    /// acts on. No switch can start or finish while `body` runs, so the
    /// agent it receives stays the active one throughout. `Ok(None)` means
    /// `expected_agent` is no longer active and `body` was not run.
    pub(crate) async fn with_active_agent<F, Fut, T>(
        &self,
        method: &'static str,
        client_id: &str,
        expected_agent: Option<&str>,
        body: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce(Arc<ClientSwarm>, Arc<ClientAgent>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.inner
            .dispatcher
            .run(client_id.to_string(), async {
                let Some((swarm, target)) = self.resolve_target(method, client_id, expected_agent)? else {
                    return Ok(None);
                };
                let agent = self.agent(&swarm, &target)?;
                body(swarm, agent).await.map(Some)
            })
            .await
    }

    /// Live instance of the active agent `agent_name`, created on first use.
    /// Only the active agent is ever cached, so nothing outlives a switch.
    fn agent(&self, swarm: &ClientSwarm, agent_name: &str) -> Result<Arc<ClientAgent>> {
        if let Some(agent) = swarm.agent_ref(agent_name) {
            return Ok(agent);
        }
        if swarm.get_agent_name() != agent_name {
            return Err(SwarmError::AgentNotActive {
                client_id: swarm.client_id().to_string(),
                agent: agent_name.to_string(),
            });
        }
        let fresh = self.create_agent(swarm, agent_name)?;
        Ok(swarm.agent_or_insert_with(agent_name, || fresh))
    }

    pub(crate) fn create_agent(&self, swarm: &ClientSwarm, agent_name: &str) -> Result<Arc<ClientAgent>> {
        let schema = self.inner.registry.agent(agent_name)?;
        let client_id = swarm.client_id().to_string();
        let history = ClientHistory::new(
            client_id.clone(),
            agent_name,
            self.inner.config.history.keep_messages,
            self.inner.history.clone(),
        );
        debug!(client_id = %client_id, agent_name, "agent created");
        Ok(Arc::new(ClientAgent::new(
            client_id,
            schema,
            self.inner.registry.clone(),
            history,
            self.inner.config.clone(),
            self.inner.bus.clone(),
            swarm.output_sender(),
        )))
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Stop background sweeps and auto-dispose watchers, then wait up to
    /// `timeout` for them to exit.
    pub async fn shutdown(&self, timeout: Duration) -> DrainResult {
        self.inner.shutdown.trigger();
        self.inner.shutdown.wait_for_drain(timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sw_core::completion::{Completion, CompletionArgs, CompletionError};
    use sw_core::types::{ExecutionMode, MessageRole, ModelMessage};

    use crate::registry::{AgentSchema, SwarmSchema};

    struct Silent;

    #[async_trait]
    impl Completion for Silent {
        async fn get_completion(
            &self,
            args: CompletionArgs,
        ) -> std::result::Result<ModelMessage, CompletionError> {
            Ok(ModelMessage::new(
                MessageRole::Assistant,
                args.agent_name,
                "",
                ExecutionMode::User,
            ))
        }
    }

    fn runtime() -> SwarmRuntime {
        let registry = Registry::builder()
            .agent(AgentSchema::new("a", "you are a", Arc::new(Silent)).with_dependencies(["b"]))
            .agent(AgentSchema::new("b", "you are b", Arc::new(Silent)))
            .swarm(SwarmSchema::new("s", ["a", "b"], "a"))
            .build()
            .unwrap();
        SwarmRuntime::new(registry, SwarmConfig::default())
    }

    fn live_agents(swarm: &ClientSwarm) -> Vec<String> {
        let mut names: Vec<_> = swarm
            .agent_refs()
            .iter()
            .map(|a| a.agent_name().to_string())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn inactive_agent_is_never_cached() {
        let runtime = runtime();
        let _session = runtime.session("c1", "s").unwrap();
        let swarm = runtime.session_swarm("c1").unwrap();

        let err = runtime.agent(&swarm, "b").unwrap_err();
        assert!(matches!(err, SwarmError::AgentNotActive { ref agent, .. } if agent == "b"));
        assert!(swarm.agent_ref("b").is_none());
        assert_eq!(runtime.agent(&swarm, "a").unwrap().agent_name(), "a");
    }

    #[tokio::test]
    async fn stale_caller_gets_nothing_after_switch() {
        let runtime = runtime();
        let _session = runtime.session("c1", "s").unwrap();
        runtime
            .with_active_agent("test", "c1", Some("a"), |_, _| async { Ok(()) })
            .await
            .unwrap()
            .unwrap();
        assert!(runtime.change_to_agent("b", "c1").await.unwrap());

        let ran = runtime
            .with_active_agent("test", "c1", Some("a"), |_, _| async { Ok(()) })
            .await
            .unwrap();
        assert!(ran.is_none());
        let swarm = runtime.session_swarm("c1").unwrap();
        assert_eq!(live_agents(&swarm), vec!["b"]);
    }
}
