//! `makeConnection` factories: a receive callback wired to a queued send,
//! plus the scheduled and rate-limited variants.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, warn};

use sw_core::types::{ClientId, ExecutionMode, OutgoingMessage, SessionMode, SwarmName};
use sw_harness::context::{run_with_payload, MethodContext, PayloadContext};
use sw_harness::rate_limiter::{RateLimitConfig, RateLimitError, RateLimiter};
use sw_harness::schedule::Debouncer;

use crate::error::Result;
use crate::runtime::{enter, SwarmRuntime};
use crate::session_registry::ReceiveFn;

/// Options of the scheduled and rate-limited factories.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionOptions {
    /// Overrides the configured delay or interval.
    pub delay: Option<Duration>,
}

impl ConnectionOptions {
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay: Some(delay) }
    }
}

/// How sends of one connection or session are shaped before they reach the
/// execution queue.
#[derive(Debug, Clone)]
pub(crate) enum Shaping {
    Direct,
    /// Each send waits out the delay; only the latest one runs a turn.
    Scheduled(Arc<Debouncer>),
    /// At most one send per interval; the rest resolve empty.
    Rate(Arc<RateLimiter>),
}

impl Shaping {
    pub(crate) fn scheduled(delay: Duration) -> Self {
        Shaping::Scheduled(Arc::new(Debouncer::new(delay)))
    }

    pub(crate) fn rate(interval: Duration) -> Self {
        Shaping::Rate(Arc::new(RateLimiter::new(RateLimitConfig::per_interval(interval))))
    }

    /// Resolve sends still waiting out a scheduled delay.
    pub(crate) fn cancel_pending(&self) {
        if let Shaping::Scheduled(debouncer) = self {
            debouncer.cancel();
        }
    }
}

impl SwarmRuntime {
    /// A user turn on the (client, swarm) execution lane.
    pub(crate) async fn queued_turn(
        &self,
        method: &'static str,
        client_id: &str,
        swarm_name: &str,
        content: &str,
        commit_input: bool,
    ) -> Result<String> {
        let key = (client_id.to_string(), swarm_name.to_string());
        self.inner
            .executions
            .run(key, self.user_turn(method, client_id, swarm_name, content, commit_input))
            .await
    }

    /// Apply `shaping` to one send, then run the turn.
    pub(crate) async fn shaped_turn(
        &self,
        shaping: &Shaping,
        method: &'static str,
        client_id: &str,
        swarm_name: &str,
        content: &str,
        payload: Option<PayloadContext>,
    ) -> Result<String> {
        let turn = async {
            match shaping {
                Shaping::Direct => {
                    self.queued_turn(method, client_id, swarm_name, content, true)
                        .await
                }
                Shaping::Scheduled(debouncer) => {
                    // The transcript keeps every input in arrival order even
                    // when the turn itself is coalesced.
                    self.commit_user_message_force(content, ExecutionMode::User, client_id)
                        .await?;
                    let ran = debouncer
                        .schedule(|| async {
                            if !self.has_session(client_id) {
                                debug!(client_id, "session gone before scheduled send");
                                return Ok(String::new());
                            }
                            self.queued_turn(method, client_id, swarm_name, content, false)
                                .await
                        })
                        .await;
                    match ran {
                        Some(result) => result,
                        None => {
                            debug!(client_id, "scheduled send superseded");
                            Ok(String::new())
                        }
                    }
                }
                Shaping::Rate(limiter) => match limiter.check(client_id) {
                    Ok(()) => {
                        self.queued_turn(method, client_id, swarm_name, content, true)
                            .await
                    }
                    Err(RateLimitError::Exceeded { retry_after, .. }) => {
                        warn!(
                            client_id,
                            retry_after_ms = retry_after.as_millis() as u64,
                            "send dropped by rate limit"
                        );
                        Ok(String::new())
                    }
                },
            }
        };
        match payload {
            Some(payload) => run_with_payload(payload, turn).await,
            None => turn.await,
        }
    }

    /// Register a `makeConnection` session for `client_id` and return its
    /// send handle. Replies of every turn go to `receive`.
    pub fn make_connection<F, Fut>(&self, receive: F, client_id: &str, swarm_name: &str) -> Result<Connection>
    where
        F: Fn(OutgoingMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.connect(receive, client_id, swarm_name, Shaping::Direct)
    }

    /// Like [`SwarmRuntime::make_connection`], delaying every send by the
    /// scheduled delay. Sends arriving within the delay are coalesced into
    /// one turn; the superseded ones resolve to an empty string.
    pub fn make_connection_scheduled<F, Fut>(
        &self,
        receive: F,
        client_id: &str,
        swarm_name: &str,
        options: ConnectionOptions,
    ) -> Result<Connection>
    where
        F: Fn(OutgoingMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let delay = options
            .delay
            .unwrap_or_else(|| self.inner.config.connection.scheduled_delay());
        self.connect(receive, client_id, swarm_name, Shaping::scheduled(delay))
    }

    /// Like [`SwarmRuntime::make_connection`], allowing one send per rate
    /// interval. Excess sends resolve to an empty string.
    pub fn make_connection_rate<F, Fut>(
        &self,
        receive: F,
        client_id: &str,
        swarm_name: &str,
        options: ConnectionOptions,
    ) -> Result<Connection>
    where
        F: Fn(OutgoingMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let interval = options
            .delay
            .unwrap_or_else(|| self.inner.config.connection.rate_delay());
        self.connect(receive, client_id, swarm_name, Shaping::rate(interval))
    }

    fn connect<F, Fut>(
        &self,
        receive: F,
        client_id: &str,
        swarm_name: &str,
        shaping: Shaping,
    ) -> Result<Connection>
    where
        F: Fn(OutgoingMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.registry.validate_swarm(swarm_name)?;
        let receive: ReceiveFn = Arc::new(move |message| receive(message).boxed());
        self.inner.sessions.add_session(
            client_id,
            swarm_name,
            SessionMode::MakeConnection,
            Some(receive),
        )?;
        Ok(Connection {
            runtime: self.clone(),
            client_id: client_id.to_string(),
            swarm_name: swarm_name.to_string(),
            shaping,
        })
    }
}

/// Send handle of a `makeConnection` session.
#[derive(Debug, Clone)]
pub struct Connection {
    runtime: SwarmRuntime,
    client_id: ClientId,
    swarm_name: SwarmName,
    shaping: Shaping,
}

impl Connection {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn swarm_name(&self) -> &str {
        &self.swarm_name
    }

    /// Run `content` as a user turn. A non-empty reply is handed to the
    /// receive callback and also returned.
    pub async fn send(&self, content: &str) -> Result<String> {
        let ctx = MethodContext::new("make_connection", self.client_id.as_str())
            .with_swarm(self.swarm_name.as_str());
        let runtime = &self.runtime;
        enter(ctx, async {
            let output = runtime
                .shaped_turn(
                    &self.shaping,
                    "make_connection",
                    &self.client_id,
                    &self.swarm_name,
                    content,
                    None,
                )
                .await?;
            if !output.is_empty() {
                self.deliver_reply(&output).await;
            }
            Ok(output)
        })
        .await
    }

    async fn deliver_reply(&self, data: &str) {
        let inner = &self.runtime.inner;
        let Some(receive) = inner.sessions.receiver(&self.client_id) else {
            return;
        };
        let agent_name = self
            .runtime
            .get_agent_name(&self.client_id)
            .unwrap_or_default();
        receive(OutgoingMessage {
            client_id: self.client_id.clone(),
            agent_name,
            data: data.to_string(),
        })
        .await;
    }

    /// Tear down the session and everything it holds. Sends still waiting
    /// on a scheduled delay resolve to an empty string.
    pub async fn dispose(&self) -> Result<()> {
        self.shaping.cancel_pending();
        self.runtime
            .dispose_connection(&self.client_id, &self.swarm_name)
            .await
    }
}
