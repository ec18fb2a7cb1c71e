//! Session factories and the one-shot `complete` helper.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use sw_core::types::{ClientId, SessionMode, SwarmName};
use sw_harness::context::{run_with_payload, MethodContext, PayloadContext};

use crate::connection::{ConnectionOptions, Shaping};
use crate::error::Result;
use crate::runtime::{enter, SwarmRuntime};

/// Handle of a `session` mode client. Every `complete` runs as a user turn on
/// the client's execution lane and returns the reply.
#[derive(Debug, Clone)]
pub struct Session {
    runtime: SwarmRuntime,
    client_id: ClientId,
    swarm_name: SwarmName,
    shaping: Shaping,
    mounted: Arc<AtomicBool>,
}

impl SwarmRuntime {
    /// Open a session for `client_id` on `swarm_name`.
    pub fn session(&self, client_id: &str, swarm_name: &str) -> Result<Session> {
        self.open_session(client_id, swarm_name, Shaping::Direct)
    }

    /// Session whose sends are delayed and coalesced like
    /// [`SwarmRuntime::make_connection_scheduled`].
    pub fn session_scheduled(
        &self,
        client_id: &str,
        swarm_name: &str,
        options: ConnectionOptions,
    ) -> Result<Session> {
        let delay = options
            .delay
            .unwrap_or_else(|| self.inner.config.connection.scheduled_delay());
        self.open_session(client_id, swarm_name, Shaping::scheduled(delay))
    }

    /// Session allowing one send per interval, like
    /// [`SwarmRuntime::make_connection_rate`]. The interval defaults to the
    /// scheduled delay.
    pub fn session_rate(
        &self,
        client_id: &str,
        swarm_name: &str,
        options: ConnectionOptions,
    ) -> Result<Session> {
        let interval = options
            .delay
            .unwrap_or_else(|| self.inner.config.connection.scheduled_delay());
        self.open_session(client_id, swarm_name, Shaping::rate(interval))
    }

    fn open_session(&self, client_id: &str, swarm_name: &str, shaping: Shaping) -> Result<Session> {
        self.inner.registry.validate_swarm(swarm_name)?;
        self.inner
            .sessions
            .add_session(client_id, swarm_name, SessionMode::Session, None)?;
        Ok(Session {
            runtime: self.clone(),
            client_id: client_id.to_string(),
            swarm_name: swarm_name.to_string(),
            shaping,
            mounted: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Open a throwaway session, run one turn and dispose everything again.
    /// Calls for the same (client, swarm) run one after another.
    pub async fn complete(&self, content: &str, client_id: &str, swarm_name: &str) -> Result<String> {
        let ctx = MethodContext::new("complete", client_id).with_swarm(swarm_name);
        enter(ctx, self.complete_once(content, client_id, swarm_name)).await
    }

    /// [`SwarmRuntime::complete`] with `payload` readable through
    /// `get_payload` by the tools and completions of the turn.
    pub async fn complete_with_payload<P>(
        &self,
        content: &str,
        client_id: &str,
        swarm_name: &str,
        payload: P,
    ) -> Result<String>
    where
        P: Any + Send + Sync,
    {
        let ctx = MethodContext::new("complete", client_id).with_swarm(swarm_name);
        let payload = PayloadContext::new(client_id, payload);
        run_with_payload(payload, enter(ctx, self.complete_once(content, client_id, swarm_name)))
            .await
    }

    async fn complete_once(&self, content: &str, client_id: &str, swarm_name: &str) -> Result<String> {
        self.inner.registry.validate_swarm(swarm_name)?;
        let key = (client_id.to_string(), swarm_name.to_string());
        self.inner
            .executions
            .run(key, async {
                self.inner
                    .sessions
                    .add_session(client_id, swarm_name, SessionMode::Complete, None)?;
                let result = self
                    .user_turn("complete", client_id, swarm_name, content, true)
                    .await;
                if let Err(err) = self.dispose_connection(client_id, swarm_name).await {
                    warn!(client_id, swarm_name, error = %err, "one-shot session dispose failed");
                }
                result
            })
            .await
    }
}

impl Session {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn swarm_name(&self) -> &str {
        &self.swarm_name
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    /// Run `content` as a user turn and return the reply.
    pub async fn complete(&self, content: &str) -> Result<String> {
        self.complete_inner(content, None).await
    }

    /// Like [`Session::complete`], with `payload` readable through
    /// `get_payload` during the turn.
    pub async fn complete_with_payload<P>(&self, content: &str, payload: P) -> Result<String>
    where
        P: Any + Send + Sync,
    {
        let payload = PayloadContext::new(self.client_id.as_str(), payload);
        self.complete_inner(content, Some(payload)).await
    }

    async fn complete_inner(&self, content: &str, payload: Option<PayloadContext>) -> Result<String> {
        let ctx = MethodContext::new("session", self.client_id.as_str())
            .with_swarm(self.swarm_name.as_str());
        enter(
            ctx,
            self.runtime.shaped_turn(
                &self.shaping,
                "session",
                &self.client_id,
                &self.swarm_name,
                content,
                payload,
            ),
        )
        .await
    }

    /// Tear the session down. Only the first call has an effect.
    pub async fn dispose(&self) -> Result<()> {
        if !self.mounted.swap(false, Ordering::SeqCst) {
            debug!(client_id = %self.client_id, "session already disposed");
            return Ok(());
        }
        self.shaping.cancel_pending();
        self.runtime
            .dispose_connection(&self.client_id, &self.swarm_name)
            .await
    }
}
