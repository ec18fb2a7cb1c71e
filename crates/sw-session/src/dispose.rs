//! Session teardown and inactivity-based auto-dispose.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use sw_harness::context::MethodContext;

use crate::error::Result;
use crate::runtime::{enter, SwarmRuntime};

impl SwarmRuntime {
    /// Drop everything held for `client_id`: agents, swarm state, history,
    /// bus subscriptions, perf records, navigation routes, idle queue lanes
    /// and finally the session itself. Calling it again is a no-op.
    pub async fn dispose_connection(&self, client_id: &str, swarm_name: &str) -> Result<()> {
        let ctx = MethodContext::new("dispose_connection", client_id).with_swarm(swarm_name);
        enter(ctx, async {
            let key = (client_id.to_string(), swarm_name.to_string());
            let had_session = self.inner.sessions.has_session(client_id);
            let swarm = self.inner.swarms.remove(&key).map(|(_, swarm)| swarm);
            if !had_session && swarm.is_none() {
                debug!(client_id, swarm_name, "nothing to dispose");
                return Ok(());
            }

            if let Some(swarm) = swarm {
                // Release anyone still waiting on this swarm's output.
                swarm.cancel_output();
                for agent in swarm.agent_refs() {
                    if let Some(agent) = swarm.take_agent_ref(agent.agent_name()) {
                        if let Err(err) = agent.dispose().await {
                            warn!(client_id, agent_name = %agent.agent_name(), error = %err, "agent dispose failed");
                        }
                    }
                }
            }
            self.inner.history.dispose(client_id).await?;
            let subscriptions = self.inner.bus.dispose_client(client_id);
            self.inner.perf.dispose(client_id);
            self.inner.navigation.dispose(client_id, swarm_name);
            self.inner.dispatcher.remove(&key.0);
            self.inner.executions.remove(&key);
            self.inner.sessions.remove_session(client_id);
            info!(client_id, swarm_name, subscriptions, "connection disposed");
            Ok(())
        })
        .await
    }

    /// Watch `client_id` for inactivity and dispose its connection once no
    /// [`AutoDispose::tick`] arrived for the timeout. The watcher stops on
    /// [`AutoDispose::destroy`] or runtime shutdown. Must be called inside a
    /// tokio runtime.
    pub fn make_auto_dispose(
        &self,
        client_id: &str,
        swarm_name: &str,
        options: AutoDisposeOptions,
    ) -> AutoDispose {
        let config = &self.inner.config.session;
        let timeout = options.timeout.unwrap_or_else(|| config.inactivity_timeout());
        let check = options.check_interval.unwrap_or_else(|| config.inactivity_check());
        let state = Arc::new(WatchState {
            last_tick: Mutex::new(Instant::now()),
            stopped: AtomicBool::new(false),
            stop: Notify::new(),
        });

        let runtime = self.clone();
        let watched = state.clone();
        let client_id = client_id.to_string();
        let swarm_name = swarm_name.to_string();
        let guard = self.inner.shutdown.guard();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            let _guard = guard;
            let mut ticker = tokio::time::interval_at(Instant::now() + check, check);
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = watched.stop.notified() => break,
                    _ = ticker.tick() => {
                        if watched.idle_for() < timeout {
                            continue;
                        }
                        info!(client_id = %client_id, swarm_name = %swarm_name, "disposing inactive connection");
                        if let Err(err) = runtime.dispose_connection(&client_id, &swarm_name).await {
                            warn!(client_id = %client_id, error = %err, "auto-dispose failed");
                        }
                        break;
                    }
                }
            }
            debug!(client_id = %client_id, "auto-dispose watcher stopped");
        });

        AutoDispose { state }
    }
}

/// Overrides for [`SwarmRuntime::make_auto_dispose`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoDisposeOptions {
    pub timeout: Option<Duration>,
    pub check_interval: Option<Duration>,
}

#[derive(Debug)]
struct WatchState {
    last_tick: Mutex<Instant>,
    stopped: AtomicBool,
    stop: Notify,
}

impl WatchState {
    fn idle_for(&self) -> Duration {
        self.last_tick
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }
}

/// Handle of an auto-dispose watcher.
#[derive(Debug, Clone)]
pub struct AutoDispose {
    state: Arc<WatchState>,
}

impl AutoDispose {
    /// Record activity, restarting the inactivity timeout.
    pub fn tick(&self) {
        *self
            .state
            .last_tick
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    /// Stop watching without disposing anything.
    pub fn destroy(&self) {
        if !self.state.stopped.swap(true, Ordering::SeqCst) {
            self.state.stop.notify_one();
        }
    }
}
