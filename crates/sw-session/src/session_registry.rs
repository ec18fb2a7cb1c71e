use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tracing::{debug, info};

use sw_core::types::{ClientId, OutgoingMessage, SessionMode, SwarmName};

use crate::error::{Result, SwarmError};

/// Callback a `makeConnection` client receives its outgoing messages on.
pub type ReceiveFn = Arc<dyn Fn(OutgoingMessage) -> BoxFuture<'static, ()> + Send + Sync>;

struct SessionEntry {
    swarm_name: SwarmName,
    mode: SessionMode,
    last_activity: DateTime<Utc>,
    receiver: Option<ReceiveFn>,
}

/// Live client sessions. A session must be registered here before any other
/// operation may run against its client id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<ClientId, SessionEntry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `client_id` against `swarm_name`. A client holds at most one
    /// session at a time.
    pub fn add_session(
        &self,
        client_id: &str,
        swarm_name: &str,
        mode: SessionMode,
        receiver: Option<ReceiveFn>,
    ) -> Result<()> {
        match self.sessions.entry(client_id.to_string()) {
            Entry::Occupied(_) => Err(SwarmError::SessionExists(client_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(SessionEntry {
                    swarm_name: swarm_name.to_string(),
                    mode,
                    last_activity: Utc::now(),
                    receiver,
                });
                info!(client_id, swarm_name, %mode, "session added");
                Ok(())
            }
        }
    }

    pub fn remove_session(&self, client_id: &str) -> bool {
        let removed = self.sessions.remove(client_id).is_some();
        if removed {
            info!(client_id, "session removed");
        }
        removed
    }

    pub fn has_session(&self, client_id: &str) -> bool {
        self.sessions.contains_key(client_id)
    }

    pub fn validate(&self, client_id: &str) -> Result<()> {
        if self.has_session(client_id) {
            Ok(())
        } else {
            Err(SwarmError::SessionNotFound(client_id.to_string()))
        }
    }

    pub fn get_swarm(&self, client_id: &str) -> Result<SwarmName> {
        self.sessions
            .get(client_id)
            .map(|s| s.swarm_name.clone())
            .ok_or_else(|| SwarmError::SessionNotFound(client_id.to_string()))
    }

    pub fn get_session_mode(&self, client_id: &str) -> Result<SessionMode> {
        self.sessions
            .get(client_id)
            .map(|s| s.mode)
            .ok_or_else(|| SwarmError::SessionNotFound(client_id.to_string()))
    }

    /// Fail with `ModeMismatch` unless the session was opened with `expected`.
    pub fn require_mode(
        &self,
        method: &'static str,
        client_id: &str,
        expected: SessionMode,
    ) -> Result<()> {
        let actual = self.get_session_mode(client_id)?;
        if actual != expected {
            return Err(SwarmError::ModeMismatch {
                method,
                client_id: client_id.to_string(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    pub fn receiver(&self, client_id: &str) -> Option<ReceiveFn> {
        self.sessions
            .get(client_id)
            .and_then(|s| s.receiver.clone())
    }

    pub fn session_list(&self) -> Vec<ClientId> {
        let mut list: Vec<ClientId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        list.sort();
        list
    }

    /// Record activity on a session.
    pub fn touch(&self, client_id: &str) {
        if let Some(mut entry) = self.sessions.get_mut(client_id) {
            entry.last_activity = Utc::now();
            debug!(client_id, "session touched");
        }
    }

    pub fn last_activity(&self, client_id: &str) -> Option<DateTime<Utc>> {
        self.sessions.get(client_id).map(|s| s.last_activity)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.session_list())
            .finish()
    }
}
