use std::collections::HashSet;

use dashmap::DashMap;
use tracing::{debug, warn};

use sw_core::types::{AgentName, ClientId, SwarmName};

use crate::error::{Result, SwarmError};

type RouteKey = (ClientId, SwarmName);

/// Agents visited by each (client, swarm) during the current turn.
///
/// A route only grows while a turn runs; `begin_monit` clears it when a new
/// user turn starts. Revisiting an agent is reported as a loop.
#[derive(Debug, Default)]
pub struct NavigationTracker {
    routes: DashMap<RouteKey, HashSet<AgentName>>,
    throw_on_recursion: bool,
}

impl NavigationTracker {
    pub fn new(throw_on_recursion: bool) -> Self {
        Self {
            routes: DashMap::new(),
            throw_on_recursion,
        }
    }

    fn key(client_id: &str, swarm_name: &str) -> RouteKey {
        (client_id.to_string(), swarm_name.to_string())
    }

    /// Visited set for the pair, created empty on first access.
    pub fn get_navigation_route(&self, client_id: &str, swarm_name: &str) -> HashSet<AgentName> {
        self.routes
            .entry(Self::key(client_id, swarm_name))
            .or_default()
            .clone()
    }

    pub fn has_navigation(&self, client_id: &str, swarm_name: &str, agent_name: &str) -> bool {
        self.routes
            .get(&Self::key(client_id, swarm_name))
            .map(|route| route.contains(agent_name))
            .unwrap_or(false)
    }

    /// Record a visit to `agent_name`. Returns `false` (or an error when
    /// configured to) if the agent was already visited this turn.
    pub fn should_navigate(
        &self,
        client_id: &str,
        swarm_name: &str,
        agent_name: &str,
    ) -> Result<bool> {
        let mut route = self.routes.entry(Self::key(client_id, swarm_name)).or_default();
        if route.insert(agent_name.to_string()) {
            debug!(client_id, swarm_name, agent_name, "navigation recorded");
            return Ok(true);
        }
        drop(route);
        warn!(
            client_id,
            swarm_name, agent_name, "navigation loop detected, agent already visited"
        );
        if self.throw_on_recursion {
            return Err(SwarmError::NavigationRecursion {
                client_id: client_id.to_string(),
                agent: agent_name.to_string(),
            });
        }
        Ok(false)
    }

    /// Start a fresh route for a new user turn.
    pub fn begin_monit(&self, client_id: &str, swarm_name: &str) {
        debug!(client_id, swarm_name, "navigation route reset");
        self.routes
            .entry(Self::key(client_id, swarm_name))
            .or_default()
            .clear();
    }

    pub fn dispose(&self, client_id: &str, swarm_name: &str) {
        self.routes.remove(&Self::key(client_id, swarm_name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_visit_navigates_then_loops() {
        let nav = NavigationTracker::new(false);
        assert!(nav.get_navigation_route("c1", "s").is_empty());
        assert!(nav.should_navigate("c1", "s", "b").unwrap());
        assert!(nav.has_navigation("c1", "s", "b"));
        assert!(!nav.should_navigate("c1", "s", "b").unwrap());
        assert!(!nav.should_navigate("c1", "s", "b").unwrap());
    }

    #[test]
    fn recursion_can_raise() {
        let nav = NavigationTracker::new(true);
        assert!(nav.should_navigate("c1", "s", "b").unwrap());
        assert!(matches!(
            nav.should_navigate("c1", "s", "b"),
            Err(SwarmError::NavigationRecursion { .. })
        ));
    }

    #[test]
    fn begin_monit_clears_route() {
        let nav = NavigationTracker::new(false);
        nav.should_navigate("c1", "s", "b").unwrap();
        nav.begin_monit("c1", "s");
        assert!(!nav.has_navigation("c1", "s", "b"));
        assert!(nav.should_navigate("c1", "s", "b").unwrap());
    }

    #[test]
    fn routes_are_per_client() {
        let nav = NavigationTracker::new(false);
        nav.should_navigate("c1", "s", "b").unwrap();
        assert!(!nav.has_navigation("c2", "s", "b"));
        nav.dispose("c1", "s");
        assert!(!nav.has_navigation("c1", "s", "b"));
    }
}
