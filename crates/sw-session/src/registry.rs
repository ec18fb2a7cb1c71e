//! Immutable catalogue of the agents, swarms and tools a runtime serves.
//!
//! Schemas are collected with [`RegistryBuilder`] during start-up; `build()`
//! checks every cross reference once, after which the [`Registry`] is shared
//! read-only by the runtime.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use sw_core::completion::{Completion, ToolSchema};
use sw_core::types::{AgentName, SwarmName, ToolName};

use crate::error::{Result, SwarmError};
use crate::runtime::SwarmRuntime;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate agent name: `{0}`")]
    DuplicateAgent(String),
    #[error("duplicate swarm name: `{0}`")]
    DuplicateSwarm(String),
    #[error("duplicate tool name: `{0}`")]
    DuplicateTool(String),
    #[error("swarm `{swarm}` lists unknown agent `{agent}`")]
    UnknownSwarmAgent { swarm: String, agent: String },
    #[error("swarm `{swarm}` default agent `{agent}` is not in its agent list")]
    DefaultNotInSwarm { swarm: String, agent: String },
    #[error("swarm `{0}` has no agents")]
    EmptySwarm(String),
    #[error("agent `{agent}` uses unknown tool `{tool}`")]
    UnknownTool { agent: String, tool: String },
    #[error("agent `{agent}` depends on unknown agent `{dependency}`")]
    UnknownDependency { agent: String, dependency: String },
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

/// Arguments of one tool invocation.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Id of the tool call; pass it back through `commit_tool_output`.
    pub tool_id: String,
    pub client_id: String,
    pub agent_name: AgentName,
    pub params: serde_json::Value,
    /// Whether this is the final call of the model's tool-call batch.
    pub is_last: bool,
    /// Runtime handle for calling back into public operations.
    pub runtime: SwarmRuntime,
}

/// A function the model may call. Implementations usually finish by
/// committing a tool output or navigating to another agent.
#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;

    async fn call(&self, ctx: ToolContext) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Schemas
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AgentSchema {
    pub name: AgentName,
    pub prompt: String,
    pub completion: Arc<dyn Completion>,
    pub tools: Vec<ToolName>,
    /// Extra system prompts placed after the main prompt.
    pub system: Vec<String>,
    /// Agents this one is expected to hand off to.
    pub dependencies: Vec<AgentName>,
}

impl AgentSchema {
    pub fn new(
        name: impl Into<AgentName>,
        prompt: impl Into<String>,
        completion: Arc<dyn Completion>,
    ) -> Self {
        Self {
            name: name.into(),
            prompt: prompt.into(),
            completion,
            tools: Vec::new(),
            system: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ToolName>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system.push(system.into());
        self
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<AgentName>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }
}

impl fmt::Debug for AgentSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentSchema")
            .field("name", &self.name)
            .field("tools", &self.tools)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct SwarmSchema {
    pub name: SwarmName,
    pub agents: Vec<AgentName>,
    pub default_agent: AgentName,
}

impl SwarmSchema {
    pub fn new<I, S>(name: impl Into<SwarmName>, agents: I, default_agent: impl Into<AgentName>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<AgentName>,
    {
        Self {
            name: name.into(),
            agents: agents.into_iter().map(Into::into).collect(),
            default_agent: default_agent.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// RegistryBuilder
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RegistryBuilder {
    agents: Vec<AgentSchema>,
    swarms: Vec<SwarmSchema>,
    tools: Vec<Arc<dyn Tool>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn agent(mut self, schema: AgentSchema) -> Self {
        self.agents.push(schema);
        self
    }

    pub fn swarm(mut self, schema: SwarmSchema) -> Self {
        self.swarms.push(schema);
        self
    }

    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    /// Check every cross reference and freeze the catalogue.
    pub fn build(self) -> std::result::Result<Registry, RegistryError> {
        let mut tools: HashMap<ToolName, Arc<dyn Tool>> = HashMap::new();
        for tool in self.tools {
            let name = tool.schema().name;
            if tools.contains_key(&name) {
                return Err(RegistryError::DuplicateTool(name));
            }
            tools.insert(name, tool);
        }

        let mut agents: HashMap<AgentName, Arc<AgentSchema>> = HashMap::new();
        for agent in self.agents {
            if agents.contains_key(&agent.name) {
                return Err(RegistryError::DuplicateAgent(agent.name));
            }
            if let Some(tool) = agent.tools.iter().find(|t| !tools.contains_key(*t)) {
                return Err(RegistryError::UnknownTool {
                    agent: agent.name.clone(),
                    tool: tool.clone(),
                });
            }
            agents.insert(agent.name.clone(), Arc::new(agent));
        }
        for agent in agents.values() {
            if let Some(dep) = agent.dependencies.iter().find(|d| !agents.contains_key(*d)) {
                return Err(RegistryError::UnknownDependency {
                    agent: agent.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        let mut swarms: HashMap<SwarmName, Arc<SwarmSchema>> = HashMap::new();
        for swarm in self.swarms {
            if swarms.contains_key(&swarm.name) {
                return Err(RegistryError::DuplicateSwarm(swarm.name));
            }
            if swarm.agents.is_empty() {
                return Err(RegistryError::EmptySwarm(swarm.name));
            }
            if let Some(agent) = swarm.agents.iter().find(|a| !agents.contains_key(*a)) {
                return Err(RegistryError::UnknownSwarmAgent {
                    swarm: swarm.name.clone(),
                    agent: agent.clone(),
                });
            }
            if !swarm.agents.contains(&swarm.default_agent) {
                return Err(RegistryError::DefaultNotInSwarm {
                    swarm: swarm.name.clone(),
                    agent: swarm.default_agent.clone(),
                });
            }
            swarms.insert(swarm.name.clone(), Arc::new(swarm));
        }

        info!(
            agents = agents.len(),
            swarms = swarms.len(),
            tools = tools.len(),
            "registry built"
        );
        Ok(Registry {
            agents,
            swarms,
            tools,
        })
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct Registry {
    agents: HashMap<AgentName, Arc<AgentSchema>>,
    swarms: HashMap<SwarmName, Arc<SwarmSchema>>,
    tools: HashMap<ToolName, Arc<dyn Tool>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn validate_agent(&self, agent_name: &str) -> Result<()> {
        if self.agents.contains_key(agent_name) {
            Ok(())
        } else {
            Err(SwarmError::AgentNotRegistered(agent_name.to_string()))
        }
    }

    pub fn validate_swarm(&self, swarm_name: &str) -> Result<()> {
        if self.swarms.contains_key(swarm_name) {
            Ok(())
        } else {
            Err(SwarmError::SwarmNotRegistered(swarm_name.to_string()))
        }
    }

    pub fn validate_tool(&self, tool_name: &str) -> Result<()> {
        if self.tools.contains_key(tool_name) {
            Ok(())
        } else {
            Err(SwarmError::ToolNotRegistered(tool_name.to_string()))
        }
    }

    pub fn agent(&self, agent_name: &str) -> Result<Arc<AgentSchema>> {
        self.agents
            .get(agent_name)
            .cloned()
            .ok_or_else(|| SwarmError::AgentNotRegistered(agent_name.to_string()))
    }

    pub fn swarm(&self, swarm_name: &str) -> Result<Arc<SwarmSchema>> {
        self.swarms
            .get(swarm_name)
            .cloned()
            .ok_or_else(|| SwarmError::SwarmNotRegistered(swarm_name.to_string()))
    }

    pub fn tool(&self, tool_name: &str) -> Result<Arc<dyn Tool>> {
        self.tools
            .get(tool_name)
            .cloned()
            .ok_or_else(|| SwarmError::ToolNotRegistered(tool_name.to_string()))
    }

    /// Tool schemas advertised to `agent_name`'s completion.
    pub fn tool_schemas(&self, agent_name: &str) -> Vec<ToolSchema> {
        let Some(agent) = self.agents.get(agent_name) else {
            return Vec::new();
        };
        agent
            .tools
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.schema())
            .collect()
    }

    pub fn agent_list(&self, swarm_name: &str) -> Result<Vec<AgentName>> {
        Ok(self.swarm(swarm_name)?.agents.clone())
    }

    pub fn default_agent(&self, swarm_name: &str) -> Result<AgentName> {
        Ok(self.swarm(swarm_name)?.default_agent.clone())
    }

    pub fn swarm_has_agent(&self, swarm_name: &str, agent_name: &str) -> bool {
        self.swarms
            .get(swarm_name)
            .map(|s| s.agents.iter().any(|a| a == agent_name))
            .unwrap_or(false)
    }

    /// Whether `from` declares `to` as a dependency. Switching to oneself
    /// always counts as declared.
    pub fn has_dependency(&self, from: &str, to: &str) -> bool {
        if from == to {
            return true;
        }
        let found = self
            .agents
            .get(from)
            .map(|a| a.dependencies.iter().any(|d| d == to))
            .unwrap_or(false);
        debug!(from, to, found, "dependency lookup");
        found
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut swarms: Vec<_> = self.swarms.keys().collect();
        swarms.sort();
        f.debug_struct("Registry")
            .field("agents", &self.agents.len())
            .field("swarms", &swarms)
            .field("tools", &self.tools.len())
            .finish()
    }
}
