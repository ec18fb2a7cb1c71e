use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// EventSource
// ---------------------------------------------------------------------------

/// Topic an event is published under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventSource {
    AgentBus,
    HistoryBus,
    SessionBus,
    StateBus,
    StorageBus,
    SwarmBus,
    ExecutionBus,
    PolicyBus,
    Custom(String),
}

impl EventSource {
    /// Sources used by the runtime itself; unavailable to custom events.
    pub const RESERVED: [EventSource; 8] = [
        EventSource::AgentBus,
        EventSource::HistoryBus,
        EventSource::SessionBus,
        EventSource::StateBus,
        EventSource::StorageBus,
        EventSource::SwarmBus,
        EventSource::ExecutionBus,
        EventSource::PolicyBus,
    ];

    pub fn from_name(name: &str) -> Self {
        match name {
            "agent-bus" => EventSource::AgentBus,
            "history-bus" => EventSource::HistoryBus,
            "session-bus" => EventSource::SessionBus,
            "state-bus" => EventSource::StateBus,
            "storage-bus" => EventSource::StorageBus,
            "swarm-bus" => EventSource::SwarmBus,
            "execution-bus" => EventSource::ExecutionBus,
            "policy-bus" => EventSource::PolicyBus,
            other => EventSource::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventSource::AgentBus => "agent-bus",
            EventSource::HistoryBus => "history-bus",
            EventSource::SessionBus => "session-bus",
            EventSource::StateBus => "state-bus",
            EventSource::StorageBus => "storage-bus",
            EventSource::SwarmBus => "swarm-bus",
            EventSource::ExecutionBus => "execution-bus",
            EventSource::PolicyBus => "policy-bus",
            EventSource::Custom(name) => name,
        }
    }

    pub fn is_reserved(&self) -> bool {
        !matches!(self, EventSource::Custom(_))
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for EventSource {
    fn from(name: String) -> Self {
        match EventSource::from_name(&name) {
            EventSource::Custom(_) => EventSource::Custom(name),
            reserved => reserved,
        }
    }
}

impl From<&str> for EventSource {
    fn from(name: &str) -> Self {
        EventSource::from_name(name)
    }
}

impl From<EventSource> for String {
    fn from(source: EventSource) -> Self {
        match source {
            EventSource::Custom(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// BusEvent
// ---------------------------------------------------------------------------

/// Entities an internal event refers to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusEventContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swarm_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_name: Option<String>,
}

impl BusEventContext {
    pub fn agent(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: Some(agent_name.into()),
            ..Default::default()
        }
    }

    pub fn swarm(swarm_name: impl Into<String>) -> Self {
        Self {
            swarm_name: Some(swarm_name.into()),
            ..Default::default()
        }
    }
}

/// One published event. Internal events fill `kind`, `input`, `output` and
/// `context`; custom events carry a `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEvent {
    pub source: EventSource,
    pub client_id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub context: BusEventContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl BusEvent {
    /// Event raised by the runtime on one of its reserved sources.
    pub fn internal(
        source: EventSource,
        kind: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            source,
            client_id: client_id.into(),
            kind: kind.into(),
            input: serde_json::Value::Object(Default::default()),
            output: serde_json::Value::Object(Default::default()),
            context: BusEventContext::default(),
            payload: None,
        }
    }

    /// Application event on a caller-defined topic.
    pub fn custom(
        client_id: impl Into<String>,
        topic: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            source: EventSource::from(topic.into()),
            client_id: client_id.into(),
            kind: String::new(),
            input: serde_json::Value::Null,
            output: serde_json::Value::Null,
            context: BusEventContext::default(),
            payload: Some(payload),
        }
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = output;
        self
    }

    pub fn with_context(mut self, context: BusEventContext) -> Self {
        self.context = context;
        self
    }
}
