//! Session runtime of the agent swarm.
//!
//! A [`SwarmRuntime`] owns every live client session: which agent is active,
//! the agents' conversation history, the serialized agent-change queue and
//! the execution pipeline that turns a client message into a reply.
//!
//! Key components:
//! - Immutable registry of agents, swarms and tools
//! - Agent changes serialized per client, with navigation loop detection
//! - Execution pipeline with performance accounting and bus events
//! - Commit operations that drop writes aimed at an agent no longer active
//! - Session and connection factories, including scheduled and rate-limited
//!   variants, plus inactivity-based disposal

pub mod agent;
pub mod commit;
pub mod connection;
pub mod dispatcher;
pub mod dispose;
pub mod error;
pub mod events;
pub mod execute;
pub mod history;
pub mod navigation;
pub mod output;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod session_registry;
pub mod swarm;
pub mod template;

pub use connection::{Connection, ConnectionOptions};
pub use dispose::{AutoDispose, AutoDisposeOptions};
pub use error::{Result, SwarmError};
pub use registry::{AgentSchema, Registry, RegistryBuilder, RegistryError, SwarmSchema, Tool, ToolContext};
pub use runtime::SwarmRuntime;
pub use session::Session;
pub use template::{FollowUp, NavigateOptions, NavigateRequest};

pub use sw_bridge::protocol::{BusEvent, EventSource};
pub use sw_harness::context::get_payload;
