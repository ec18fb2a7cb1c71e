//! Bridge layer: the in-process event bus the swarm runtime reports through.
//!
//! - [`protocol`]: bus event shape and the reserved internal sources
//! - [`event_bus`]: per-(client, source) pub/sub with ordered delivery

pub mod event_bus;
pub mod protocol;
