//! Harness: the concurrency primitives the swarm runtime is assembled from.
//!
//! - Ambient call context carried through task-local scopes
//! - TTL-cached keyed serial queues (one FIFO lane per key)
//! - Per-key rate limiting and trailing-edge scheduling of calls
//! - Cooperative shutdown of background sweeps

pub mod context;
pub mod keyed_queue;
pub mod rate_limiter;
pub mod schedule;
pub mod shutdown;
