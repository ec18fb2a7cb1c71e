//! Observability for the swarm runtime.
//!
//! - **Logging**: human-readable and JSON subscribers via `tracing-subscriber`
//! - **Perf**: per-client execution accounting (counts, durations, payload sizes)
//! - **Spans**: execution ids and spans correlating one client turn

pub mod logging;
pub mod perf;
pub mod spans;
