use ahash::AHashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Per-client counters
// ---------------------------------------------------------------------------

fn average_time(total: Duration, count: u64) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    total.div_f64(count as f64)
}

#[derive(Debug, Default)]
struct ClientPerf {
    /// Open executions: execution id -> stack of start instants.
    open: AHashMap<String, Vec<Instant>>,
    count: u64,
    input_len: u64,
    output_len: u64,
    time: Duration,
}

/// Snapshot of one client's execution accounting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerfRecord {
    pub client_id: String,
    pub execution_count: u64,
    pub execution_input_total: u64,
    pub execution_output_total: u64,
    pub execution_input_average: f64,
    pub execution_output_average: f64,
    pub execution_time_total_ms: u64,
    pub execution_time_average_ms: f64,
}

// ---------------------------------------------------------------------------
// PerfService
// ---------------------------------------------------------------------------

/// Execution accounting for every client of the runtime.
///
/// Each `start_execution` pushes a start instant under its execution id;
/// `end_execution` pops it. Count and input totals move at start, time and
/// output totals on a matched end.
#[derive(Debug, Default)]
pub struct PerfService {
    clients: RwLock<AHashMap<String, ClientPerf>>,
    total_response_ms: AtomicU64,
    total_request_count: AtomicU64,
}

impl PerfService {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, AHashMap<String, ClientPerf>> {
        self.clients.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, AHashMap<String, ClientPerf>> {
        self.clients.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn start_execution(&self, execution_id: &str, client_id: &str, input_len: usize) {
        tracing::debug!(execution_id, client_id, input_len, "perf start_execution");
        let mut map = self.write();
        let client = map.entry(client_id.to_string()).or_default();
        client
            .open
            .entry(execution_id.to_string())
            .or_default()
            .push(Instant::now());
        client.count += 1;
        client.input_len += input_len as u64;
    }

    /// Close an execution. Returns `false` when no matching start is open.
    pub fn end_execution(&self, execution_id: &str, client_id: &str, output_len: usize) -> bool {
        tracing::debug!(execution_id, client_id, output_len, "perf end_execution");
        let mut map = self.write();
        let Some(client) = map.get_mut(client_id) else {
            return false;
        };
        let Some(stack) = client.open.get_mut(execution_id) else {
            return false;
        };
        let Some(started) = stack.pop() else {
            return false;
        };
        if stack.is_empty() {
            client.open.remove(execution_id);
        }
        let elapsed = started.elapsed();
        client.output_len += output_len as u64;
        client.time += elapsed;
        self.total_response_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        self.total_request_count.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Executions started but not yet ended for a client.
    pub fn open_executions(&self, client_id: &str) -> usize {
        self.read()
            .get(client_id)
            .map(|c| c.open.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn active_session_execution_count(&self, client_id: &str) -> u64 {
        self.read().get(client_id).map(|c| c.count).unwrap_or(0)
    }

    pub fn active_session_execution_total_time(&self, client_id: &str) -> Duration {
        self.read()
            .get(client_id)
            .map(|c| c.time)
            .unwrap_or_default()
    }

    pub fn active_session_execution_average_time(&self, client_id: &str) -> Duration {
        match self.read().get(client_id) {
            Some(c) => average_time(c.time, c.count),
            None => Duration::ZERO,
        }
    }

    pub fn active_session_total_input_length(&self, client_id: &str) -> u64 {
        self.read().get(client_id).map(|c| c.input_len).unwrap_or(0)
    }

    pub fn active_session_total_output_length(&self, client_id: &str) -> u64 {
        self.read().get(client_id).map(|c| c.output_len).unwrap_or(0)
    }

    pub fn active_session_average_input_length(&self, client_id: &str) -> f64 {
        match self.read().get(client_id) {
            Some(c) if c.count > 0 => c.input_len as f64 / c.count as f64,
            _ => 0.0,
        }
    }

    pub fn active_session_average_output_length(&self, client_id: &str) -> f64 {
        match self.read().get(client_id) {
            Some(c) if c.count > 0 => c.output_len as f64 / c.count as f64,
            _ => 0.0,
        }
    }

    /// Clients with accounting records, sorted.
    pub fn active_clients(&self) -> Vec<String> {
        let mut clients: Vec<String> = self.read().keys().cloned().collect();
        clients.sort();
        clients
    }

    pub fn total_execution_count(&self) -> u64 {
        self.total_request_count.load(Ordering::Relaxed)
    }

    pub fn total_response_time(&self) -> Duration {
        Duration::from_millis(self.total_response_ms.load(Ordering::Relaxed))
    }

    pub fn average_response_time(&self) -> Duration {
        let count = self.total_execution_count();
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.total_response_ms.load(Ordering::Relaxed) / count)
    }

    pub fn to_record(&self, client_id: &str) -> PerfRecord {
        let map = self.read();
        let (count, input, output, time) = map
            .get(client_id)
            .map(|c| (c.count, c.input_len, c.output_len, c.time))
            .unwrap_or((0, 0, 0, Duration::ZERO));
        let avg = |total: f64| if count > 0 { total / count as f64 } else { 0.0 };
        PerfRecord {
            client_id: client_id.to_string(),
            execution_count: count,
            execution_input_total: input,
            execution_output_total: output,
            execution_input_average: avg(input as f64),
            execution_output_average: avg(output as f64),
            execution_time_total_ms: time.as_millis() as u64,
            execution_time_average_ms: avg(time.as_millis() as f64),
        }
    }

    /// Drop every record for a client. Global totals are kept.
    pub fn dispose(&self, client_id: &str) {
        tracing::debug!(client_id, "perf dispose");
        self.write().remove(client_id);
    }
}
