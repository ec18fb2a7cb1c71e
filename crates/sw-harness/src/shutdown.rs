use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// ShutdownSignal: stops background sweeps and watchers
// ---------------------------------------------------------------------------

/// Shutdown coordinator shared by every background task of a runtime.
///
/// The flag is held in a watch channel, so a listener created after
/// `trigger()` still observes it. Tasks that must be waited on hold a
/// [`ShutdownGuard`]; `wait_for_drain` resolves once all guards are dropped.
///
/// ```ignore
/// let shutdown = ShutdownSignal::new();
/// let mut listener = shutdown.subscribe();
///
/// tokio::select! {
///     _ = listener.wait() => { /* stop */ }
///     _ = ticker.tick() => { /* sweep */ }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    state: Arc<watch::Sender<bool>>,
    active: Arc<watch::Sender<usize>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        let (active, _) = watch::channel(0);
        Self {
            state: Arc::new(state),
            active: Arc::new(active),
        }
    }

    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.state.subscribe(),
        }
    }

    /// Check if shutdown has been triggered (non-blocking).
    pub fn is_shutting_down(&self) -> bool {
        *self.state.borrow()
    }

    /// Trigger shutdown for all listeners. Returns `false` if it was
    /// already triggered.
    pub fn trigger(&self) -> bool {
        let first = !self.state.send_replace(true);
        if first {
            info!(active = self.active_tasks(), "shutdown signal triggered");
        } else {
            warn!("shutdown already triggered");
        }
        first
    }

    /// Register a task that `wait_for_drain` should wait for.
    pub fn guard(&self) -> ShutdownGuard {
        self.active.send_modify(|count| *count += 1);
        ShutdownGuard {
            signal: self.clone(),
        }
    }

    /// Number of live guards.
    pub fn active_tasks(&self) -> usize {
        *self.active.borrow()
    }

    /// Wait until every guard is dropped, with a timeout.
    pub async fn wait_for_drain(&self, timeout: Duration) -> DrainResult {
        let mut rx = self.active.subscribe();
        let drained = tokio::time::timeout(timeout, rx.wait_for(|count| *count == 0))
            .await
            .is_ok();
        if drained {
            info!("all background tasks drained");
            DrainResult::Complete
        } else {
            let remaining = self.active_tasks();
            warn!(remaining, "drain timeout, some tasks are still running");
            DrainResult::Timeout { remaining }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// ShutdownListener
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Resolves once shutdown has been triggered.
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|flag| *flag).await;
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}

// ---------------------------------------------------------------------------
// DrainResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    /// Every guarded task finished.
    Complete,
    /// Timeout expired with tasks still holding guards.
    Timeout { remaining: usize },
}

impl DrainResult {
    pub fn is_complete(&self) -> bool {
        matches!(self, DrainResult::Complete)
    }
}

// ---------------------------------------------------------------------------
// ShutdownGuard: RAII guard that confirms drain on drop
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ShutdownGuard {
    signal: ShutdownSignal,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.signal
            .active
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
