use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::trace;

/// Trailing-edge debouncer: each call waits `delay`, and only the most
/// recent call runs. Calls superseded while waiting resolve to `None`.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    generation: AtomicU64,
    cancelled: Notify,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            generation: AtomicU64::new(0),
            cancelled: Notify::new(),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Wait out the delay, then run `run` unless a newer call arrived.
    pub async fn schedule<F, Fut, T>(&self, run: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        // Registered before the ticket is taken so a concurrent `cancel`
        // cannot slip in between.
        let cancelled = self.cancelled.notified();
        let ticket = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::select! {
            _ = tokio::time::sleep(self.delay) => {}
            _ = cancelled => {
                trace!(ticket, "scheduled call cancelled");
                return None;
            }
        }
        if self.generation.load(Ordering::SeqCst) != ticket {
            trace!(ticket, "scheduled call superseded");
            return None;
        }
        Some(run().await)
    }

    /// Drop every call still waiting. They resolve to `None` right away.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.cancelled.notify_waiters();
    }
}
