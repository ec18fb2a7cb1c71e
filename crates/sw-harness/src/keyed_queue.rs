use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::shutdown::ShutdownSignal;

// ---------------------------------------------------------------------------
// Lane
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Lane {
    /// FIFO-fair lock; holding it is the right to run on this key.
    lock: Arc<Mutex<()>>,
    expires_at: Instant,
}

impl Lane {
    fn in_use(&self) -> bool {
        Arc::strong_count(&self.lock) > 1
    }
}

// ---------------------------------------------------------------------------
// KeyedQueue
// ---------------------------------------------------------------------------

/// Serial queues keyed by `K`, cached for a sliding TTL.
///
/// Every future submitted under the same key runs alone and in submission
/// order; different keys run concurrently. Idle lanes are evicted by a
/// background sweep started on first use. A lane that is running or has
/// waiters is never evicted, so eviction cannot break ordering.
#[derive(Debug, Clone)]
pub struct KeyedQueue<K>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
{
    inner: Arc<Inner<K>>,
}

#[derive(Debug)]
struct Inner<K>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
{
    name: &'static str,
    lanes: DashMap<K, Lane>,
    ttl: Duration,
    gc_interval: Duration,
    sweeping: AtomicBool,
    shutdown: Option<ShutdownSignal>,
}

impl<K> KeyedQueue<K>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
{
    pub fn new(name: &'static str, ttl: Duration, gc_interval: Duration) -> Self {
        Self::build(name, ttl, gc_interval, None)
    }

    /// Like [`KeyedQueue::new`], with a sweep that stops on shutdown.
    pub fn with_shutdown(
        name: &'static str,
        ttl: Duration,
        gc_interval: Duration,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self::build(name, ttl, gc_interval, Some(shutdown))
    }

    fn build(
        name: &'static str,
        ttl: Duration,
        gc_interval: Duration,
        shutdown: Option<ShutdownSignal>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                lanes: DashMap::new(),
                ttl,
                gc_interval,
                sweeping: AtomicBool::new(false),
                shutdown,
            }),
        }
    }

    /// Run `fut` on `key`'s lane once every earlier submission has finished.
    pub async fn run<F, T>(&self, key: K, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        self.ensure_sweep();
        let lock = self.acquire_lane(key);
        let _permit = lock.lock().await;
        fut.await
    }

    fn acquire_lane(&self, key: K) -> Arc<Mutex<()>> {
        let expires_at = Instant::now() + self.inner.ttl;
        let mut lane = self.inner.lanes.entry(key).or_insert_with(|| Lane {
            lock: Arc::new(Mutex::new(())),
            expires_at,
        });
        lane.expires_at = expires_at;
        lane.lock.clone()
    }

    /// Evict expired lanes that nobody is holding or waiting on.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    /// Forget `key` now instead of at the next sweep. A lane that is running
    /// or has waiters is kept.
    pub fn remove(&self, key: &K) -> bool {
        self.inner
            .lanes
            .remove_if(key, |_, lane| !lane.in_use())
            .is_some()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.lanes.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lanes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lanes.is_empty()
    }

    fn ensure_sweep(&self) {
        if self.inner.sweeping.load(Ordering::Relaxed) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if self
            .inner
            .sweeping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.gc_interval;
        let shutdown = self.inner.shutdown.clone();
        handle.spawn(sweep_loop(weak, period, shutdown));
    }
}

impl<K> Inner<K>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
{
    fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.lanes.len();
        self.lanes
            .retain(|_, lane| lane.in_use() || lane.expires_at > now);
        let evicted = before.saturating_sub(self.lanes.len());
        if evicted > 0 {
            debug!(queue = self.name, evicted, "keyed queue sweep");
        }
        evicted
    }
}

async fn sweep_loop<K>(weak: Weak<Inner<K>>, period: Duration, shutdown: Option<ShutdownSignal>)
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    let mut listener = shutdown.as_ref().map(ShutdownSignal::subscribe);
    loop {
        match listener.as_mut() {
            Some(listener) => {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = listener.wait() => break,
                }
            }
            None => {
                ticker.tick().await;
            }
        }
        let Some(inner) = weak.upgrade() else {
            break;
        };
        inner.sweep();
    }
    trace!("keyed queue sweep stopped");
}
