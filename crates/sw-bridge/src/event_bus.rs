use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use ahash::AHashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, error, trace};

use sw_core::types::WILDCARD_CLIENT;

use crate::protocol::{BusEvent, EventSource};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("topic `{0}` is reserved for internal use")]
    ReservedTopic(String),
    #[error("event bus subscriptions require a tokio runtime")]
    NoRuntime,
}

/// Reject reserved source names for application topics.
pub fn check_custom_topic(topic: &str) -> Result<(), BusError> {
    if EventSource::from_name(topic).is_reserved() {
        return Err(BusError::ReservedTopic(topic.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subscribers
// ---------------------------------------------------------------------------

type Handler = Arc<dyn Fn(BusEvent) -> BoxFuture<'static, ()> + Send + Sync>;
type Filter = Arc<dyn Fn(&BusEvent) -> bool + Send + Sync>;
type SessionGate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

struct Subscriber {
    id: u64,
    tx: flume::Sender<BusEvent>,
    filter: Option<Filter>,
    once: bool,
}

type Key = (String, String);

#[derive(Default)]
struct Registry {
    subscribers: AHashMap<Key, Vec<Subscriber>>,
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Pub/sub bus keyed by (client id, source).
///
/// Every subscription owns a flume queue drained by its own task, so one
/// subscription's handler never runs concurrently with itself and sees
/// events in publish order. Distinct subscriptions are independent.
/// Subscribing under [`WILDCARD_CLIENT`] receives the source for all clients.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Registry>>,
    next_id: Arc<AtomicU64>,
    gate: Option<SessionGate>,
}

impl EventBus {
    /// Create a new, empty event bus with no subscribers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry::default())),
            next_id: Arc::new(AtomicU64::new(1)),
            gate: None,
        }
    }

    /// Only deliver events for clients accepted by `gate` (typically "has a
    /// live session").
    pub fn with_session_gate<G>(mut self, gate: G) -> Self
    where
        G: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.gate = Some(Arc::new(gate));
        self
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `handler` for `source` events of `client_id`.
    pub fn subscribe<F, Fut>(
        &self,
        client_id: &str,
        source: EventSource,
        handler: F,
    ) -> Result<Subscription, BusError>
    where
        F: Fn(BusEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.attach(client_id, source, None, false, wrap(handler))
    }

    /// Register `handler` for the first `source` event accepted by `filter`;
    /// the subscription removes itself after that delivery.
    pub fn once<P, F, Fut>(
        &self,
        client_id: &str,
        source: EventSource,
        filter: P,
        handler: F,
    ) -> Result<Subscription, BusError>
    where
        P: Fn(&BusEvent) -> bool + Send + Sync + 'static,
        F: Fn(BusEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.attach(client_id, source, Some(Arc::new(filter)), true, wrap(handler))
    }

    fn attach(
        &self,
        client_id: &str,
        source: EventSource,
        filter: Option<Filter>,
        once: bool,
        handler: Handler,
    ) -> Result<Subscription, BusError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| BusError::NoRuntime)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let key: Key = (client_id.to_string(), source.as_str().to_string());
        let (tx, rx) = flume::unbounded::<BusEvent>();

        runtime.spawn(consume(id, rx, handler));

        debug!(client_id, source = %source, id, once, "bus subscribe");
        self.lock()
            .subscribers
            .entry(key.clone())
            .or_default()
            .push(Subscriber {
                id,
                tx,
                filter,
                once,
            });

        Ok(Subscription {
            id,
            key,
            bus: Arc::downgrade(&self.inner),
        })
    }

    /// Publish `event` to the subscribers of its client and to wildcard
    /// subscribers of its source. Returns the number of queued deliveries.
    pub fn publish(&self, event: BusEvent) -> usize {
        if let Some(gate) = &self.gate {
            if !gate(&event.client_id) {
                trace!(client_id = %event.client_id, source = %event.source, "bus publish skipped, no session");
                return 0;
            }
        }
        let source = event.source.as_str().to_string();
        let mut registry = self.lock();
        let mut delivered = 0;
        let mut keys = vec![(event.client_id.clone(), source.clone())];
        if event.client_id != WILDCARD_CLIENT {
            keys.push((WILDCARD_CLIENT.to_string(), source));
        }
        for key in keys {
            let Some(list) = registry.subscribers.get_mut(&key) else {
                continue;
            };
            list.retain(|sub| {
                if let Some(filter) = &sub.filter {
                    if !filter(&event) {
                        return !sub.tx.is_disconnected();
                    }
                }
                let sent = sub.tx.send(event.clone()).is_ok();
                if sent {
                    delivered += 1;
                }
                sent && !sub.once
            });
            if list.is_empty() {
                registry.subscribers.remove(&key);
            }
        }
        delivered
    }

    /// Drop every subscription registered under `client_id`.
    pub fn dispose_client(&self, client_id: &str) -> usize {
        let mut registry = self.lock();
        let before: usize = registry.subscribers.values().map(Vec::len).sum();
        registry.subscribers.retain(|(client, _), _| client != client_id);
        let after: usize = registry.subscribers.values().map(Vec::len).sum();
        debug!(client_id, removed = before - after, "bus dispose");
        before - after
    }

    /// Live subscriptions for one (client, source) pair.
    pub fn subscriber_count(&self, client_id: &str, source: &EventSource) -> usize {
        self.lock()
            .subscribers
            .get(&(client_id.to_string(), source.as_str().to_string()))
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Live subscriptions across every key.
    pub fn total_subscribers(&self) -> usize {
        self.lock().subscribers.values().map(Vec::len).sum()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.total_subscribers())
            .field("gated", &self.gate.is_some())
            .finish()
    }
}

fn wrap<F, Fut>(handler: F) -> Handler
where
    F: Fn(BusEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |event| handler(event).boxed())
}

async fn consume(id: u64, rx: flume::Receiver<BusEvent>, handler: Handler) {
    while let Ok(event) = rx.recv_async().await {
        let source = event.source.clone();
        if AssertUnwindSafe(handler(event)).catch_unwind().await.is_err() {
            error!(id, source = %source, "bus handler panicked");
        }
    }
    trace!(id, "bus subscriber drained");
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Handle returned by [`EventBus::subscribe`]. Dropping it keeps the
/// subscription alive; call [`Subscription::unsubscribe`] to end it.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: u64,
    key: Key,
    bus: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stop receiving events. Events already queued are still handled.
    /// Returns `false` if the subscription was already gone.
    pub fn unsubscribe(&self) -> bool {
        let Some(inner) = self.bus.upgrade() else {
            return false;
        };
        let mut registry = inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(list) = registry.subscribers.get_mut(&self.key) else {
            return false;
        };
        let before = list.len();
        list.retain(|sub| sub.id != self.id);
        let removed = list.len() != before;
        if list.is_empty() {
            registry.subscribers.remove(&self.key);
        }
        removed
    }
}
