//! Application events and bus listeners.

use std::future::Future;

use serde_json::Value;
use tracing::debug;

use sw_bridge::event_bus::{check_custom_topic, Subscription};
use sw_bridge::protocol::{BusEvent, EventSource};

use crate::error::{Result, SwarmError};
use crate::runtime::SwarmRuntime;

fn custom_topic(topic: &str) -> Result<()> {
    check_custom_topic(topic).map_err(|_| SwarmError::ReservedTopic(topic.to_string()))
}

impl SwarmRuntime {
    /// Publish `payload` on the application topic `topic` for `client_id`.
    /// Reserved topics are refused. Returns the number of deliveries queued,
    /// which is zero when the client has no session.
    pub fn event(&self, client_id: &str, topic: &str, payload: Value) -> Result<usize> {
        custom_topic(topic)?;
        let delivered = self
            .inner
            .bus
            .publish(BusEvent::custom(client_id, topic, payload));
        debug!(client_id, topic, delivered, "custom event published");
        Ok(delivered)
    }

    /// Call `handler` with the payload of every `topic` event for
    /// `client_id`. Use the wildcard client to hear all clients.
    pub fn listen_event<F, Fut>(&self, client_id: &str, topic: &str, handler: F) -> Result<Subscription>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        custom_topic(topic)?;
        let subscription = self.inner.bus.subscribe(
            client_id,
            EventSource::from(topic),
            move |event: BusEvent| handler(event.payload.unwrap_or(Value::Null)),
        )?;
        Ok(subscription)
    }

    /// Call `handler` once, for the first `topic` event whose payload passes
    /// `filter`.
    pub fn listen_event_once<P, F, Fut>(
        &self,
        client_id: &str,
        topic: &str,
        filter: P,
        handler: F,
    ) -> Result<Subscription>
    where
        P: Fn(&Value) -> bool + Send + Sync + 'static,
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        custom_topic(topic)?;
        let subscription = self.inner.bus.once(
            client_id,
            EventSource::from(topic),
            move |event: &BusEvent| filter(event.payload.as_ref().unwrap_or(&Value::Null)),
            move |event: BusEvent| handler(event.payload.unwrap_or(Value::Null)),
        )?;
        Ok(subscription)
    }

    /// Observe one of the runtime's internal sources, e.g. the execution bus.
    pub fn listen_bus_event<F, Fut>(
        &self,
        client_id: &str,
        source: EventSource,
        handler: F,
    ) -> Result<Subscription>
    where
        F: Fn(BusEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Ok(self.inner.bus.subscribe(client_id, source, handler)?)
    }
}
