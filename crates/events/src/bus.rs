//! In-process change bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is shared via `Arc<EventBus>` between the chain runner (the
//! only publisher) and whatever forwards events to observers.

use chrono::{DateTime, Utc};
use rigger_core::channels::channel_key;
use rigger_core::entity::EntityRef;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// ChangeEvent
// ---------------------------------------------------------------------------

/// One state change of a tracked entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Per-entity channel key, e.g. `"host-updates.7"`.
    pub channel: String,

    /// Event name, e.g. `"workflow.updated"`.
    pub event: String,

    /// At minimum `{id, status, currentStep, metadata}`.
    pub payload: serde_json::Value,

    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(channel: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            event: event.into(),
            payload: serde_json::Value::Object(Default::default()),
            timestamp: Utc::now(),
        }
    }

    /// An event on the channel of `entity`.
    pub fn for_entity(entity: EntityRef, event: impl Into<String>) -> Self {
        Self::new(channel_key(entity), event)
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out bus.
///
/// Delivery is at-most-once per subscriber. A receiver that falls more than
/// the channel capacity behind observes `RecvError::Lagged` and misses the
/// oldest events.
pub struct EventBus {
    sender: broadcast::Sender<ChangeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to all current subscribers. Dropped silently when nobody is
    /// listening.
    pub fn publish(&self, event: ChangeEvent) {
        tracing::trace!(channel = %event.channel, event = %event.event, "Publishing change");
        let _ = self.sender.send(event);
    }

    /// Subscribe to every channel.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to a single channel key.
    pub fn subscribe_channel(&self, channel: impl Into<String>) -> ChannelSubscription {
        ChannelSubscription {
            channel: channel.into(),
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// A receiver that only yields events of one channel.
pub struct ChannelSubscription {
    channel: String,
    receiver: broadcast::Receiver<ChangeEvent>,
}

impl ChannelSubscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next event on this channel, or `None` once the bus is gone.
    ///
    /// Lag is logged and skipped over.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.channel == self.channel => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(channel = %self.channel, skipped = n, "Subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use rigger_core::channels::EVENT_WORKFLOW_UPDATED;

    use super::*;

    #[tokio::test]
    async fn publish_and_receive_single_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(
            ChangeEvent::for_entity(EntityRef::host(42), EVENT_WORKFLOW_UPDATED)
                .with_payload(serde_json::json!({"id": 42, "status": "provisioning"})),
        );

        let received = rx.recv().await.expect("should receive the event");
        assert_eq!(received.channel, "host-updates.42");
        assert_eq!(received.event, "workflow.updated");
        assert_eq!(received.payload["status"], "provisioning");
    }

    #[tokio::test]
    async fn channel_subscription_filters_other_entities() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe_channel("workspace-updates.3");

        bus.publish(ChangeEvent::for_entity(EntityRef::attempt(4), "workflow.updated"));
        bus.publish(ChangeEvent::for_entity(EntityRef::host(3), "workflow.updated"));
        bus.publish(ChangeEvent::for_entity(EntityRef::attempt(3), "workflow.completed"));

        let event = sub.recv().await.expect("event");
        assert_eq!(event.channel, "workspace-updates.3");
        assert_eq!(event.event, "workflow.completed");
    }

    #[tokio::test]
    async fn subscription_ends_when_bus_is_dropped() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe_channel("host-updates.1");
        drop(bus);
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(ChangeEvent::new("host-updates.1", "orphan"));
    }

    #[test]
    fn new_event_has_empty_object_payload() {
        let event = ChangeEvent::new("host-updates.1", "bare");
        assert!(event.payload.is_object());
    }
}
