//! Event bus for topology and state-change notifications
//!
//! Uses tokio::sync::broadcast for pub/sub. The `/events` SSE endpoint is the
//! main consumer; nothing in the control path depends on a subscriber existing.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Event types that can be published on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum BusEvent {
    /// Discovery swapped in a fresh topology graph
    TopologyReplaced { generation: u64, zones: usize },
    /// A zone-config change was announced by the host
    TopologyStale,
    /// A state variable was merged into a zone or room
    StateChanged {
        udn: String,
        variable: String,
        value: String,
    },
    SubscriptionCreated {
        sid: String,
        udn: String,
        service: String,
        timeout_secs: u64,
    },
    /// A structural zone job was accepted by the host
    ZoneJobAccepted { job: String, rooms: Vec<String> },
}

/// Event bus handle for publishing and subscribing
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: BusEvent) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Shared event bus wrapped in Arc for thread-safe sharing
pub type SharedBus = Arc<EventBus>;

pub fn create_bus() -> SharedBus {
    Arc::new(EventBus::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pubsub() {
        let bus = create_bus();
        let mut rx = bus.subscribe();

        bus.publish(BusEvent::StateChanged {
            udn: "uuid:room-1".to_string(),
            variable: "Volume".to_string(),
            value: "42".to_string(),
        });

        match rx.recv().await.unwrap() {
            BusEvent::StateChanged { udn, value, .. } => {
                assert_eq!(udn, "uuid:room-1");
                assert_eq!(value, "42");
            }
            other => panic!("Wrong event type: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = create_bus();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(BusEvent::TopologyStale);

        assert!(matches!(rx1.recv().await.unwrap(), BusEvent::TopologyStale));
        assert!(matches!(rx2.recv().await.unwrap(), BusEvent::TopologyStale));
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = create_bus();
        bus.publish(BusEvent::TopologyReplaced {
            generation: 1,
            zones: 0,
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(BusEvent::TopologyReplaced {
            generation: 3,
            zones: 2,
        })
        .unwrap();
        assert_eq!(json["type"], "TopologyReplaced");
        assert_eq!(json["payload"]["generation"], 3);
    }
}
