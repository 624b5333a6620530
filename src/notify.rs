use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

pub const RESERVATION_CREATED: &str = "reservation.created";
pub const RESERVATION_CANCELLED: &str = "reservation.cancelled";
pub const RESERVATION_EXPIRED: &str = "reservation.expired";
pub const RESOURCE_DELETED: &str = "resource.deleted";
pub const ORDER_CONFIRMED: &str = "order.confirmed";
pub const ORDER_FAILED: &str = "order.failed";

/// A published domain event as delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    pub event_type: String,
    pub payload: Value,
}

/// Outbound domain events. Fire-and-forget: publishing never fails the
/// operation that produced the event.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event_type: &str, payload: Value);
}

/// Broadcast hub: one channel per event type plus a firehose of everything.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<DomainEvent>>,
    all: broadcast::Sender<DomainEvent>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to one event type. Creates the channel if needed.
    pub fn subscribe(&self, event_type: &str) -> broadcast::Receiver<DomainEvent> {
        let sender = self
            .channels
            .entry(event_type.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<DomainEvent> {
        self.all.subscribe()
    }
}

impl EventPublisher for NotifyHub {
    /// No-op for channels nobody is listening on.
    fn publish(&self, event_type: &str, payload: Value) {
        let event = DomainEvent {
            event_type: event_type.to_string(),
            payload,
        };
        tracing::debug!(event_type, "publish");
        if let Some(sender) = self.channels.get(event_type) {
            let _ = sender.send(event.clone());
        }
        let _ = self.all.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe(RESERVATION_CREATED);

        hub.publish(RESERVATION_CREATED, json!({ "allocationId": "a1" }));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, RESERVATION_CREATED);
        assert_eq!(received.payload["allocationId"], "a1");
    }

    #[tokio::test]
    async fn typed_subscriber_ignores_other_types() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe(ORDER_FAILED);
        let mut all = hub.subscribe_all();

        hub.publish(ORDER_CONFIRMED, json!({}));
        hub.publish(ORDER_FAILED, json!({ "reason": "conflict" }));

        let got = rx.recv().await.unwrap();
        assert_eq!(got.event_type, ORDER_FAILED);
        assert_eq!(all.recv().await.unwrap().event_type, ORDER_CONFIRMED);
        assert_eq!(all.recv().await.unwrap().event_type, ORDER_FAILED);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.publish(RESOURCE_DELETED, json!({ "resourceId": "r1" }));
    }
}
