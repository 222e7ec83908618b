//! Event Bus (component J) — in-process pub/sub.
//!
//! Grounded on the teacher's `client/src/inspector.rs` SSE fan-out, which
//! already uses a `tokio::sync::broadcast` channel and treats a lagging
//! subscriber as a dropped message rather than a publisher stall
//! (`RecvError::Lagged`). Generalized from one hardcoded stream to the
//! named topics §4.10 lists.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    #[serde(rename = "tunnel:created")]
    TunnelCreated,
    #[serde(rename = "tunnel:closed")]
    TunnelClosed,
    #[serde(rename = "traffic:request")]
    TrafficRequest,
    #[serde(rename = "traffic:response")]
    TrafficResponse,
    #[serde(rename = "metrics:update")]
    MetricsUpdate,
}

impl Topic {
    pub fn name(self) -> &'static str {
        match self {
            Topic::TunnelCreated => "tunnel:created",
            Topic::TunnelClosed => "tunnel:closed",
            Topic::TrafficRequest => "traffic:request",
            Topic::TrafficResponse => "traffic:response",
            Topic::MetricsUpdate => "metrics:update",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BusEvent {
    pub topic: Topic,
    pub payload: serde_json::Value,
}

/// Bounded broadcast channel capacity. A subscriber that falls this far
/// behind is considered slow and silently drops the backlog, per the
/// "publication is non-blocking" contract — it never blocks the publisher.
const CHANNEL_CAPACITY: usize = 1024;

pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish a message. Never blocks; if there are no subscribers the
    /// message is simply dropped.
    pub fn publish(&self, topic: Topic, payload: serde_json::Value) {
        let _ = self.tx.send(BusEvent { topic, payload });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain one message from a subscription, treating a lagged receiver as
/// "skip to the most recent" rather than an error surfaced to the caller.
pub async fn recv_lossy(rx: &mut broadcast::Receiver<BusEvent>) -> Option<BusEvent> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "event bus subscriber lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(Topic::TunnelCreated, serde_json::json!({}));
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(Topic::MetricsUpdate, serde_json::json!({"ok": true}));
        let event = recv_lossy(&mut rx).await.unwrap();
        assert_eq!(event.topic, Topic::MetricsUpdate);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_backlog_instead_of_blocking_publisher() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        for i in 0..(CHANNEL_CAPACITY * 2) {
            bus.publish(Topic::TrafficRequest, serde_json::json!({ "i": i }));
        }
        // Publisher never blocked getting here. The subscriber can still
        // make progress, just not see every message.
        let event = recv_lossy(&mut rx).await;
        assert!(event.is_some());
    }
}
