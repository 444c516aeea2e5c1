//! Lifecycle event bus (spec §3 "connection runtime ... lifecycle
//! events/hooks"), a `broadcast` channel in the same shape as the
//! query-progress channel in
//! `examples/Protryon-klickhouse/klickhouse/src/client.rs`
//! (`progress: broadcast::Sender<(Uuid, Progress)>`), generalized from one
//! fixed event type to the connection's full lifecycle.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::identity::{ConnectionId, Identity};
use crate::ids::QueryId;
use crate::time::Timestamp;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A notable state change in the connection or its subscriptions. Cloned
/// cheaply (errors are `Arc`-wrapped) so many subscribers can observe the
/// same event.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connecting,
    Connected { identity: Identity, connection_id: ConnectionId, at: Timestamp },
    Disconnected { at: Timestamp },
    Reconnecting { attempt: u32, at: Timestamp },
    ReconnectFailed { at: Timestamp },
    SubscriptionApplied { query_id: QueryId },
    SubscriptionError { query_id: Option<QueryId>, message: String },
    BudgetLow,
    BudgetExhausted,
    BudgetRefilled,
    Error(Arc<crate::error::RtdbError>),
}

/// A `broadcast`-backed fan-out of [`ConnectionEvent`]s. Lagging subscribers
/// silently skip ahead (per `broadcast::Receiver` semantics) rather than
/// stall the connection actor.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ConnectionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event; returns the number of subscribers notified. A
    /// zero return with no subscribers attached is not an error.
    pub fn publish(&self, event: ConnectionEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(ConnectionEvent::Connecting);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, ConnectionEvent::Connecting));
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(ConnectionEvent::Connecting), 0);
    }
}
