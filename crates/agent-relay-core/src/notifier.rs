//! Best-effort status event broadcast to controllers.

use agent_relay_proto::{Message, StatusEvent, now_millis};
use tokio::sync::broadcast;

/// Fan-out of client connect/disconnect events.
///
/// Backed by a broadcast channel: controllers subscribe on registration and
/// forward into their outbound stream. No backlog for late joiners; a lagged
/// subscriber loses events rather than stalling the relay.
pub struct EventNotifier {
    tx: broadcast::Sender<Message>,
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl EventNotifier {
    /// Create a notifier.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    /// Subscribe for events from this moment on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.tx.subscribe()
    }

    /// Announce a freshly registered client.
    pub fn connected(&self, client_id: &str) {
        self.publish(client_id, StatusEvent::Connected);
    }

    /// Announce a departed client.
    pub fn disconnected(&self, client_id: &str) {
        self.publish(client_id, StatusEvent::Disconnected);
    }

    fn publish(&self, client_id: &str, event: StatusEvent) {
        // Err means no controllers are listening; that is fine.
        let _ = self.tx.send(Message::ClientStatusEvent {
            client_id: client_id.to_string(),
            event,
            timestamp: now_millis(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let notifier = EventNotifier::new();
        let mut rx = notifier.subscribe();
        notifier.connected("agent-1");
        notifier.disconnected("agent-1");

        match rx.recv().await.unwrap() {
            Message::ClientStatusEvent { client_id, event, .. } => {
                assert_eq!(client_id, "agent-1");
                assert_eq!(event, StatusEvent::Connected);
            }
            other => panic!("wrong message: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            Message::ClientStatusEvent { event, .. } => {
                assert_eq!(event, StatusEvent::Disconnected);
            }
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let notifier = EventNotifier::new();
        notifier.connected("agent-1");
    }
}
