//! Session lifecycle events for presence/UI consumers

use serde::Serialize;
use tokio::sync::broadcast;

/// Published by the relay; never blocks the publisher.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Joined {
        client_id: u32,
        display_name: String,
        video: bool,
        audio: bool,
    },
    Left {
        client_id: u32,
        reason: String,
    },
    CapabilitiesChanged {
        client_id: u32,
        width: u16,
        height: u16,
        color: bool,
    },
    StreamChanged {
        client_id: u32,
        video: bool,
        audio: bool,
    },
}

/// Fan-out channel for [`SessionEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Drops the event silently when nobody is listening.
    pub fn publish(&self, event: SessionEvent) {
        tracing::trace!(?event, "Session event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(SessionEvent::Left {
            client_id: 1,
            reason: "bye".into(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_subscriber_receives_json_shape() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(SessionEvent::StreamChanged {
            client_id: 3,
            video: true,
            audio: false,
        });
        let event = rx.try_recv().unwrap();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "stream_changed");
        assert_eq!(json["client_id"], 3);
    }
}
