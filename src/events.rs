use log::debug;
use tokio::sync::broadcast;

/// Domain events published by the tracking pipeline. Delivery is in-process
/// fan-out only; absent subscribers are not an error.
#[derive(Clone, Debug)]
pub enum TrackerEvent {
    EmailSent { message_id: i64, hash: String },
    EmailViewed { message_id: i64, hash: String },
    LinkClicked { message_id: i64, hash: String, url: String },
    EmailDelivered { message_id: i64, hash: String },
    PermanentBounce { message_id: i64, recipient: String },
    Complaint { message_id: i64, recipient: String },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TrackerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        EventBus { tx }
    }

    pub fn publish(&self, event: TrackerEvent) {
        debug!("[events] publishing {:?}", event);
        // send fails when nobody is subscribed, which is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(TrackerEvent::EmailViewed {
            message_id: 7,
            hash: "abc".to_string(),
        });
        match rx.recv().await.unwrap() {
            TrackerEvent::EmailViewed { message_id, hash } => {
                assert_eq!(message_id, 7);
                assert_eq!(hash, "abc");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.publish(TrackerEvent::EmailSent {
            message_id: 1,
            hash: "x".to_string(),
        });
    }
}
