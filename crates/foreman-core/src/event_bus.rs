use serde::Serialize;
use tokio::sync::broadcast;

use foreman_types::Event;

/// An event plus its optional user scope. The push transport delivers
/// user-scoped events to that user's connections only; unscoped events go to
/// every subscriber.
#[derive(Debug, Clone, Serialize)]
pub struct Outbound {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(flatten)]
    pub event: Event,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Outbound>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Outbound> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(Outbound { user: None, event });
    }

    pub fn publish_to_user(&self, user_id: &str, event: Event) {
        let _ = self.tx.send(Outbound {
            user: Some(user_id.to_string()),
            event,
        });
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
    use foreman_types::ThreadStatus;

    #[tokio::test]
    async fn publishes_to_subscribers_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(Event::QueueUpdated {
            thread_id: "t1".to_string(),
            depth: 1,
            next_preview: None,
        });
        bus.publish_to_user(
            "u1",
            Event::ThreadStatusChanged {
                thread_id: "t1".to_string(),
                status: ThreadStatus::Running,
                waiting_reason: None,
                stage: None,
                permission_mode: None,
            },
        );

        let first = rx.recv().await.unwrap();
        assert!(first.user.is_none());
        assert_eq!(first.event.kind(), "queue.updated");

        let second = rx.recv().await.unwrap();
        assert_eq!(second.user.as_deref(), Some("u1"));
        assert_eq!(second.event.kind(), "thread.status");
    }

    #[test]
    fn publish_without_subscribers_is_harmless() {
        let bus = EventBus::new();
        bus.publish(Event::QueueUpdated {
            thread_id: "t1".to_string(),
            depth: 0,
            next_preview: None,
        });
    }
}
