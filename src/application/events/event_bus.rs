//! Event Bus for broadcasting events to subscribers

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{Event, EventMessage, LiveStateUpdate, UserNotification};
use crate::domain::ports::{LiveStateMirror, Notifier};

const DEFAULT_CAPACITY: usize = 1024;

/// Event bus for broadcasting events to all subscribers
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventMessage>,
    subscriber_count: Arc<AtomicUsize>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            subscriber_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn publish(&self, event: Event) {
        let message = EventMessage::new(event);
        let event_type = message.event.event_type();
        let charge_point_id = message.event.charge_point_id().map(String::from);

        match self.sender.send(message) {
            Ok(count) => {
                debug!(
                    event_type,
                    ?charge_point_id,
                    subscribers = count,
                    "Event published"
                );
            }
            Err(_) => {
                debug!(
                    event_type,
                    ?charge_point_id,
                    "Event published (no subscribers)"
                );
            }
        }
    }

    pub fn subscribe(&self) -> EventSubscriber {
        let receiver = self.sender.subscribe();
        let count = self.subscriber_count.fetch_add(1, Ordering::SeqCst) + 1;
        info!(total = count, "New event subscriber");

        EventSubscriber {
            receiver,
            subscriber_count: self.subscriber_count.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveStateMirror for EventBus {
    fn publish(&self, update: LiveStateUpdate) {
        EventBus::publish(self, Event::LiveState(update));
    }
}

impl Notifier for EventBus {
    fn notify(&self, user_id: &str, notification: UserNotification) {
        info!(user_id, kind = notification.kind(), "User notification");
        EventBus::publish(
            self,
            Event::Notification {
                user_id: user_id.to_string(),
                notification,
            },
        );
    }
}

/// Event subscriber that receives events from the bus
pub struct EventSubscriber {
    receiver: broadcast::Receiver<EventMessage>,
    subscriber_count: Arc<AtomicUsize>,
}

impl EventSubscriber {
    pub async fn recv(&mut self) -> Option<EventMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(msg) => return Some(msg),
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!(missed = count, "Subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return None;
                }
            }
        }
    }

    /// Non-blocking drain of everything already queued.
    pub fn drain(&mut self) -> Vec<EventMessage> {
        let mut out = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(msg) => out.push(msg),
                Err(broadcast::error::TryRecvError::Lagged(count)) => {
                    warn!(missed = count, "Subscriber lagged");
                }
                Err(_) => return out,
            }
        }
    }
}

impl Drop for EventSubscriber {
    fn drop(&mut self) {
        let prev = self.subscriber_count.fetch_sub(1, Ordering::SeqCst);
        debug!(remaining = prev.saturating_sub(1), "Event subscriber disconnected");
    }
}

/// Shared event bus type
pub type SharedEventBus = Arc<EventBus>;

/// Create a shared event bus
pub fn create_event_bus() -> SharedEventBus {
    Arc::new(EventBus::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn subscribers_receive_live_state_and_notifications() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        LiveStateMirror::publish(
            &bus,
            LiveStateUpdate::StationOffline {
                charge_point_id: "CP001".into(),
                timestamp: Utc::now(),
            },
        );
        bus.notify(
            "user-1",
            UserNotification::PaymentError {
                transaction_id: 7,
                reason: "boom".into(),
            },
        );

        let first = sub.recv().await.unwrap();
        assert!(matches!(
            first.event,
            Event::LiveState(LiveStateUpdate::StationOffline { .. })
        ));
        let second = sub.recv().await.unwrap();
        match second.event {
            Event::Notification { user_id, notification } => {
                assert_eq!(user_id, "user-1");
                assert_eq!(notification.kind(), "payment_error");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn dropping_subscriber_decrements_count() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
