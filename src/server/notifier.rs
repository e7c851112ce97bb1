use crate::core::transport::SessionKey;
use crate::server::json_handler::JsonMap;
use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A notification queued for delivery
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationEvent {
    /// Only this session receives it, regardless of its subscriptions
    pub target: Option<SessionKey>,
    pub handler: String,
    pub event: String,
    pub params: JsonMap,
}

/// Cloneable handle handlers use to emit notifications.
///
/// Publishing never blocks; delivery happens on the dispatcher side.
#[derive(Debug, Clone)]
pub struct Notifier {
    sender: mpsc::UnboundedSender<NotificationEvent>,
    sequence: Arc<AtomicU64>,
}

impl Notifier {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<NotificationEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                sequence: Arc::new(AtomicU64::new(0)),
            },
            receiver,
        )
    }

    /// Send to every active session subscribed to `handler`
    pub fn publish(&self, handler: &str, event: &str, params: JsonMap) {
        self.enqueue(NotificationEvent {
            target: None,
            handler: handler.to_string(),
            event: event.to_string(),
            params,
        });
    }

    pub fn publish_to_client(&self, session: SessionKey, handler: &str, event: &str, params: JsonMap) {
        self.enqueue(NotificationEvent {
            target: Some(session),
            handler: handler.to_string(),
            event: event.to_string(),
            params,
        });
    }

    /// Next notification id, strictly increasing for the server's lifetime
    pub(crate) fn next_id(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    fn enqueue(&self, event: NotificationEvent) {
        if let Err(e) = self.sender.send(event) {
            debug!("Notification {}.{} dropped, server not running", e.0.handler, e.0.event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_publish_is_queued_in_order() {
        let (notifier, mut receiver) = Notifier::channel();
        let mut params = JsonMap::new();
        params.insert("n".to_string(), json!(1));
        notifier.publish("Things", "ThingAdded", params.clone());
        let session = SessionKey::new(0, Uuid::new_v4());
        notifier.publish_to_client(session, "JSONRPC", "PushButtonAuthFinished", JsonMap::new());

        let first = receiver.try_recv().unwrap();
        assert_eq!(first.target, None);
        assert_eq!(first.params, params);
        let second = receiver.try_recv().unwrap();
        assert_eq!(second.target, Some(session));
    }

    #[test]
    fn test_ids_increase_across_clones() {
        let (notifier, _receiver) = Notifier::channel();
        let clone = notifier.clone();
        let a = notifier.next_id();
        let b = clone.next_id();
        assert!(b > a);
    }

    #[test]
    fn test_publish_after_shutdown_is_dropped() {
        let (notifier, receiver) = Notifier::channel();
        drop(receiver);
        notifier.publish("Things", "ThingRemoved", JsonMap::new());
    }
}
