//! Routes parsed frames to the store, the reconciler and typing handlers.
//!
//! | event                                             | destination                         |
//! |---------------------------------------------------|-------------------------------------|
//! | `conversation_message`, `new_conversation_message`| `Updates` + optimistic unread bump  |
//! | `total_unread_count`                              | reconciler → `TotalUnreadCount`     |
//! | `conversation_unread_count`                       | reconciler → `ConversationUnreadCount` |
//! | `conversation_read`, `message_read`               | `ReadStatus`                        |
//! | `conversation_status`                             | `Refresh`                           |
//! | `typing`                                          | typing handlers on the router       |
//! | `ping`, `pong`, `test_connection*`                | consumed                            |
//!
//! Anything else is logged and dropped.

use crate::store::{Notification, SubscriptionStore};
use crate::unread::UnreadReconciler;
use crate::ws::event::{InboundEvent, TypingEvent, parse};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, instrument, trace, warn};

/// A typing indicator callback.
pub type TypingHandler = Arc<dyn Fn(&TypingEvent) + Send + Sync>;

/// Identifies a registered typing handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypingHandlerId(u64);

#[derive(Default)]
struct TypingHandlers {
    next_id: AtomicU64,
    handlers: RwLock<Vec<(TypingHandlerId, TypingHandler)>>,
}

/// Fans parsed events out. Cheap to clone.
#[derive(Clone)]
pub struct EventRouter {
    store: SubscriptionStore,
    reconciler: UnreadReconciler,
    typing: Arc<TypingHandlers>,
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("typing_handlers", &self.typing_handler_count())
            .finish_non_exhaustive()
    }
}

impl EventRouter {
    pub fn new(store: SubscriptionStore, reconciler: UnreadReconciler) -> Self {
        Self {
            store,
            reconciler,
            typing: Arc::new(TypingHandlers::default()),
        }
    }

    /// Registers a typing callback. Handlers run in registration order.
    pub fn on_typing<F>(&self, handler: F) -> TypingHandlerId
    where
        F: Fn(&TypingEvent) + Send + Sync + 'static,
    {
        let id = TypingHandlerId(self.typing.next_id.fetch_add(1, Ordering::Relaxed));
        self.typing
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(handler)));
        id
    }

    /// Returns `false` if the handler was already removed.
    pub fn remove_typing_handler(&self, id: TypingHandlerId) -> bool {
        let mut handlers = self
            .typing
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    pub fn clear_typing_handlers(&self) {
        self.typing
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn typing_handler_count(&self) -> usize {
        self.typing
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Parses and dispatches one raw frame.
    pub fn route_frame(&self, raw: &str) {
        trace!(len = raw.len(), "Inbound frame");
        self.dispatch(parse(raw));
    }

    #[instrument(level = "debug", skip_all, fields(event = event.name()))]
    pub fn dispatch(&self, event: InboundEvent) {
        match event {
            InboundEvent::NewMessage(message) => {
                let conversation_id = message.conversation_id;
                self.store.emit(Notification::Message(message));
                self.reconciler.on_new_message(conversation_id);
            }
            InboundEvent::TotalUnreadCount(total) => self.reconciler.on_server_total(total),
            InboundEvent::ConversationUnreadCount {
                conversation_id,
                count,
            } => self.reconciler.on_conversation_count(conversation_id, count),
            InboundEvent::ReadReceipt(receipt) => {
                self.store.emit(Notification::ReadStatus(receipt));
            }
            InboundEvent::ConversationStatus(status) => {
                debug!(?status, "Conversation status changed; requesting refresh");
                self.store.emit(Notification::Refresh);
            }
            InboundEvent::Typing(typing) => self.dispatch_typing(&typing),
            InboundEvent::Ping | InboundEvent::Pong | InboundEvent::TestConnection => {
                trace!("Control frame consumed");
            }
            InboundEvent::Unknown { event } => {
                debug!(event = event.as_deref().unwrap_or("<none>"), "Dropping unknown event");
            }
        }
    }

    fn dispatch_typing(&self, typing: &TypingEvent) {
        let snapshot: Vec<TypingHandler> = self
            .typing
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(typing))).is_err() {
                warn!("Typing handler panicked; continuing with the remaining handlers");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Topic;
    use crate::test_support::init_tracing;
    use crate::unread::UnreadCountSource;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    struct NeverPolled;

    #[async_trait]
    impl UnreadCountSource for NeverPolled {
        async fn fetch_total_unread(&self) -> crate::Result<u64> {
            Err(crate::Error::Poll("not expected in this test".into()))
        }
    }

    fn router() -> EventRouter {
        let store = SubscriptionStore::new();
        let reconciler =
            UnreadReconciler::new(store.clone(), Arc::new(NeverPolled), Duration::from_secs(3600));
        EventRouter::new(store, reconciler)
    }

    fn record_all(store: &SubscriptionStore) -> (Arc<Mutex<Vec<Topic>>>, Vec<crate::store::Subscription>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let subs = Topic::ALL
            .iter()
            .map(|topic| {
                let sink = Arc::clone(&seen);
                store.subscribe(*topic, move |n| sink.lock().unwrap().push(n.topic()))
            })
            .collect();
        (seen, subs)
    }

    #[tokio::test]
    async fn unknown_and_malformed_frames_change_nothing() {
        init_tracing();
        let router = router();
        router.reconciler.on_server_total(5);
        let (seen, _subs) = record_all(&router.store);

        router.route_frame(r#"{"event": "brand_new_feature", "data": {"x": 1}}"#);
        router.route_frame("{not json");
        router.route_frame(r#"{"event": "total_unread_count", "data": {"total_unread_count": "many"}}"#);

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(router.reconciler.total_unread(), 5);

        // Still routing afterwards.
        router.route_frame(r#"{"event": "total_unread_count", "data": {"total_unread_count": 2}}"#);
        assert_eq!(*seen.lock().unwrap(), vec![Topic::TotalUnreadCount]);
        assert_eq!(router.reconciler.total_unread(), 2);
    }

    #[tokio::test]
    async fn new_message_fans_out_and_bumps_total() {
        let router = router();
        let (seen, _subs) = record_all(&router.store);

        router.route_frame(
            r#"{"event": "conversation_message", "conversation_id": 3, "message": {"id": 10, "content": "hello"}}"#,
        );

        assert_eq!(
            *seen.lock().unwrap(),
            vec![Topic::Updates, Topic::TotalUnreadCount]
        );
        assert_eq!(router.reconciler.total_unread(), 1);
    }

    #[tokio::test]
    async fn read_and_status_events_reach_their_topics() {
        let router = router();
        let (seen, _subs) = record_all(&router.store);

        router.route_frame(r#"{"event": "conversation_read", "conversation_id": 3}"#);
        router.route_frame(r#"{"event": "message_read", "data": {"message_id": 4}}"#);
        router.route_frame(r#"{"event": "conversation_status", "conversation_id": 3, "data": {"status": "closed"}}"#);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![Topic::ReadStatus, Topic::ReadStatus, Topic::Refresh]
        );
    }

    #[tokio::test]
    async fn control_frames_are_consumed() {
        let router = router();
        let (seen, _subs) = record_all(&router.store);
        router.route_frame(r#"{"event": "pong"}"#);
        router.route_frame(r#"{"event": "ping"}"#);
        router.route_frame(r#"{"event": "test_connection"}"#);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn typing_goes_to_router_handlers_only() {
        init_tracing();
        let router = router();
        let (seen, _subs) = record_all(&router.store);
        let typing = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&typing);
        router.on_typing(|_| panic!("broken typing indicator"));
        let id = router.on_typing(move |event| sink.lock().unwrap().push(event.is_typing));

        router.route_frame(r#"{"event": "typing", "data": {"user_id": 2, "is_typing": true}}"#);
        assert_eq!(*typing.lock().unwrap(), vec![true]);
        assert!(seen.lock().unwrap().is_empty());

        assert!(router.remove_typing_handler(id));
        assert!(!router.remove_typing_handler(id));
        router.route_frame(r#"{"event": "typing", "data": {"is_typing": false}}"#);
        assert_eq!(*typing.lock().unwrap(), vec![true]);

        router.clear_typing_handlers();
        assert_eq!(router.typing_handler_count(), 0);
    }
}
