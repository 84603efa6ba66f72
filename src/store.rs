//! The subscription store: a pub/sub hub between the connection and the UI.
//!
//! Any number of independent subscribers register a callback per [`Topic`].
//! [`SubscriptionStore::emit`] calls every callback currently registered for
//! the notification's topic, synchronously and in registration order. The
//! listener set is snapshotted before the first callback runs, so callbacks
//! may unsubscribe themselves (or anyone else) mid-emit.
//!
//! Stores are ordinary values: create as many as you need, share one by
//! cloning it (clones share state), and call [`SubscriptionStore::dispose`]
//! on logout.

use crate::ws::event::{ChatMessage, ConversationSummary, ReadReceipt};
use crate::ws::types::ConversationId;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// A named channel grouping related notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    /// Raw new-message events.
    Updates,
    ConversationList,
    ReadStatus,
    TotalUnreadCount,
    ConversationUnreadCount,
    OpenConversation,
    /// "Something changed, refetch": sent after (re)connecting and on
    /// conversation status changes.
    Refresh,
}

impl Topic {
    pub const ALL: [Topic; 7] = [
        Topic::Updates,
        Topic::ConversationList,
        Topic::ReadStatus,
        Topic::TotalUnreadCount,
        Topic::ConversationUnreadCount,
        Topic::OpenConversation,
        Topic::Refresh,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Updates => "updates",
            Topic::ConversationList => "conversationList",
            Topic::ReadStatus => "readStatus",
            Topic::TotalUnreadCount => "totalUnreadCount",
            Topic::ConversationUnreadCount => "conversationUnreadCount",
            Topic::OpenConversation => "openConversation",
            Topic::Refresh => "refresh",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The payload delivered to subscribers. Each variant belongs to exactly one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Message(ChatMessage),
    ConversationList(Vec<ConversationSummary>),
    ReadStatus(ReadReceipt),
    TotalUnreadCount(u64),
    ConversationUnreadCount {
        conversation_id: ConversationId,
        count: u64,
    },
    OpenConversation(Option<ConversationId>),
    Refresh,
}

impl Notification {
    pub fn topic(&self) -> Topic {
        match self {
            Notification::Message(_) => Topic::Updates,
            Notification::ConversationList(_) => Topic::ConversationList,
            Notification::ReadStatus(_) => Topic::ReadStatus,
            Notification::TotalUnreadCount(_) => Topic::TotalUnreadCount,
            Notification::ConversationUnreadCount { .. } => Topic::ConversationUnreadCount,
            Notification::OpenConversation(_) => Topic::OpenConversation,
            Notification::Refresh => Topic::Refresh,
        }
    }
}

/// A subscriber callback.
pub type Callback = Arc<dyn Fn(&Notification) + Send + Sync>;

type SubscriptionId = u64;

#[derive(Default)]
struct StoreInner {
    /// Per topic, callbacks keyed by a monotonically increasing id, which
    /// keeps iteration in registration order.
    listeners: DashMap<Topic, BTreeMap<SubscriptionId, Callback>>,
    next_id: AtomicU64,
    current_unread: AtomicU64,
}

impl StoreInner {
    fn remove(&self, topic: Topic, id: SubscriptionId) {
        let mut now_empty = false;
        if let Some(mut entry) = self.listeners.get_mut(&topic) {
            entry.remove(&id);
            now_empty = entry.is_empty();
        }
        if now_empty {
            self.listeners.remove_if(&topic, |_, callbacks| callbacks.is_empty());
        }
    }
}

/// The pub/sub hub. Cheap to clone; clones share listeners and cached values.
#[derive(Clone, Default)]
pub struct SubscriptionStore {
    inner: Arc<StoreInner>,
}

impl fmt::Debug for SubscriptionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionStore")
            .field("topics", &self.inner.listeners.len())
            .field("current_unread", &self.current_unread_count())
            .finish()
    }
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` under `topic`.
    ///
    /// The returned handle unsubscribes when [`Subscription::unsubscribe`] is
    /// called or when it is dropped, whichever comes first.
    pub fn subscribe<F>(&self, topic: Topic, callback: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .entry(topic)
            .or_default()
            .insert(id, Arc::new(callback));
        debug!(%topic, id, "Subscriber registered");

        Subscription {
            topic,
            id,
            store: Arc::downgrade(&self.inner),
            active: AtomicBool::new(true),
        }
    }

    /// Delivers `notification` to every subscriber of its topic.
    ///
    /// A panicking callback is logged and skipped; the rest still run.
    pub fn emit(&self, notification: Notification) {
        let topic = notification.topic();
        // The shard guard must be released before any callback runs.
        let snapshot: Vec<(SubscriptionId, Callback)> = match self.inner.listeners.get(&topic) {
            Some(entry) => entry.iter().map(|(id, cb)| (*id, Arc::clone(cb))).collect(),
            None => return,
        };

        for (id, callback) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(&notification))).is_err() {
                warn!(%topic, id, "Subscriber callback panicked; continuing with the rest");
            }
        }
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.inner
            .listeners
            .get(&topic)
            .map(|entry| entry.len())
            .unwrap_or(0)
    }

    /// The last total unread count, for subscribers that mount after the
    /// most recent emit.
    pub fn current_unread_count(&self) -> u64 {
        self.inner.current_unread.load(Ordering::Acquire)
    }

    pub fn set_current_unread_count(&self, count: u64) {
        self.inner.current_unread.store(count, Ordering::Release);
    }

    /// Drops every listener and resets cached values.
    ///
    /// Outstanding [`Subscription`] handles become inert.
    pub fn dispose(&self) {
        self.inner.listeners.clear();
        self.inner.current_unread.store(0, Ordering::Release);
        debug!("Subscription store disposed");
    }
}

/// Handle returned by [`SubscriptionStore::subscribe`].
#[must_use = "dropping a Subscription unsubscribes its callback"]
pub struct Subscription {
    topic: Topic,
    id: SubscriptionId,
    store: Weak<StoreInner>,
    active: AtomicBool,
}

impl Subscription {
    /// Removes the callback. Calling it again is a no-op.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(inner) = self.store.upgrade() {
            inner.remove(self.topic, self.id);
            debug!(topic = %self.topic, id = self.id, "Subscriber removed");
        }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
