//! Unread count reconciliation.
//!
//! [`UnreadReconciler`] is the single owner of the unread totals. It merges
//! three sources that disagree in timing:
//!
//! * server pushes (`total_unread_count`, `conversation_unread_count`),
//!   authoritative when they arrive;
//! * the conversation list snapshot, from which the total is recomputed
//!   excluding the conversation the user has open;
//! * REST polls through [`PollCoalescer`], used to correct optimistic
//!   increments and to catch up after reconnects.
//!
//! A poll result is applied only if nothing authoritative happened while it
//! was in flight: the reconciler keeps a `generation` (bumped by
//! [`UnreadReconciler::dispose`]) and a `revision` (bumped by pushes and
//! snapshot recomputes). The pair is stamped onto each fetch when it starts,
//! so a caller joining a fetch already in flight is judged by the fetch's
//! stamp rather than by when it joined.
//!
//! Every change, including the store's cached count, is written under one
//! lock. Notifications are emitted after the lock is released, and a total
//! that was overtaken by a newer write in the meantime is not emitted.

pub mod poll;
pub mod source;

pub use poll::{PollCoalescer, PollStats};
pub use source::{UnreadCountResponse, UnreadCountSource};

use crate::config::ClientConfig;
use crate::error::Error;
use crate::store::{Notification, SubscriptionStore};
use crate::ws::event::ConversationSummary;
use crate::ws::types::ConversationId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The reconciled unread state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnreadState {
    /// The displayed total.
    pub total_unread: u64,
    pub per_conversation: HashMap<ConversationId, u64>,
    pub open_conversation: Option<ConversationId>,
    /// The last conversation list received, if any.
    pub snapshot: Option<Vec<ConversationSummary>>,
    generation: u64,
    revision: u64,
    /// Bumped by every write of `total_unread`.
    total_seq: u64,
}

impl UnreadState {
    /// Sum over the snapshot, leaving out the open conversation.
    fn total_from_snapshot(&self) -> Option<u64> {
        let snapshot = self.snapshot.as_ref()?;
        Some(
            snapshot
                .iter()
                .filter(|c| Some(c.id) != self.open_conversation)
                .fold(0u64, |acc, c| acc.saturating_add(c.unread_count)),
        )
    }
}

/// Guard values stamped onto a fetch when it starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollTicket {
    generation: u64,
    revision: u64,
}

struct ReconcilerInner {
    store: SubscriptionStore,
    coalescer: PollCoalescer<PollTicket>,
    debounce: Duration,
    state: Mutex<UnreadState>,
    debounce_task: Mutex<Option<JoinHandle<()>>>,
}

impl ReconcilerInner {
    fn state(&self) -> MutexGuard<'_, UnreadState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ticket(&self) -> PollTicket {
        let state = self.state();
        PollTicket {
            generation: state.generation,
            revision: state.revision,
        }
    }

    fn apply_poll(&self, total: u64, ticket: PollTicket) -> bool {
        let seq = {
            let mut state = self.state();
            if state.generation != ticket.generation || state.revision != ticket.revision {
                debug!(
                    total,
                    "Discarding stale unread poll; state changed while it was in flight"
                );
                return false;
            }
            self.commit_total(&mut state, total)
        };
        self.publish_total(total, seq);
        true
    }

    /// Writes the total and the store's cached count together. Must be called
    /// with the state lock held.
    fn commit_total(&self, state: &mut UnreadState, total: u64) -> u64 {
        state.total_unread = total;
        state.total_seq += 1;
        self.store.set_current_unread_count(total);
        state.total_seq
    }

    /// Emits `total` unless a newer total was committed after it.
    fn publish_total(&self, total: u64, seq: u64) {
        if self.state().total_seq != seq {
            debug!(total, "Unread total superseded before it was published");
            return;
        }
        self.store.emit(Notification::TotalUnreadCount(total));
    }

    fn cancel_debounce(&self) {
        let pending = self
            .debounce_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = pending {
            task.abort();
        }
    }
}

impl Drop for ReconcilerInner {
    fn drop(&mut self) {
        self.cancel_debounce();
    }
}

async fn run_poll(inner: Arc<ReconcilerInner>) -> Result<u64, Arc<Error>> {
    let (total, ticket) = inner.coalescer.poll_stamped(|| inner.ticket()).await?;
    inner.apply_poll(total, ticket);
    Ok(total)
}

/// Owner of the unread totals. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct UnreadReconciler {
    inner: Arc<ReconcilerInner>,
}

impl std::fmt::Debug for UnreadReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnreadReconciler")
            .field("state", &*self.inner.state())
            .field("debounce", &self.inner.debounce)
            .finish()
    }
}

impl UnreadReconciler {
    pub fn new(
        store: SubscriptionStore,
        source: Arc<dyn UnreadCountSource>,
        debounce: Duration,
    ) -> Self {
        Self::with_coalescer(store, PollCoalescer::new(source), debounce)
    }

    pub fn from_config(
        store: SubscriptionStore,
        source: Arc<dyn UnreadCountSource>,
        config: &ClientConfig,
    ) -> Self {
        Self::with_coalescer(
            store,
            PollCoalescer::with_timeout(source, config.poll_timeout),
            config.poll_debounce,
        )
    }

    pub fn with_coalescer(
        store: SubscriptionStore,
        coalescer: PollCoalescer<PollTicket>,
        debounce: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ReconcilerInner {
                store,
                coalescer,
                debounce,
                state: Mutex::new(UnreadState::default()),
                debounce_task: Mutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> &SubscriptionStore {
        &self.inner.store
    }

    pub fn total_unread(&self) -> u64 {
        self.inner.state().total_unread
    }

    pub fn conversation_unread(&self, conversation_id: ConversationId) -> Option<u64> {
        self.inner
            .state()
            .per_conversation
            .get(&conversation_id)
            .copied()
    }

    pub fn open_conversation(&self) -> Option<ConversationId> {
        self.inner.state().open_conversation
    }

    /// A copy of the current state.
    pub fn snapshot(&self) -> UnreadState {
        self.inner.state().clone()
    }

    pub async fn poll_stats(&self) -> PollStats {
        self.inner.coalescer.stats().await
    }

    /// The server pushed the authoritative total.
    pub fn on_server_total(&self, total: u64) {
        let seq = {
            let mut state = self.inner.state();
            state.revision += 1;
            self.inner.commit_total(&mut state, total)
        };
        debug!(total, "Server pushed unread total");
        self.inner.publish_total(total, seq);
    }

    /// The server pushed one conversation's count. The total is re-polled.
    pub fn on_conversation_count(&self, conversation_id: ConversationId, count: u64) {
        {
            let mut state = self.inner.state();
            state.per_conversation.insert(conversation_id, count);
            if let Some(entry) = state
                .snapshot
                .as_mut()
                .and_then(|s| s.iter_mut().find(|c| c.id == conversation_id))
            {
                entry.unread_count = count;
            }
        }
        debug!(conversation_id, count, "Server pushed conversation unread count");
        self.inner.store.emit(Notification::ConversationUnreadCount {
            conversation_id,
            count,
        });
        self.schedule_poll();
    }

    /// A fresh conversation list. The total is recomputed from it, leaving out
    /// the open conversation.
    pub fn on_conversation_list(&self, conversations: Vec<ConversationSummary>) {
        let (total, seq) = {
            let mut state = self.inner.state();
            state.per_conversation = conversations
                .iter()
                .map(|c| (c.id, c.unread_count))
                .collect();
            state.snapshot = Some(conversations.clone());
            let total = state.total_from_snapshot().unwrap_or_default();
            state.revision += 1;
            (total, self.inner.commit_total(&mut state, total))
        };
        info!(
            conversations = conversations.len(),
            total, "Recomputed unread total from conversation list"
        );
        self.inner
            .store
            .emit(Notification::ConversationList(conversations));
        self.inner.publish_total(total, seq);
    }

    /// The user opened (or closed, with `None`) a conversation.
    pub fn set_open_conversation(&self, conversation_id: Option<ConversationId>) {
        let recomputed = {
            let mut state = self.inner.state();
            state.open_conversation = conversation_id;
            state.total_from_snapshot().map(|total| {
                state.revision += 1;
                (total, self.inner.commit_total(&mut state, total))
            })
        };
        self.inner
            .store
            .emit(Notification::OpenConversation(conversation_id));
        if let Some((total, seq)) = recomputed {
            self.inner.publish_total(total, seq);
        }
    }

    /// A message arrived. Outside the open conversation the total is bumped
    /// optimistically and corrected by a debounced poll.
    pub fn on_new_message(&self, conversation_id: ConversationId) {
        let bumped = {
            let mut state = self.inner.state();
            if state.open_conversation == Some(conversation_id) {
                None
            } else {
                let total = state.total_unread.saturating_add(1);
                Some((total, self.inner.commit_total(&mut state, total)))
            }
        };
        let Some((total, seq)) = bumped else {
            debug!(conversation_id, "Message in the open conversation; total unchanged");
            return;
        };
        self.inner.publish_total(total, seq);
        self.schedule_poll();
    }

    /// Schedules a poll after the debounce delay, replacing any pending one.
    ///
    /// Requires a tokio runtime; without one the request is logged and
    /// dropped.
    pub fn schedule_poll(&self) {
        let Ok(runtime) = Handle::try_current() else {
            warn!("No tokio runtime; skipping unread poll");
            return;
        };
        let weak: Weak<ReconcilerInner> = Arc::downgrade(&self.inner);
        let debounce = self.inner.debounce;
        let spawner = runtime.clone();
        let task = runtime.spawn(async move {
            tokio::time::sleep(debounce).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            // The fetch runs in its own task so replacing this timer never
            // cancels a request already sent.
            spawner.spawn(async move {
                if let Err(e) = run_poll(inner).await {
                    warn!(error = %e, "Debounced unread poll failed");
                }
            });
        });

        let previous = self
            .inner
            .debounce_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Polls immediately and applies the result unless it went stale.
    pub async fn refresh_now(&self) -> Result<u64, Arc<Error>> {
        run_poll(Arc::clone(&self.inner)).await
    }

    /// Clears all state, cancels the pending poll and invalidates polls in
    /// flight. The reconciler stays usable afterwards.
    pub fn dispose(&self) {
        self.inner.cancel_debounce();
        {
            let mut state = self.inner.state();
            *state = UnreadState {
                generation: state.generation + 1,
                total_seq: state.total_seq + 1,
                ..UnreadState::default()
            };
            self.inner.store.set_current_unread_count(0);
        }
        debug!("Unread state disposed");
    }
}
