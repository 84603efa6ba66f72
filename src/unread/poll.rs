// src/unread/poll.rs
use crate::error::Error;
use crate::unread::source::UnreadCountSource;
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{Instrument, debug, error, info_span, instrument, warn};

// --- Type Aliases ---

/// The in-flight fetch. Every caller that arrives while it runs awaits a
/// clone of it and receives the same total together with the stamp taken
/// when the fetch started.
type SharedPoll<T> = Shared<BoxFuture<'static, Result<(u64, T), Arc<Error>>>>;

// --- Statistics ---

/// Counters for the poll coalescer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollStats {
    /// Fetches actually sent to the source.
    pub initiated: usize,
    /// Requests that joined a fetch already in flight.
    pub coalesced: usize,
    /// Initiated fetches that failed (timeouts excluded).
    pub failed: usize,
    /// Initiated fetches that exceeded the timeout.
    pub timed_out: usize,
}

// --- Coalescer ---

/// Collapses concurrent unread-count polls into one request.
///
/// `T` is a stamp captured once, by the caller that starts a fetch, and
/// handed to everyone who joins it. Callers use it to tell which state the
/// result belongs to.
pub struct PollCoalescer<T = ()> {
    source: Arc<dyn UnreadCountSource>,
    in_flight: Arc<Mutex<Option<SharedPoll<T>>>>,
    timeout: Option<Duration>,
    stats: Arc<Mutex<PollStats>>,
}

impl<T> std::fmt::Debug for PollCoalescer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollCoalescer")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl<T> Clone for PollCoalescer<T> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            in_flight: Arc::clone(&self.in_flight),
            timeout: self.timeout,
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<T> PollCoalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(source: Arc<dyn UnreadCountSource>) -> Self {
        Self {
            source,
            in_flight: Arc::new(Mutex::new(None)),
            timeout: None,
            stats: Arc::new(Mutex::new(PollStats::default())),
        }
    }

    /// Fetches slower than `timeout` fail with [`Error::Timeout`].
    pub fn with_timeout(source: Arc<dyn UnreadCountSource>, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::new(source)
        }
    }

    /// Returns the authoritative total, joining the in-flight fetch if there
    /// is one.
    pub async fn poll(&self) -> Result<u64, Arc<Error>>
    where
        T: Default,
    {
        self.poll_stamped(T::default).await.map(|(total, _)| total)
    }

    /// Like [`PollCoalescer::poll`], but also returns the stamp of the fetch
    /// the result came from.
    ///
    /// `stamp` runs only if this call starts a new fetch, and runs before the
    /// source is asked. A caller that joins gets the initiator's stamp, never
    /// its own.
    #[instrument(skip_all)]
    pub async fn poll_stamped<F>(&self, stamp: F) -> Result<(u64, T), Arc<Error>>
    where
        F: FnOnce() -> T + Send,
    {
        // --- 1. Join or start (slot lock held) ---
        let shared = {
            let mut slot = self.in_flight.lock().await;
            if let Some(existing) = slot.as_ref() {
                // --- 1a. Coalesce ---
                debug!("Poll coalesced, joining the in-flight fetch");
                self.stats.lock().await.coalesced += 1;
                existing.clone()
            } else {
                // --- 1b. Start a new fetch ---
                // Stamped while the slot is still empty and locked, so no
                // joiner can observe a fetch without its stamp.
                let stamp = stamp();
                self.stats.lock().await.initiated += 1;

                let source = Arc::clone(&self.source);
                let slot_handle = Arc::clone(&self.in_flight);
                let stats = Arc::clone(&self.stats);
                let fetch_timeout = self.timeout;

                let fetch = async move {
                    // --- Step 1: Ask the source, bounded by the timeout ---
                    let result = match fetch_timeout {
                        Some(limit) => match timeout(limit, source.fetch_total_unread()).await {
                            Ok(result) => result,
                            Err(_) => {
                                warn!(?limit, "Unread poll timed out");
                                stats.lock().await.timed_out += 1;
                                Err(Error::Timeout(format!(
                                    "unread poll exceeded {}ms",
                                    limit.as_millis()
                                )))
                            }
                        },
                        None => source.fetch_total_unread().await,
                    };

                    // --- Step 2: Free the slot ---
                    // Before anyone observes the result, so the next poll
                    // starts a fresh fetch.
                    slot_handle.lock().await.take();

                    // --- Step 3: Count failures once, for every joiner ---
                    if let Err(e) = &result {
                        if !matches!(e, Error::Timeout(_)) {
                            error!(error = %e, "Unread poll failed");
                            stats.lock().await.failed += 1;
                        }
                    }
                    result.map(|total| (total, stamp)).map_err(Arc::new)
                }
                .instrument(info_span!("unread_poll_fetch"));

                let new_shared = fetch.boxed().shared();

                *slot = Some(new_shared.clone());
                new_shared
            }
        };

        // --- 2. Await outside the slot lock ---
        shared.await
    }

    pub async fn stats(&self) -> PollStats {
        self.stats.lock().await.clone()
    }

    /// Whether a fetch is currently running.
    pub async fn is_in_flight(&self) -> bool {
        self.in_flight.lock().await.is_some()
    }

    pub async fn reset_stats(&self) {
        *self.stats.lock().await = PollStats::default();
    }
}
