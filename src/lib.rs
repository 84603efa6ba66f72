//! # Conversation Realtime Kit
//!
//! The client side of a conversation backend's realtime channel: one
//! WebSocket connection with keep-alive and exponential backoff, a router
//! that turns raw frames into typed events, a pub/sub store that fans them
//! out, and a reconciler that keeps the unread counts consistent across
//! server pushes, REST polls and the conversation the user has open.
//!
//! ## Core Features
//!
//! - **`RealtimeClient`**: a handle to a background task owning the connection.
//!   Reconnects with `min(base · 2^attempt, max)` backoff and gives up after a
//!   bounded number of attempts.
//! - **`EventRouter`**: never fails on bad input; unknown frames are dropped.
//! - **`SubscriptionStore`**: topic-based fan-out with idempotent, drop-safe
//!   subscriptions and per-callback panic isolation.
//! - **`UnreadReconciler`**: optimistic increments corrected by debounced,
//!   coalesced REST polls; stale poll results are discarded.
//! - **Pluggable I/O**: `Connector`/`Transport`, `EndpointBuilder`,
//!   `CredentialProvider` and `UnreadCountSource` are traits, with
//!   tokio-tungstenite and reqwest implementations behind features.
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! # #[cfg(feature = "tungstenite")]
//! # async fn run(source: std::sync::Arc<dyn conversation_realtime_kit::unread::UnreadCountSource>) -> conversation_realtime_kit::Result<()> {
//! use conversation_realtime_kit::prelude::*;
//!
//! let config = ClientConfig::default().with_base_url("https://api.example.com");
//! let client = RealtimeClient::builder(config, TungsteniteConnector, source).build()?;
//!
//! let _total = client.store().subscribe(Topic::TotalUnreadCount, |n| {
//!     if let Notification::TotalUnreadCount(total) = n {
//!         println!("unread: {total}");
//!     }
//! });
//! client.connect("my-token").await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod store;
pub mod unread;
pub mod ws;

pub use error::{Error, Result};

/// Public prelude for convenience.
///
/// `use conversation_realtime_kit::prelude::*;`
pub mod prelude {
    pub use crate::auth::{Credential, CredentialProvider, EndpointBuilder, QueryTokenEndpoint};
    pub use crate::config::ClientConfig;
    pub use crate::error::{Error, Result};
    pub use crate::store::{Notification, Subscription, SubscriptionStore, Topic};
    pub use crate::unread::{UnreadCountSource, UnreadReconciler};
    pub use crate::ws::event::{InboundEvent, OutboundFrame};
    pub use crate::ws::router::EventRouter;
    pub use crate::ws::service::{RealtimeClient, RealtimeClientBuilder};
    pub use crate::ws::transport::{Connector, Transport, TransportEvent};
    pub use crate::ws::types::{ConnectionState, ConnectionStatus};

    #[cfg(feature = "tungstenite")]
    pub use crate::ws::transport::TungsteniteConnector;

    #[cfg(feature = "http")]
    pub use crate::unread::source::HttpUnreadCountSource;
}
