//! The crate-wide error type.

use thiserror::Error;

/// Errors surfaced by the connection, the REST fallback and configuration.
///
/// Parse failures and subscriber panics never appear here: they are absorbed
/// (and logged) at the router and store boundaries.
#[derive(Debug, Error)]
pub enum Error {
    /// The transport could not be opened or failed while open. Recoverable
    /// through the reconnect backoff.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server rejected the credential. Fatal for the current attempt.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A connect attempt or a REST poll exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Invalid configuration (bad URL, unsupported scheme, zero intervals).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A URL could not be parsed.
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    /// A frame or response body could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The REST fallback returned something other than an unread count.
    #[error("unread count poll failed: {0}")]
    Poll(String),

    /// The background connection task has stopped.
    #[error("realtime client task is no longer running")]
    ClientClosed,
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
