// conversation-realtime-kit/src/ws/types.rs

//! Identifiers and status types shared by the connection components.

use std::fmt;
use uuid::Uuid;

/// A unique identifier for one transport session, recorded in tracing spans.
pub type ConnectionId = Uuid;

/// Backend identifier of a conversation.
pub type ConversationId = i64;

/// Backend identifier of a message.
pub type MessageId = i64;

/// Backend identifier of a user.
pub type UserId = i64;

/// WebSocket close code for a deliberate, normal closure.
pub const NORMAL_CLOSURE: u16 = 1000;

/// WebSocket close code reported when the connection dropped without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Lifecycle of the logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Never connected.
    #[default]
    Idle,
    /// A transport is being opened.
    Connecting,
    /// The transport is open and keep-alive is running.
    Open,
    /// A deliberate close is in progress.
    Closing,
    /// No transport. A reconnect may be pending.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Snapshot of the connection published to the UI.
///
/// `last_error` is non-fatal while `terminal` is false: a reconnect is in
/// flight. Once `terminal` is set only an explicit connect recovers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub retry_attempt: u32,
    pub last_error: Option<String>,
    pub terminal: bool,
}

impl ConnectionStatus {
    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }
}
