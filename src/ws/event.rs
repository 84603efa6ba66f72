//! Wire frames: the inbound event union, its parser, and outbound frames.
//!
//! Inbound frames look like
//! `{ "event": "...", "data": {...}, "conversation_id": 1, "message": {...}, "timestamp": ... }`
//! with every field but `event` optional. The backend is not consistent about
//! where it puts things (a conversation id may sit at the top level or inside
//! `data`), so the parser looks in each plausible place before giving up.
//! Giving up always means [`InboundEvent::Unknown`], never an error.

use crate::error::Result;
use crate::ws::types::{ConversationId, MessageId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// A message timestamp, either epoch milliseconds or a server-formatted string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    Millis(i64),
    Text(String),
}

/// A chat message pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub sender_id: Option<UserId>,
    pub sender_role: Option<String>,
    pub body: String,
    pub timestamp: Option<Timestamp>,
}

/// A read receipt for a conversation or a single message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadReceipt {
    pub conversation_id: Option<ConversationId>,
    pub message_id: Option<MessageId>,
    pub reader_id: Option<UserId>,
}

/// A typing indicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingEvent {
    pub conversation_id: Option<ConversationId>,
    pub user_id: Option<UserId>,
    pub is_typing: bool,
}

/// A change in a conversation's status (archived, closed, reassigned...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationStatus {
    pub conversation_id: Option<ConversationId>,
    pub status: Option<String>,
}

/// One row of the conversation list as far as unread counts are concerned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    #[serde(default, alias = "unread")]
    pub unread_count: u64,
}

impl ConversationSummary {
    pub fn new(id: ConversationId, unread_count: u64) -> Self {
        Self { id, unread_count }
    }
}

/// Every server-pushed event the client understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    NewMessage(ChatMessage),
    TotalUnreadCount(u64),
    ConversationUnreadCount {
        conversation_id: ConversationId,
        count: u64,
    },
    ReadReceipt(ReadReceipt),
    Typing(TypingEvent),
    ConversationStatus(ConversationStatus),
    Ping,
    Pong,
    TestConnection,
    /// Malformed JSON, an unrecognised tag, or a recognised tag missing a
    /// required field.
    Unknown { event: Option<String> },
}

impl InboundEvent {
    /// Short name for logs and spans.
    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::NewMessage(_) => "new_message",
            InboundEvent::TotalUnreadCount(_) => "total_unread_count",
            InboundEvent::ConversationUnreadCount { .. } => "conversation_unread_count",
            InboundEvent::ReadReceipt(_) => "read_receipt",
            InboundEvent::Typing(_) => "typing",
            InboundEvent::ConversationStatus(_) => "conversation_status",
            InboundEvent::Ping => "ping",
            InboundEvent::Pong => "pong",
            InboundEvent::TestConnection => "test_connection",
            InboundEvent::Unknown { .. } => "unknown",
        }
    }

    fn unknown(event: &str) -> Self {
        InboundEvent::Unknown {
            event: Some(event.to_owned()),
        }
    }
}

/// Frames the client sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundFrame {
    Ping,
    Typing { is_typing: bool },
    MessageRead { message_id: MessageId },
    GetConversations,
}

impl OutboundFrame {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    event: String,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    message: Option<Value>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

impl RawFrame {
    /// Looks a key up in `data` first, then at the top level.
    fn lookup(&self, keys: &[&str]) -> Option<&Value> {
        let data = self.data.as_ref().and_then(Value::as_object);
        keys.iter().find_map(|key| {
            data.and_then(|d| d.get(*key))
                .filter(|v| !v.is_null())
                .or_else(|| self.rest.get(*key).filter(|v| !v.is_null()))
        })
    }

    fn lookup_i64(&self, keys: &[&str]) -> Option<i64> {
        self.lookup(keys).and_then(Value::as_i64)
    }

    fn lookup_u64(&self, keys: &[&str]) -> Option<u64> {
        self.lookup(keys).and_then(Value::as_u64)
    }

    fn message_object(&self) -> Option<&Map<String, Value>> {
        if let Some(message) = self.message.as_ref().and_then(Value::as_object) {
            return Some(message);
        }
        let data = self.data.as_ref().and_then(Value::as_object)?;
        data.get("message")
            .and_then(Value::as_object)
            .or(Some(data))
    }
}

fn field<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .find_map(|key| object.get(*key).filter(|v| !v.is_null()))
}

/// Parses one raw frame. Never fails: anything unusable becomes
/// [`InboundEvent::Unknown`].
pub fn parse(raw: &str) -> InboundEvent {
    let frame: RawFrame = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "Discarding malformed frame");
            return InboundEvent::Unknown { event: None };
        }
    };

    let event = match frame.event.as_str() {
        "conversation_message" | "new_conversation_message" => parse_message(&frame),
        "total_unread_count" => frame
            .lookup_u64(&["total_unread_count", "count", "unread_count"])
            .or_else(|| frame.data.as_ref().and_then(Value::as_u64))
            .map(InboundEvent::TotalUnreadCount),
        "conversation_unread_count" => {
            let conversation_id = frame.lookup_i64(&["conversation_id", "conversation"]);
            let count = frame.lookup_u64(&["unread_count", "count"]);
            conversation_id
                .zip(count)
                .map(|(conversation_id, count)| InboundEvent::ConversationUnreadCount {
                    conversation_id,
                    count,
                })
        }
        "conversation_read" | "message_read" => {
            Some(InboundEvent::ReadReceipt(ReadReceipt {
                conversation_id: frame.lookup_i64(&["conversation_id", "conversation"]),
                message_id: frame.lookup_i64(&["message_id"]),
                reader_id: frame.lookup_i64(&["reader_id", "user_id", "read_by"]),
            }))
        }
        "typing" => frame
            .lookup(&["is_typing"])
            .and_then(Value::as_bool)
            .map(|is_typing| {
                InboundEvent::Typing(TypingEvent {
                    conversation_id: frame.lookup_i64(&["conversation_id", "conversation"]),
                    user_id: frame.lookup_i64(&["user_id", "sender_id"]),
                    is_typing,
                })
            }),
        "conversation_status" => Some(InboundEvent::ConversationStatus(ConversationStatus {
            conversation_id: frame.lookup_i64(&["conversation_id", "conversation"]),
            status: frame
                .lookup(&["status"])
                .and_then(Value::as_str)
                .map(str::to_owned),
        })),
        "ping" => Some(InboundEvent::Ping),
        "pong" => Some(InboundEvent::Pong),
        "test_connection" | "test_connection_response" => Some(InboundEvent::TestConnection),
        other => {
            debug!(event = other, "Unrecognised event tag");
            None
        }
    };

    event.unwrap_or_else(|| InboundEvent::unknown(&frame.event))
}

fn parse_message(frame: &RawFrame) -> Option<InboundEvent> {
    let Some(message) = frame.message_object() else {
        debug!(event = %frame.event, "Message frame without a message body");
        return None;
    };

    let conversation_id = field(message, &["conversation_id", "conversation"])
        .and_then(Value::as_i64)
        .or_else(|| frame.lookup_i64(&["conversation_id"]))?;
    let message_id = field(message, &["id", "message_id"]).and_then(Value::as_i64)?;

    let timestamp = field(message, &["timestamp", "created_at"])
        .or_else(|| frame.rest.get("timestamp"))
        .and_then(|v| serde_json::from_value::<Timestamp>(v.clone()).ok());

    Some(InboundEvent::NewMessage(ChatMessage {
        conversation_id,
        message_id,
        sender_id: field(message, &["sender_id", "sender"]).and_then(Value::as_i64),
        sender_role: field(message, &["sender_role", "role"])
            .and_then(Value::as_str)
            .map(str::to_owned),
        body: field(message, &["body", "content", "message", "text"])
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        timestamp,
    }))
}
