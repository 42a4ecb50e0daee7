//! Event types
//!
//! Tagged event variants shared by the fan-out bus and the WebSocket wire
//! format, plus the frames accepted from clients. Serialization is
//! self-describing JSON; unknown fields are ignored on decode.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, PresenceStatus};

/// Server-produced event, fanned out to every participant of a conversation.
///
/// Every variant carries the conversation, the originating user and the
/// server timestamp; the remaining fields depend on the kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Synthetic frame sent to a session right after registration.
    Connected {
        conversation_id: Uuid,
        user_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    Message {
        conversation_id: Uuid,
        user_id: Uuid,
        timestamp: DateTime<Utc>,
        message: Message,
    },
    UserJoined {
        conversation_id: Uuid,
        user_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    UserLeft {
        conversation_id: Uuid,
        user_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    Typing {
        conversation_id: Uuid,
        user_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    StopTyping {
        conversation_id: Uuid,
        user_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    MessageRead {
        conversation_id: Uuid,
        user_id: Uuid,
        timestamp: DateTime<Utc>,
        message_ids: Vec<Uuid>,
    },
    PresenceChanged {
        conversation_id: Uuid,
        user_id: Uuid,
        timestamp: DateTime<Utc>,
        status: PresenceStatus,
    },
    /// Reported to a single session when a recoverable failure occurred.
    Error {
        conversation_id: Uuid,
        user_id: Uuid,
        timestamp: DateTime<Utc>,
        code: String,
        message: String,
    },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Connected { .. } => "connected",
            Event::Message { .. } => "message",
            Event::UserJoined { .. } => "user_joined",
            Event::UserLeft { .. } => "user_left",
            Event::Typing { .. } => "typing",
            Event::StopTyping { .. } => "stop_typing",
            Event::MessageRead { .. } => "message_read",
            Event::PresenceChanged { .. } => "presence_changed",
            Event::Error { .. } => "error",
        }
    }

    pub fn conversation_id(&self) -> Uuid {
        match self {
            Event::Connected { conversation_id, .. }
            | Event::Message { conversation_id, .. }
            | Event::UserJoined { conversation_id, .. }
            | Event::UserLeft { conversation_id, .. }
            | Event::Typing { conversation_id, .. }
            | Event::StopTyping { conversation_id, .. }
            | Event::MessageRead { conversation_id, .. }
            | Event::PresenceChanged { conversation_id, .. }
            | Event::Error { conversation_id, .. } => *conversation_id,
        }
    }

    pub fn user_id(&self) -> Uuid {
        match self {
            Event::Connected { user_id, .. }
            | Event::Message { user_id, .. }
            | Event::UserJoined { user_id, .. }
            | Event::UserLeft { user_id, .. }
            | Event::Typing { user_id, .. }
            | Event::StopTyping { user_id, .. }
            | Event::MessageRead { user_id, .. }
            | Event::PresenceChanged { user_id, .. }
            | Event::Error { user_id, .. } => *user_id,
        }
    }

    /// Whether delivery skips the originating user. Senders must still see
    /// their own `message` events; typing indicators are not echoed.
    pub fn excludes_originator(&self) -> bool {
        matches!(self, Event::Typing { .. } | Event::StopTyping { .. })
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// Body of an inbound `message` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub content: String,
    /// Kind name; validated by the chat core so unknown kinds surface as
    /// invalid-argument instead of a dropped frame.
    pub message_type: String,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
}

/// Frames accepted from clients over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Message { message: InboundMessage },
    Typing,
    StopTyping,
    Heartbeat,
    ReadReceipt { message_ids: Vec<Uuid> },
}

impl ClientFrame {
    pub fn decode(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}
