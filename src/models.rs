//! Domain entities
//!
//! Conversations, memberships, messages and read markers as stored in the
//! durable store, plus the ephemeral presence record kept in the fast store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum message content length in code points, applied after trimming.
pub const MAX_MESSAGE_CHARS: usize = 4000;

/// Conversation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Direct => "direct",
            ConversationKind::Group => "group",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(ConversationKind::Direct),
            "group" => Some(ConversationKind::Group),
            _ => None,
        }
    }
}

/// A container for membership and messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub kind: ConversationKind,
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_private: bool,
    /// 0 means unlimited.
    pub max_members: i32,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn has_capacity(&self, current_members: i64) -> bool {
        self.max_members == 0 || current_members < self.max_members as i64
    }
}

/// Membership role within a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Owner,
    Admin,
    Member,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Owner => "owner",
            MemberRole::Admin => "admin",
            MemberRole::Member => "member",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(MemberRole::Owner),
            "admin" => Some(MemberRole::Admin),
            "member" => Some(MemberRole::Member),
            _ => None,
        }
    }
}

/// (conversation, user) membership row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub role: MemberRole,
    pub joined_at: DateTime<Utc>,
}

/// Message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    File,
    Video,
    Audio,
    /// Produced only by the engine; rejected when supplied by clients.
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::File => "file",
            MessageKind::Video => "video",
            MessageKind::Audio => "audio",
            MessageKind::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MessageKind::Text),
            "image" => Some(MessageKind::Image),
            "file" => Some(MessageKind::File),
            "video" => Some(MessageKind::Video),
            "audio" => Some(MessageKind::Audio),
            "system" => Some(MessageKind::System),
            _ => None,
        }
    }
}

/// A stored chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub kind: MessageKind,
    pub parent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only (user, message) read receipt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadMarker {
    pub user_id: Uuid,
    pub message_id: Uuid,
    pub read_at: DateTime<Utc>,
}

/// Conversation summary with its unread count for one caller
#[derive(Debug, Clone, Serialize)]
pub struct ConversationWithUnread {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub unread_count: i64,
}

/// User reachability status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Away => "away",
            PresenceStatus::Busy => "busy",
            PresenceStatus::Offline => "offline",
        }
    }
}

/// Presence record kept in the fast store with a short TTL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Presence {
    pub user_id: Uuid,
    pub status: PresenceStatus,
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_conversation: Option<Uuid>,
}

impl Presence {
    /// The record returned when nothing is stored for the user.
    pub fn offline(user_id: Uuid) -> Self {
        Self {
            user_id,
            status: PresenceStatus::Offline,
            last_seen: None,
            current_conversation: None,
        }
    }
}

/// Pagination window for listing operations
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub number: u32,
    pub size: u32,
}

impl Page {
    pub const MAX_SIZE: u32 = 100;

    /// Clamp to the contract: `page >= 0`, `size in [1, 100]`.
    pub fn new(number: u32, size: u32) -> Self {
        Self {
            number,
            size: size.clamp(1, Self::MAX_SIZE),
        }
    }

    pub fn offset(&self) -> i64 {
        self.number as i64 * self.size as i64
    }

    pub fn limit(&self) -> i64 {
        self.size as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            MessageKind::Text,
            MessageKind::Image,
            MessageKind::File,
            MessageKind::Video,
            MessageKind::Audio,
            MessageKind::System,
        ] {
            assert_eq!(MessageKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MessageKind::parse("sticker"), None);
    }

    #[test]
    fn test_role_round_trip() {
        for role in [MemberRole::Owner, MemberRole::Admin, MemberRole::Member] {
            assert_eq!(MemberRole::parse(role.as_str()), Some(role));
        }
    }

    #[test]
    fn test_capacity() {
        let mut conv = Conversation {
            id: Uuid::new_v4(),
            kind: ConversationKind::Group,
            name: Some("room".into()),
            description: None,
            is_private: false,
            max_members: 3,
            created_by: Uuid::new_v4(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(conv.has_capacity(2));
        assert!(!conv.has_capacity(3));

        conv.max_members = 0;
        assert!(conv.has_capacity(10_000));
    }

    #[test]
    fn test_page_clamp() {
        let page = Page::new(2, 500);
        assert_eq!(page.size, Page::MAX_SIZE);
        assert_eq!(page.offset(), 200);

        let page = Page::new(0, 0);
        assert_eq!(page.size, 1);
        assert_eq!(page.limit(), 1);
    }

    #[test]
    fn test_offline_presence_default() {
        let user = Uuid::new_v4();
        let presence = Presence::offline(user);
        assert_eq!(presence.status, PresenceStatus::Offline);
        assert!(presence.last_seen.is_none());
    }
}
