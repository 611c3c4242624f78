use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Hours a message survives when the sender has not configured retention.
pub const DEFAULT_RETENTION_HOURS: i64 = 24;

/// A text message may be edited for this long after sending.
pub const EDIT_WINDOW_MINUTES: i64 = 15;

/// Any message may be unsent for this long after sending.
pub const UNSEND_WINDOW_MINUTES: i64 = 60;

/// Upper bound for uploaded media attachments.
pub const MAX_MEDIA_BYTES: usize = 10 * 1024 * 1024;

/// Default page size for message history fetches.
pub const DEFAULT_PAGE_SIZE: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    Video,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            _ => None,
        }
    }
}

/// A single message in a conversation.
///
/// Lifecycle: created, then optionally edited (text only, re-enterable) or
/// unsent. Unsent is absorbing: no further edits or unsends. Content is never
/// erased on unsend; visibility is filtered at read time instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub message_type: MessageType,
    pub content: Option<String>,
    pub media_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Materialized at send time from the sender's retention setting so the
    /// retention sweep can run an indexed range query.
    pub expires_at: DateTime<Utc>,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_unsent: bool,
}

impl Message {
    pub fn new_text(
        conversation_id: Uuid,
        sender_id: Uuid,
        content: String,
        retention_hours: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            message_type: MessageType::Text,
            content: Some(content),
            media_id: None,
            created_at: now,
            expires_at: now + Duration::hours(retention_hours),
            is_edited: false,
            edited_at: None,
            is_unsent: false,
        }
    }

    pub fn new_media(
        conversation_id: Uuid,
        sender_id: Uuid,
        message_type: MessageType,
        content: Option<String>,
        media_id: String,
        retention_hours: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            message_type,
            content,
            media_id: Some(media_id),
            created_at: now,
            expires_at: now + Duration::hours(retention_hours),
            is_edited: false,
            edited_at: None,
            is_unsent: false,
        }
    }

    /// Only the sender may edit, only text messages, never after unsend, and
    /// only within the edit window.
    pub fn can_edit(&self, actor: Uuid, now: DateTime<Utc>) -> bool {
        actor == self.sender_id
            && !self.is_unsent
            && self.message_type == MessageType::Text
            && now <= self.created_at + Duration::minutes(EDIT_WINDOW_MINUTES)
    }

    /// Only the sender may unsend, never twice, and only within the unsend
    /// window. Applies to all message types.
    pub fn can_unsend(&self, actor: Uuid, now: DateTime<Utc>) -> bool {
        actor == self.sender_id
            && !self.is_unsent
            && now <= self.created_at + Duration::minutes(UNSEND_WINDOW_MINUTES)
    }

    /// An unsent message stays visible to its sender only.
    pub fn visible_to(&self, viewer: Uuid) -> bool {
        !self.is_unsent || viewer == self.sender_id
    }

    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FriendStatus {
    Pending,
    Accepted,
}

impl FriendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "accepted" => Some(Self::Accepted),
            _ => None,
        }
    }
}

/// A friend request between an ordered pair of users. At most one record may
/// exist per unordered pair, across both orderings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendRequest {
    pub id: Uuid,
    pub from_user: Uuid,
    pub to_user: Uuid,
    pub status: FriendStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FriendRequest {
    pub fn involves(&self, user: Uuid) -> bool {
        self.from_user == user || self.to_user == user
    }

    pub fn other(&self, user: Uuid) -> Uuid {
        if self.from_user == user {
            self.to_user
        } else {
            self.from_user
        }
    }
}

/// Identity is minted by the external account subsystem; rows here carry only
/// what the engine needs: retention settings and presence truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub retention_hours: i64,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_message(sender: Uuid) -> Message {
        Message::new_text(Uuid::new_v4(), sender, "hello".into(), 24)
    }

    #[test]
    fn edit_allowed_within_window() {
        let sender = Uuid::new_v4();
        let msg = text_message(sender);
        let now = msg.created_at + Duration::minutes(5);
        assert!(msg.can_edit(sender, now));
    }

    #[test]
    fn edit_denied_for_non_sender() {
        let msg = text_message(Uuid::new_v4());
        let now = msg.created_at + Duration::minutes(1);
        assert!(!msg.can_edit(Uuid::new_v4(), now));
    }

    #[test]
    fn edit_denied_after_window() {
        let sender = Uuid::new_v4();
        let msg = text_message(sender);
        let now = msg.created_at + Duration::minutes(16);
        assert!(!msg.can_edit(sender, now));
    }

    #[test]
    fn edit_denied_for_media() {
        let sender = Uuid::new_v4();
        let msg = Message::new_media(
            Uuid::new_v4(),
            sender,
            MessageType::Image,
            None,
            "blob".into(),
            24,
        );
        let now = msg.created_at + Duration::minutes(1);
        assert!(!msg.can_edit(sender, now));
        // But unsend still applies to media.
        assert!(msg.can_unsend(sender, now));
    }

    #[test]
    fn edit_denied_after_unsend() {
        let sender = Uuid::new_v4();
        let mut msg = text_message(sender);
        msg.is_unsent = true;
        let now = msg.created_at + Duration::minutes(1);
        assert!(!msg.can_edit(sender, now));
        assert!(!msg.can_unsend(sender, now));
    }

    #[test]
    fn unsend_allowed_within_hour() {
        let sender = Uuid::new_v4();
        let msg = text_message(sender);
        assert!(msg.can_unsend(sender, msg.created_at + Duration::minutes(59)));
        assert!(!msg.can_unsend(sender, msg.created_at + Duration::minutes(61)));
    }

    #[test]
    fn unsent_hidden_from_others_only() {
        let sender = Uuid::new_v4();
        let viewer = Uuid::new_v4();
        let mut msg = text_message(sender);
        assert!(msg.visible_to(viewer));
        msg.is_unsent = true;
        assert!(!msg.visible_to(viewer));
        assert!(msg.visible_to(sender));
    }

    #[test]
    fn expiry_follows_retention_hours() {
        let msg = text_message(Uuid::new_v4());
        assert!(!msg.expired(msg.created_at + Duration::hours(12)));
        assert!(msg.expired(msg.created_at + Duration::hours(25)));
    }
}
