use anyhow::{anyhow, Result};

use confab_types::models::{FriendRequest, FriendStatus, Message, MessageType, User};

use crate::parse_ts;

/// Raw row shapes as they come out of SQLite. Conversion into the typed
/// domain structs happens outside the rusqlite row closures so parse errors
/// surface as real errors instead of panics.
#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: String,
    pub username: String,
    pub retention_hours: i64,
    pub online: i64,
    pub last_seen: Option<String>,
}

impl UserRow {
    pub fn into_user(self) -> Result<User> {
        Ok(User {
            id: self.id.parse()?,
            username: self.username,
            retention_hours: self.retention_hours,
            online: self.online != 0,
            last_seen: self.last_seen.as_deref().map(parse_ts).transpose()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct FriendRequestRow {
    pub id: String,
    pub from_user: String,
    pub to_user: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

impl FriendRequestRow {
    pub fn into_request(self) -> Result<FriendRequest> {
        Ok(FriendRequest {
            id: self.id.parse()?,
            from_user: self.from_user.parse()?,
            to_user: self.to_user.parse()?,
            status: FriendStatus::parse(&self.status)
                .ok_or_else(|| anyhow!("bad friend request status '{}'", self.status))?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub message_type: String,
    pub content: Option<String>,
    pub media_id: Option<String>,
    pub created_at: String,
    pub expires_at: String,
    pub is_edited: i64,
    pub edited_at: Option<String>,
    pub is_unsent: i64,
}

impl MessageRow {
    pub fn into_message(self) -> Result<Message> {
        Ok(Message {
            id: self.id.parse()?,
            conversation_id: self.conversation_id.parse()?,
            sender_id: self.sender_id.parse()?,
            message_type: MessageType::parse(&self.message_type)
                .ok_or_else(|| anyhow!("bad message type '{}'", self.message_type))?,
            content: self.content,
            media_id: self.media_id,
            created_at: parse_ts(&self.created_at)?,
            expires_at: parse_ts(&self.expires_at)?,
            is_edited: self.is_edited != 0,
            edited_at: self.edited_at.as_deref().map(parse_ts).transpose()?,
            is_unsent: self.is_unsent != 0,
        })
    }
}

/// Minimal handle for sweep and cleanup passes: just enough to delete the
/// row and its blob.
#[derive(Debug, Clone)]
pub struct MessageHandle {
    pub id: String,
    pub media_id: Option<String>,
}
