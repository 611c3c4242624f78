use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::MessageType;

// -- JWT Claims --

/// JWT claims shared between the REST middleware and the WebSocket upgrade
/// handlers. Tokens are minted by the external account subsystem; the engine
/// only validates them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Shared payloads --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: Uuid,
    pub username: String,
}

/// The fully resolved message shape: what room subscribers receive and what
/// the fetch endpoint returns. Media references are resolved to URLs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub sender_username: String,
    pub message_type: MessageType,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_unsent: bool,
}

/// Uniform success envelope for mutations.
#[derive(Debug, Serialize)]
pub struct Ack {
    pub success: bool,
    pub message: String,
}

impl Ack {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}

// -- Friends --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendFriendRequest {
    pub to_user: Uuid,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FriendAction {
    Accept,
    Reject,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RespondFriendRequest {
    pub action: FriendAction,
}

#[derive(Debug, Serialize)]
pub struct PendingRequestResponse {
    pub id: Uuid,
    pub from_user: UserSummary,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct FriendResponse {
    pub user: UserSummary,
    pub since: DateTime<Utc>,
}

// -- Conversations --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartConversationRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct StartConversationResponse {
    pub conversation_id: Uuid,
    pub created: bool,
}

#[derive(Debug, Serialize)]
pub struct ConversationSummary {
    pub id: Uuid,
    pub other: UserSummary,
    pub unread_count: i64,
    pub last_message: Option<MessagePayload>,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EditMessageRequest {
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct EditMessageResponse {
    pub success: bool,
    pub content: String,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct UnsendMessageResponse {
    pub success: bool,
    pub is_unsent: bool,
}
