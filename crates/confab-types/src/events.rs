use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::{MessagePayload, UserSummary};

/// Commands sent FROM client TO server over a room socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomCommand {
    /// Send a text message to the room's conversation
    ChatMessage { content: String },

    /// Edit an own text message within the edit window
    EditMessage { id: Uuid, content: String },

    /// Retract an own message within the unsend window
    UnsendMessage { id: Uuid },

    /// Acknowledge a message as read
    MarkRead { message_id: Uuid },

    /// Ephemeral typing indicator, never persisted
    Typing,
    StopTyping,
}

/// Events fanned out to room subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomEvent {
    /// A message was persisted; carries the fully resolved payload
    ChatMessage { message: MessagePayload },

    /// A message's content changed
    MessageEdited {
        conversation_id: Uuid,
        id: Uuid,
        content: String,
        is_edited: bool,
        edited_at: Option<DateTime<Utc>>,
    },

    /// A message was retracted by its sender
    MessageUnsent {
        conversation_id: Uuid,
        id: Uuid,
        is_unsent: bool,
    },

    /// A participant started or stopped typing
    Typing {
        conversation_id: Uuid,
        username: String,
    },
    StopTyping {
        conversation_id: Uuid,
        username: String,
    },
}

impl RoomEvent {
    /// The conversation this event is scoped to. Connections drop events for
    /// rooms other than their own.
    pub fn conversation_id(&self) -> Uuid {
        match self {
            Self::ChatMessage { message } => message.conversation_id,
            Self::MessageEdited {
                conversation_id, ..
            } => *conversation_id,
            Self::MessageUnsent {
                conversation_id, ..
            } => *conversation_id,
            Self::Typing {
                conversation_id, ..
            } => *conversation_id,
            Self::StopTyping {
                conversation_id, ..
            } => *conversation_id,
        }
    }
}

/// Out-of-room events delivered on a user's notification topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserEvent {
    /// Someone sent this user a friend request
    FriendRequest {
        from_user: UserSummary,
        message: String,
    },

    /// A message arrived in a conversation this user is not currently in
    NewMessage {
        from_user: UserSummary,
        conversation_id: Uuid,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageType;

    #[test]
    fn commands_parse_from_wire_shape() {
        let cmd: RoomCommand =
            serde_json::from_str(r#"{"type":"chat_message","content":"hi"}"#).unwrap();
        assert!(matches!(cmd, RoomCommand::ChatMessage { content } if content == "hi"));

        let cmd: RoomCommand = serde_json::from_str(r#"{"type":"typing"}"#).unwrap();
        assert!(matches!(cmd, RoomCommand::Typing));

        let id = Uuid::new_v4();
        let raw = format!(r#"{{"type":"mark_read","message_id":"{id}"}}"#);
        let cmd: RoomCommand = serde_json::from_str(&raw).unwrap();
        assert!(matches!(cmd, RoomCommand::MarkRead { message_id } if message_id == id));
    }

    #[test]
    fn events_serialize_with_snake_case_tags() {
        let conversation_id = Uuid::new_v4();
        let ev = RoomEvent::MessageUnsent {
            conversation_id,
            id: Uuid::new_v4(),
            is_unsent: true,
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains(r#""type":"message_unsent""#));
        assert!(json.contains(r#""is_unsent":true"#));
        assert_eq!(ev.conversation_id(), conversation_id);
    }

    #[test]
    fn chat_message_event_is_scoped_to_its_conversation() {
        let conversation_id = Uuid::new_v4();
        let ev = RoomEvent::ChatMessage {
            message: MessagePayload {
                id: Uuid::new_v4(),
                conversation_id,
                sender_id: Uuid::new_v4(),
                sender_username: "ava".into(),
                message_type: MessageType::Text,
                content: Some("hello".into()),
                media_url: None,
                timestamp: Utc::now(),
                is_edited: false,
                edited_at: None,
                is_unsent: false,
            },
        };
        assert_eq!(ev.conversation_id(), conversation_id);
    }
}
