use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use confab_gateway::connection::notify_new_message;
use confab_storage::BlobStore;
use confab_types::api::{Claims, EditMessageResponse, MessagePayload, UnsendMessageResponse};
use confab_types::error::ChatError;
use confab_types::events::RoomEvent;
use confab_types::models::{
    Message, MessageType, DEFAULT_PAGE_SIZE, EDIT_WINDOW_MINUTES, MAX_MEDIA_BYTES,
    UNSEND_WINDOW_MINUTES,
};

use crate::error::{join_error, ApiError};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Fetch messages strictly after this timestamp (ascending).
    pub after: Option<DateTime<Utc>>,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    DEFAULT_PAGE_SIZE
}

/// Resolve a stored message into the wire payload, turning the opaque blob id
/// into a servable URL.
pub(crate) fn resolve_payload(
    msg: Message,
    sender_username: String,
    store: &BlobStore,
) -> MessagePayload {
    let media_url = msg.media_id.as_deref().map(|id| store.url_for(id));
    MessagePayload {
        id: msg.id,
        conversation_id: msg.conversation_id,
        sender_id: msg.sender_id,
        sender_username,
        message_type: msg.message_type,
        content: msg.content,
        media_url,
        timestamp: msg.created_at,
        is_edited: msg.is_edited,
        edited_at: msg.edited_at,
        is_unsent: msg.is_unsent,
    }
}

/// MIME gate for uploads: image/* and video/* only, capped at 10 MiB.
fn validate_media(content_type: &str, size: usize) -> Result<MessageType, ChatError> {
    if size == 0 {
        return Err(ChatError::Validation("empty media upload".into()));
    }
    if size > MAX_MEDIA_BYTES {
        return Err(ChatError::Validation(
            "media exceeds the 10 MiB limit".into(),
        ));
    }
    if content_type.starts_with("image/") {
        Ok(MessageType::Image)
    } else if content_type.starts_with("video/") {
        Ok(MessageType::Video)
    } else {
        Err(ChatError::Validation(format!(
            "unsupported media type: {}",
            content_type
        )))
    }
}

/// GET /conversations/{id}/messages — ascending history, participants only.
/// Unsent messages are filtered out for everyone except their sender.
pub async fn get_messages(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let store = state.store.clone();
    let me = claims.sub;
    let my_username = claims.username.clone();
    let limit = query.limit.min(200);
    let after = query.after;

    let payloads = tokio::task::spawn_blocking(move || {
        if !db.is_participant(conversation_id, me)? {
            return Err(ChatError::Permission(
                "you are not part of this conversation".into(),
            ));
        }
        let other_username = db
            .other_participant(conversation_id, me)?
            .map(|u| u.username)
            .unwrap_or_default();

        let payloads = db
            .messages_since(conversation_id, me, after, limit)?
            .into_iter()
            .map(|msg| {
                let sender_username = if msg.sender_id == me {
                    my_username.clone()
                } else {
                    other_username.clone()
                };
                resolve_payload(msg, sender_username, &store)
            })
            .collect::<Vec<_>>();
        Ok(payloads)
    })
    .await
    .map_err(join_error)??;

    Ok(Json(payloads))
}

/// POST /conversations/{id}/messages — multipart send.
///
/// Fields: `content` (text) and/or `media` (file). A message must carry at
/// least one; media uploads may carry a text caption alongside.
pub async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let mut content: Option<String> = None;
    let mut media: Option<(String, String, axum::body::Bytes)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ChatError::Validation(format!("malformed multipart body: {e}")))?
    {
        match field.name() {
            Some("content") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ChatError::Validation(format!("unreadable content field: {e}")))?;
                content = Some(text);
            }
            // Clients send the attachment as `media`; `image` and `video`
            // are accepted as aliases. The MIME type decides the kind.
            Some("media") | Some("image") | Some("video") => {
                let file_name = field.file_name().unwrap_or("upload").to_string();
                let content_type = field
                    .content_type()
                    .ok_or_else(|| {
                        ChatError::Validation("media field is missing a content type".into())
                    })?
                    .to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ChatError::Validation(format!("unreadable media field: {e}")))?;
                media = Some((file_name, content_type, data));
            }
            _ => {}
        }
    }

    let content = content
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty());

    if content.is_none() && media.is_none() {
        return Err(ChatError::Validation("message requires content or media".into()).into());
    }

    // Participant gate and retention lookup before anything touches disk.
    let db = state.db.clone();
    let me = claims.sub;
    let retention_hours = tokio::task::spawn_blocking(move || {
        if !db.is_participant(conversation_id, me)? {
            return Err(ChatError::Permission(
                "you are not part of this conversation".into(),
            ));
        }
        let retention = db
            .get_user(me)?
            .map(|u| u.retention_hours)
            .unwrap_or(confab_types::models::DEFAULT_RETENTION_HOURS);
        Ok(retention)
    })
    .await
    .map_err(join_error)??;

    let msg = match media {
        Some((file_name, content_type, data)) => {
            let message_type = validate_media(&content_type, data.len())?;
            let blob_id = state
                .store
                .put(&file_name, &data)
                .await
                .map_err(ChatError::Storage)?;
            Message::new_media(
                conversation_id,
                me,
                message_type,
                content,
                blob_id,
                retention_hours,
            )
        }
        None => {
            // Checked above: media is None implies content is Some.
            let text = content.ok_or_else(|| {
                ChatError::Validation("message requires content or media".into())
            })?;
            Message::new_text(conversation_id, me, text, retention_hours)
        }
    };

    let db = state.db.clone();
    let to_insert = msg.clone();
    let inserted = tokio::task::spawn_blocking(move || db.insert_message(&to_insert))
        .await
        .map_err(join_error)?;
    if let Err(e) = inserted {
        // Roll the blob back so a failed insert does not strand bytes on disk.
        if let Some(media_id) = &msg.media_id {
            if let Err(del) = state.store.delete(media_id).await {
                warn!("Failed to clean up blob {} after insert error: {:#}", media_id, del);
            }
        }
        return Err(ChatError::Storage(e).into());
    }

    // Persisted; fan-out from here on is best-effort.
    let payload = resolve_payload(msg, claims.username.clone(), &state.store);
    let preview = payload
        .content
        .clone()
        .unwrap_or_else(|| format!("sent you a {}", payload.message_type.as_str()));
    state.dispatcher.broadcast_room(RoomEvent::ChatMessage {
        message: payload.clone(),
    });
    notify_new_message(
        &state.db,
        &state.dispatcher,
        conversation_id,
        claims.sub,
        &claims.username,
        &preview,
    )
    .await;

    Ok((StatusCode::CREATED, Json(payload)))
}

/// POST /messages/{id}/edit — sender-only, text-only, 15 minute window.
///
/// Concurrent edits race as last-write-wins; both pass the guard, both
/// persist, and the later write is the surviving content.
pub async fn edit_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(message_id): Path<Uuid>,
    Json(req): Json<confab_types::api::EditMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let content = req.content.trim().to_string();
    if content.is_empty() {
        return Err(ChatError::Validation("message content required".into()).into());
    }

    let db = state.db.clone();
    let me = claims.sub;
    let new_content = content.clone();
    let (conversation_id, edited_at) = tokio::task::spawn_blocking(move || {
        let msg = db
            .get_message(message_id)?
            .ok_or(ChatError::NotFound("message"))?;

        if msg.sender_id != me {
            return Err(ChatError::Permission(
                "only the sender can edit a message".into(),
            ));
        }
        if msg.is_unsent {
            return Err(ChatError::InvalidState("message has been unsent".into()));
        }
        if msg.message_type != MessageType::Text {
            return Err(ChatError::InvalidState(
                "only text messages can be edited".into(),
            ));
        }
        let now = Utc::now();
        if now > msg.created_at + Duration::minutes(EDIT_WINDOW_MINUTES) {
            return Err(ChatError::InvalidState("edit window has closed".into()));
        }

        db.apply_edit(message_id, &new_content, now)?;
        Ok((msg.conversation_id, now))
    })
    .await
    .map_err(join_error)??;

    state.dispatcher.broadcast_room(RoomEvent::MessageEdited {
        conversation_id,
        id: message_id,
        content: content.clone(),
        is_edited: true,
        edited_at: Some(edited_at),
    });

    Ok(Json(EditMessageResponse {
        success: true,
        content,
        is_edited: true,
        edited_at: Some(edited_at),
    }))
}

/// POST /messages/{id}/unsend — sender-only, one hour window, any type.
/// Unsent is absorbing: content stays stored but is hidden from the other
/// participant from this point on.
pub async fn unsend_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(message_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let me = claims.sub;
    let conversation_id = tokio::task::spawn_blocking(move || {
        let msg = db
            .get_message(message_id)?
            .ok_or(ChatError::NotFound("message"))?;

        if msg.sender_id != me {
            return Err(ChatError::Permission(
                "only the sender can unsend a message".into(),
            ));
        }
        if msg.is_unsent {
            return Err(ChatError::InvalidState("message is already unsent".into()));
        }
        if Utc::now() > msg.created_at + Duration::minutes(UNSEND_WINDOW_MINUTES) {
            return Err(ChatError::InvalidState("unsend window has closed".into()));
        }

        db.apply_unsend(message_id)?;
        Ok(msg.conversation_id)
    })
    .await
    .map_err(join_error)??;

    state.dispatcher.broadcast_room(RoomEvent::MessageUnsent {
        conversation_id,
        id: message_id,
        is_unsent: true,
    });

    Ok(Json(UnsendMessageResponse {
        success: true,
        is_unsent: true,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use confab_db::Database;
    use confab_gateway::dispatcher::Dispatcher;
    use confab_gateway::presence::PresenceRegistry;
    use confab_types::api::EditMessageRequest;

    use crate::state::AppStateInner;

    async fn test_state() -> AppState {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let dir = std::env::temp_dir().join(format!("confab-api-{}", Uuid::new_v4()));
        let store = Arc::new(BlobStore::new(dir).await.unwrap());
        let presence = PresenceRegistry::new(db.clone());
        Arc::new(AppStateInner {
            db,
            store,
            dispatcher: Dispatcher::new(),
            presence,
            jwt_secret: "sekrit".into(),
        })
    }

    fn claims(id: Uuid, name: &str) -> Claims {
        Claims {
            sub: id,
            username: name.into(),
            exp: usize::MAX,
        }
    }

    #[tokio::test]
    async fn media_messages_cannot_be_edited() {
        let state = test_state().await;
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        state.db.ensure_user(a, "ava").unwrap();
        state.db.ensure_user(b, "ben").unwrap();
        let conv = state.db.create_conversation(a, b, Utc::now()).unwrap();

        let msg = Message::new_media(conv, a, MessageType::Image, None, "blob.jpg".into(), 24);
        state.db.insert_message(&msg).unwrap();

        // The edit window is still open; the type is what blocks it.
        let err = edit_message(
            State(state.clone()),
            Extension(claims(a, "ava")),
            Path(msg.id),
            Json(EditMessageRequest {
                content: "new caption".into(),
            }),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err.0, ChatError::InvalidState(_)));

        let stored = state.db.get_message(msg.id).unwrap().unwrap();
        assert!(!stored.is_edited);
    }

    #[test]
    fn oversized_media_is_rejected() {
        let err = validate_media("image/jpeg", 11 * 1024 * 1024).unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }

    #[test]
    fn media_types_map_by_mime_prefix() {
        assert_eq!(
            validate_media("image/jpeg", 1024 * 1024).unwrap(),
            MessageType::Image
        );
        assert_eq!(
            validate_media("video/mp4", 1024 * 1024).unwrap(),
            MessageType::Video
        );
        assert!(matches!(
            validate_media("application/pdf", 1024).unwrap_err(),
            ChatError::Validation(_)
        ));
    }

    #[test]
    fn boundary_sizes() {
        assert!(validate_media("image/png", MAX_MEDIA_BYTES).is_ok());
        assert!(validate_media("image/png", MAX_MEDIA_BYTES + 1).is_err());
        assert!(validate_media("image/png", 0).is_err());
    }

    #[test]
    fn history_limit_defaults_to_page_size() {
        assert_eq!(default_limit(), 50);
    }
}
