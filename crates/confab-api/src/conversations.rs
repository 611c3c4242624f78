use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use confab_types::api::{
    Ack, Claims, ConversationSummary, StartConversationRequest, StartConversationResponse,
    UserSummary,
};
use confab_types::error::ChatError;

use crate::error::{join_error, ApiError};
use crate::messages::resolve_payload;
use crate::state::AppState;

/// POST /conversations — open (or find) the room for a friend pair.
///
/// Friendship is the gate: no accepted friendship, no room. The lookup is
/// idempotent, so clicking "message" twice never creates a second room.
pub async fn start_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<StartConversationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.user_id == claims.sub {
        return Err(ChatError::Validation("cannot message yourself".into()).into());
    }

    let db = state.db.clone();
    let me = claims.sub;
    let other = req.user_id;
    let response = tokio::task::spawn_blocking(move || {
        if db.find_accepted_between(me, other)?.is_none() {
            return Err(ChatError::Permission(
                "you can only message your friends".into(),
            ));
        }

        if let Some(existing) = db.find_conversation_between(me, other)? {
            return Ok(StartConversationResponse {
                conversation_id: existing,
                created: false,
            });
        }

        let conversation_id = db.create_conversation(me, other, Utc::now())?;
        Ok(StartConversationResponse {
            conversation_id,
            created: true,
        })
    })
    .await
    .map_err(join_error)??;

    let status = if response.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(response)))
}

/// GET /conversations — the dashboard list: every room with the other user,
/// the unread count, and a preview of the latest visible message.
pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let store = state.store.clone();
    let me = claims.sub;
    let my_username = claims.username.clone();
    let summaries = tokio::task::spawn_blocking(move || {
        let mut out = Vec::new();
        for conversation in db.conversations_for(me)? {
            let Some(other) = db.other_participant(conversation, me)? else {
                warn!("Conversation {} has no other participant", conversation);
                continue;
            };
            let unread_count = db.unread_count(conversation, me)?;
            let last_message = db
                .last_visible_message(conversation, me)?
                .map(|msg| {
                    let sender_username = if msg.sender_id == me {
                        my_username.clone()
                    } else {
                        other.username.clone()
                    };
                    resolve_payload(msg, sender_username, &store)
                });
            out.push(ConversationSummary {
                id: conversation,
                other: UserSummary {
                    id: other.id,
                    username: other.username,
                },
                unread_count,
                last_message,
            });
        }
        Ok::<_, ChatError>(out)
    })
    .await
    .map_err(join_error)??;

    Ok(Json(summaries))
}

/// POST /conversations/{id}/read — mark everything in the room read for the
/// caller. Used when a room is opened, so the unread badge resets.
pub async fn mark_read(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let me = claims.sub;
    let marked = tokio::task::spawn_blocking(move || {
        if !db.is_participant(conversation_id, me)? {
            return Err(ChatError::Permission(
                "you are not part of this conversation".into(),
            ));
        }
        let marked = db.mark_conversation_read(conversation_id, me, Utc::now())?;
        Ok(marked)
    })
    .await
    .map_err(join_error)??;

    Ok(Json(Ack::ok(format!("{} messages marked read", marked))))
}
