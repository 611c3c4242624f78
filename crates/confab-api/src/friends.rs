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
    Ack, Claims, FriendAction, FriendResponse, PendingRequestResponse, RespondFriendRequest,
    SendFriendRequest, UserSummary,
};
use confab_types::error::ChatError;
use confab_types::events::UserEvent;
use confab_types::models::{FriendRequest, FriendStatus};

use crate::error::{join_error, ApiError};
use crate::state::AppState;

/// POST /friends/requests — send a friend request.
///
/// At most one record may exist per unordered pair, in any state. The unique
/// pair index backs this up against races; the pre-check gives the caller a
/// precise error instead of a constraint violation.
pub async fn send_request(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendFriendRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.to_user == claims.sub {
        return Err(ChatError::Validation("cannot befriend yourself".into()).into());
    }

    let db = state.db.clone();
    let from = claims.sub;
    let to = req.to_user;
    tokio::task::spawn_blocking(move || {
        if db.get_user(to)?.is_none() {
            return Err(ChatError::NotFound("user"));
        }
        match db.find_request_between(from, to)? {
            Some(existing) if existing.status == FriendStatus::Accepted => {
                Err(ChatError::InvalidState("already friends".into()))
            }
            Some(_) => Err(ChatError::InvalidState(
                "a friend request between you already exists".into(),
            )),
            None => {
                let now = Utc::now();
                let request = FriendRequest {
                    id: Uuid::new_v4(),
                    from_user: from,
                    to_user: to,
                    status: FriendStatus::Pending,
                    created_at: now,
                    updated_at: now,
                };
                if let Err(e) = db.create_friend_request(&request) {
                    // Lost the race against an opposite-direction request:
                    // the symmetric pair index rejected the insert.
                    if confab_db::is_constraint_violation(&e) {
                        return Err(ChatError::InvalidState(
                            "a friend request between you already exists".into(),
                        ));
                    }
                    return Err(e.into());
                }
                Ok(())
            }
        }
    })
    .await
    .map_err(join_error)??;

    // Best-effort nudge; the request row is already durable.
    state
        .dispatcher
        .notify_user(
            req.to_user,
            UserEvent::FriendRequest {
                from_user: UserSummary {
                    id: claims.sub,
                    username: claims.username.clone(),
                },
                message: format!("{} sent you a friend request", claims.username),
            },
        )
        .await;

    Ok((StatusCode::CREATED, Json(Ack::ok("friend request sent"))))
}

/// POST /friends/requests/{id}/respond — accept or reject.
///
/// Only the recipient may respond, and only while the request is pending.
/// Accepting also opens the pair's conversation if it does not exist yet.
pub async fn respond_request(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(request_id): Path<Uuid>,
    Json(req): Json<RespondFriendRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let me = claims.sub;
    let ack = tokio::task::spawn_blocking(move || {
        let request = db
            .get_friend_request(request_id)?
            .ok_or(ChatError::NotFound("friend request"))?;

        if request.to_user != me {
            return Err(ChatError::Permission(
                "only the recipient can respond to a friend request".into(),
            ));
        }
        if request.status != FriendStatus::Pending {
            return Err(ChatError::InvalidState(
                "friend request has already been resolved".into(),
            ));
        }

        match req.action {
            FriendAction::Accept => {
                // Status flip and room creation commit together.
                db.accept_friend_request(&request, Utc::now())?;
                Ok(Ack::ok("friend request accepted"))
            }
            FriendAction::Reject => {
                db.delete_friend_request(request_id)?;
                Ok(Ack::ok("friend request rejected"))
            }
        }
    })
    .await
    .map_err(join_error)??;

    Ok(Json(ack))
}

/// DELETE /friends/requests/{user_id} — cancel an own outgoing request.
pub async fn cancel_request(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(user_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let me = claims.sub;
    tokio::task::spawn_blocking(move || {
        let request = db
            .find_pending_from(me, user_id)?
            .ok_or(ChatError::NotFound("friend request"))?;
        db.delete_friend_request(request.id)?;
        Ok::<_, ChatError>(())
    })
    .await
    .map_err(join_error)??;

    Ok(Json(Ack::ok("friend request cancelled")))
}

/// DELETE /friends/{user_id} — unfriend, with full cascade.
///
/// The cascade is best-effort: each conversation and message is torn down
/// independently, failures are logged, and the friendship row is removed at
/// the end regardless. A partial cascade leaves orphans for the daily sweep,
/// never a half-broken friendship.
pub async fn unfriend(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(user_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let me = claims.sub;

    // Phase 1: validate and take stock of the conversation tree.
    let (request_id, conversations, handles) = tokio::task::spawn_blocking(move || {
        let request = db
            .find_accepted_between(me, user_id)?
            .ok_or(ChatError::NotFound("friendship"))?;

        let conversations = db.conversations_between(me, user_id)?;
        let mut handles = Vec::new();
        for conversation in &conversations {
            handles.extend(db.messages_in_conversation(*conversation)?);
        }
        Ok::<_, ChatError>((request.id, conversations, handles))
    })
    .await
    .map_err(join_error)??;

    // Phase 2: blobs before rows; a blob may already be gone, and a failed
    // delete only strands disk space for later manual cleanup.
    for handle in &handles {
        if let Some(media_id) = &handle.media_id {
            if let Err(e) = state.store.delete(media_id).await {
                warn!("Unfriend: failed to delete blob {}: {:#}", media_id, e);
            }
        }
    }

    // Phase 3: messages, then conversations, then the friendship row.
    // Per-item failures are logged; the friendship delete is unconditional
    // so an accepted record never outlives its half-deleted tree.
    let db = state.db.clone();
    tokio::task::spawn_blocking(move || {
        for handle in &handles {
            if let Err(e) = db.delete_message(&handle.id) {
                warn!("Unfriend: failed to delete message {}: {:#}", handle.id, e);
            }
        }
        for conversation in &conversations {
            if let Err(e) = db.delete_conversation(*conversation) {
                warn!(
                    "Unfriend: failed to delete conversation {}: {:#}",
                    conversation, e
                );
            }
        }
        db.delete_friend_request(request_id)?;
        Ok::<_, ChatError>(())
    })
    .await
    .map_err(join_error)??;

    Ok(Json(Ack::ok("unfriended")))
}

/// GET /friends — accepted friendships, with the other user resolved.
pub async fn list_friends(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let me = claims.sub;
    let friends = tokio::task::spawn_blocking(move || {
        let mut out = Vec::new();
        for request in db.list_accepted(me)? {
            let other_id = request.other(me);
            let Some(user) = db.get_user(other_id)? else {
                warn!("Friendship {} references unknown user {}", request.id, other_id);
                continue;
            };
            out.push(FriendResponse {
                user: UserSummary {
                    id: user.id,
                    username: user.username,
                },
                since: request.updated_at,
            });
        }
        Ok::<_, ChatError>(out)
    })
    .await
    .map_err(join_error)??;

    Ok(Json(friends))
}

/// GET /friends/requests — incoming pending requests.
pub async fn list_pending(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let me = claims.sub;
    let pending = tokio::task::spawn_blocking(move || {
        let mut out = Vec::new();
        for request in db.list_incoming_pending(me)? {
            let Some(user) = db.get_user(request.from_user)? else {
                warn!(
                    "Request {} references unknown sender {}",
                    request.id, request.from_user
                );
                continue;
            };
            out.push(PendingRequestResponse {
                id: request.id,
                from_user: UserSummary {
                    id: user.id,
                    username: user.username,
                },
                created_at: request.created_at,
            });
        }
        Ok::<_, ChatError>(out)
    })
    .await
    .map_err(join_error)??;

    Ok(Json(pending))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use confab_db::Database;
    use confab_gateway::dispatcher::Dispatcher;
    use confab_gateway::presence::PresenceRegistry;
    use confab_storage::BlobStore;

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

    fn pending_request(state: &AppState, from: Uuid, to: Uuid) -> FriendRequest {
        let now = Utc::now();
        let request = FriendRequest {
            id: Uuid::new_v4(),
            from_user: from,
            to_user: to,
            status: FriendStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        state.db.create_friend_request(&request).unwrap();
        request
    }

    #[tokio::test]
    async fn only_the_recipient_may_respond() {
        let state = test_state().await;
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        state.db.ensure_user(a, "ava").unwrap();
        state.db.ensure_user(b, "ben").unwrap();
        let request = pending_request(&state, a, b);

        // The sender accepting their own request is refused.
        let err = respond_request(
            State(state.clone()),
            Extension(claims(a, "ava")),
            Path(request.id),
            Json(RespondFriendRequest {
                action: FriendAction::Accept,
            }),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err.0, ChatError::Permission(_)));

        // The request is untouched.
        let stored = state.db.get_friend_request(request.id).unwrap().unwrap();
        assert_eq!(stored.status, FriendStatus::Pending);
    }

    #[tokio::test]
    async fn resolved_requests_cannot_be_responded_to_again() {
        let state = test_state().await;
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        state.db.ensure_user(a, "ava").unwrap();
        state.db.ensure_user(b, "ben").unwrap();
        let request = pending_request(&state, a, b);

        let accepted = respond_request(
            State(state.clone()),
            Extension(claims(b, "ben")),
            Path(request.id),
            Json(RespondFriendRequest {
                action: FriendAction::Accept,
            }),
        )
        .await;
        assert!(accepted.is_ok());

        // The room opened alongside the status flip.
        assert!(state.db.find_conversation_between(a, b).unwrap().is_some());

        // A second response, either action, is a state error.
        let err = respond_request(
            State(state.clone()),
            Extension(claims(b, "ben")),
            Path(request.id),
            Json(RespondFriendRequest {
                action: FriendAction::Reject,
            }),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err.0, ChatError::InvalidState(_)));
    }
}
