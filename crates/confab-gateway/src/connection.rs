use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use confab_db::Database;
use confab_types::api::{MessagePayload, UserSummary};
use confab_types::events::{RoomCommand, RoomEvent, UserEvent};
use confab_types::models;

use crate::dispatcher::Dispatcher;
use crate::presence::PresenceRegistry;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle a pre-authenticated room connection. The JWT and the participant
/// check already happened at the HTTP upgrade layer, so this goes straight
/// into presence registration and the event loop.
pub async fn handle_room_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    presence: PresenceRegistry,
    db: Arc<Database>,
    user_id: Uuid,
    username: String,
    conversation_id: Uuid,
) {
    let (mut sender, mut receiver) = socket.split();

    info!(
        "{} ({}) connected to room {}",
        username, user_id, conversation_id
    );

    presence.connected(user_id);
    dispatcher.join_room(conversation_id, user_id).await;

    let mut room_rx = dispatcher.subscribe();

    // Direct frames (command rejections) back to this client only.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    let own_username = username.clone();
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = room_rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Room receiver lagged by {} events", n);
                            continue;
                        }
                        Err(_) => break,
                    };

                    if event.conversation_id() != conversation_id {
                        continue;
                    }

                    // Typing indicators go to the other subscribers only.
                    if let RoomEvent::Typing { username: u, .. }
                        | RoomEvent::StopTyping { username: u, .. } = &event
                    {
                        if *u == own_username {
                            continue;
                        }
                    }

                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            error!("Failed to encode room event: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                frame = out_rx.recv() => {
                    let Some(frame) = frame else { break };
                    if sender.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!(
                                "Heartbeat timeout (missed {} pongs), dropping connection",
                                missed_heartbeats
                            );
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let db_recv = db.clone();
    let dispatcher_recv = dispatcher.clone();
    let username_recv = username.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<RoomCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(
                            &db_recv,
                            &dispatcher_recv,
                            user_id,
                            &username_recv,
                            conversation_id,
                            cmd,
                            &out_tx,
                        )
                        .await;
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            username_recv,
                            user_id,
                            e,
                            log_preview(&text)
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    dispatcher.leave_room(conversation_id, user_id).await;
    presence.disconnected(user_id);
    info!(
        "{} ({}) disconnected from room {}",
        username, user_id, conversation_id
    );
}

/// Handle a per-user notification socket: friend requests and new-message
/// pings for conversations the user does not have open.
pub async fn handle_notification_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    user_id: Uuid,
    username: String,
) {
    let (mut sender, mut receiver) = socket.split();

    let (conn_id, mut user_rx) = dispatcher.register_user_channel(user_id).await;
    info!("{} ({}) connected to notifications", username, user_id);

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = user_rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        None => break,
                    };
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            error!("Failed to encode user event: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!(
                                "Heartbeat timeout (missed {} pongs), dropping connection",
                                missed_heartbeats
                            );
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    dispatcher.unregister_user_channel(user_id, conn_id).await;
    info!("{} ({}) disconnected from notifications", username, user_id);
}

async fn handle_command(
    db: &Arc<Database>,
    dispatcher: &Dispatcher,
    user_id: Uuid,
    username: &str,
    conversation_id: Uuid,
    cmd: RoomCommand,
    out: &mpsc::UnboundedSender<String>,
) {
    match cmd {
        RoomCommand::ChatMessage { content } => {
            let content = content.trim().to_string();
            if content.is_empty() {
                send_error(out, "Message content required");
                return;
            }

            let retention_hours = match db.get_user(user_id) {
                Ok(Some(user)) => user.retention_hours,
                Ok(None) => models::DEFAULT_RETENTION_HOURS,
                Err(e) => {
                    error!("{} ({}) retention lookup failed: {}", username, user_id, e);
                    send_error(out, "Failed to send message");
                    return;
                }
            };

            let msg =
                models::Message::new_text(conversation_id, user_id, content, retention_hours);
            if let Err(e) = db.insert_message(&msg) {
                error!("{} ({}) failed to persist message: {}", username, user_id, e);
                send_error(out, "Failed to send message");
                return;
            }

            // Write landed; everything past this point is best-effort fan-out.
            let preview = msg.content.clone().unwrap_or_default();
            dispatcher.broadcast_room(RoomEvent::ChatMessage {
                message: MessagePayload {
                    id: msg.id,
                    conversation_id,
                    sender_id: user_id,
                    sender_username: username.to_string(),
                    message_type: msg.message_type,
                    content: msg.content,
                    media_url: None,
                    timestamp: msg.created_at,
                    is_edited: false,
                    edited_at: None,
                    is_unsent: false,
                },
            });

            notify_new_message(db, dispatcher, conversation_id, user_id, username, &preview).await;
        }

        RoomCommand::EditMessage { id, content } => {
            let content = content.trim().to_string();
            if content.is_empty() {
                send_error(out, "Message content required");
                return;
            }

            match db.get_message(id) {
                Ok(Some(msg)) if msg.conversation_id == conversation_id => {
                    if !msg.can_edit(user_id, Utc::now()) {
                        send_error(out, "You cannot edit this message");
                        return;
                    }
                    let edited_at = Utc::now();
                    if let Err(e) = db.apply_edit(id, &content, edited_at) {
                        error!("{} ({}) failed to edit message: {}", username, user_id, e);
                        send_error(out, "Failed to edit message");
                        return;
                    }
                    dispatcher.broadcast_room(RoomEvent::MessageEdited {
                        conversation_id,
                        id,
                        content,
                        is_edited: true,
                        edited_at: Some(edited_at),
                    });
                }
                Ok(_) => send_error(out, "Message not found"),
                Err(e) => {
                    error!("{} ({}) message lookup failed: {}", username, user_id, e);
                    send_error(out, "Failed to edit message");
                }
            }
        }

        RoomCommand::UnsendMessage { id } => match db.get_message(id) {
            Ok(Some(msg)) if msg.conversation_id == conversation_id => {
                if !msg.can_unsend(user_id, Utc::now()) {
                    send_error(out, "You cannot unsend this message");
                    return;
                }
                if let Err(e) = db.apply_unsend(id) {
                    error!("{} ({}) failed to unsend message: {}", username, user_id, e);
                    send_error(out, "Failed to unsend message");
                    return;
                }
                dispatcher.broadcast_room(RoomEvent::MessageUnsent {
                    conversation_id,
                    id,
                    is_unsent: true,
                });
            }
            Ok(_) => send_error(out, "Message not found"),
            Err(e) => {
                error!("{} ({}) message lookup failed: {}", username, user_id, e);
                send_error(out, "Failed to unsend message");
            }
        },

        RoomCommand::MarkRead { message_id } => match db.get_message(message_id) {
            Ok(Some(msg)) if msg.conversation_id == conversation_id => {
                if let Err(e) = db.mark_read(message_id, user_id, Utc::now()) {
                    warn!("{} ({}) failed to mark read: {}", username, user_id, e);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("{} ({}) message lookup failed: {}", username, user_id, e),
        },

        RoomCommand::Typing => {
            dispatcher.broadcast_room(RoomEvent::Typing {
                conversation_id,
                username: username.to_string(),
            });
        }

        RoomCommand::StopTyping => {
            dispatcher.broadcast_room(RoomEvent::StopTyping {
                conversation_id,
                username: username.to_string(),
            });
        }
    }
}

/// If the other participant does not have the room open, ping their
/// notification topic instead. All failures here are logged and absorbed; the
/// message itself is already persisted.
pub async fn notify_new_message(
    db: &Arc<Database>,
    dispatcher: &Dispatcher,
    conversation_id: Uuid,
    sender_id: Uuid,
    sender_username: &str,
    preview: &str,
) {
    let other = match db.other_participant(conversation_id, sender_id) {
        Ok(Some(user)) => user,
        Ok(None) => return,
        Err(e) => {
            warn!(
                "Failed to resolve the other participant of {}: {}",
                conversation_id, e
            );
            return;
        }
    };

    if dispatcher.in_room(conversation_id, other.id).await {
        return;
    }

    dispatcher
        .notify_user(
            other.id,
            UserEvent::NewMessage {
                from_user: UserSummary {
                    id: sender_id,
                    username: sender_username.to_string(),
                },
                conversation_id,
                message: preview.to_string(),
            },
        )
        .await;
}

fn send_error(out: &mpsc::UnboundedSender<String>, message: &str) {
    let frame = serde_json::json!({ "type": "error", "message": message }).to_string();
    let _ = out.send(frame);
}

/// First 200 characters of an inbound frame for logging. Cuts on a char
/// boundary; a byte-indexed slice would panic on multi-byte input.
fn log_preview(text: &str) -> &str {
    match text.char_indices().nth(200) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_preview_cuts_multibyte_frames_on_a_char_boundary() {
        // 'é' is two bytes; byte 200 falls inside it.
        let frame = format!("{}é and more", "a".repeat(199));
        let preview = log_preview(&frame);
        assert_eq!(preview.chars().count(), 200);
        assert!(preview.ends_with('é'));

        let short = "{\"type\":\"typing\"}";
        assert_eq!(log_preview(short), short);

        let long_ascii = "x".repeat(500);
        assert_eq!(log_preview(&long_ascii).len(), 200);
    }
}
