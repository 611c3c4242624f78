use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, RwLock};
use uuid::Uuid;

use confab_types::events::{RoomEvent, UserEvent};

/// Routes real-time events to connected clients.
///
/// Room events go over one broadcast topic; each connection filters by its
/// own conversation id. User events go over targeted per-user channels that
/// exist for as long as a notification socket is open.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Broadcast topic for room events; receivers filter by conversation.
    room_tx: broadcast::Sender<RoomEvent>,

    /// Per-user notification channels: user_id -> (conn_id, sender)
    user_channels: RwLock<HashMap<Uuid, (Uuid, mpsc::UnboundedSender<UserEvent>)>>,

    /// Who is currently connected to which room: conversation_id -> users
    room_members: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (room_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                room_tx,
                user_channels: RwLock::new(HashMap::new()),
                room_members: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to the room event topic.
    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.inner.room_tx.subscribe()
    }

    /// Fan a room event out to all subscribers. Delivery is best-effort:
    /// a topic with no listeners is not an error.
    pub fn broadcast_room(&self, event: RoomEvent) {
        let _ = self.inner.room_tx.send(event);
    }

    /// Register a per-user notification channel. Returns (conn_id, receiver).
    /// A newer registration supersedes an older one for the same user.
    pub async fn register_user_channel(
        &self,
        user_id: Uuid,
    ) -> (Uuid, mpsc::UnboundedReceiver<UserEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .user_channels
            .write()
            .await
            .insert(user_id, (conn_id, tx));
        (conn_id, rx)
    }

    /// Unregister a per-user channel, but only if conn_id still owns it.
    pub async fn unregister_user_channel(&self, user_id: Uuid, conn_id: Uuid) {
        let mut channels = self.inner.user_channels.write().await;
        if let Some((stored_conn_id, _)) = channels.get(&user_id) {
            if *stored_conn_id == conn_id {
                channels.remove(&user_id);
            }
        }
    }

    /// Deliver a targeted event to one user's notification topic.
    pub async fn notify_user(&self, user_id: Uuid, event: UserEvent) {
        let channels = self.inner.user_channels.read().await;
        if let Some((_, tx)) = channels.get(&user_id) {
            let _ = tx.send(event);
        }
    }

    pub async fn join_room(&self, conversation_id: Uuid, user_id: Uuid) {
        self.inner
            .room_members
            .write()
            .await
            .entry(conversation_id)
            .or_default()
            .insert(user_id);
    }

    pub async fn leave_room(&self, conversation_id: Uuid, user_id: Uuid) {
        let mut rooms = self.inner.room_members.write().await;
        if let Some(members) = rooms.get_mut(&conversation_id) {
            members.remove(&user_id);
            if members.is_empty() {
                rooms.remove(&conversation_id);
            }
        }
    }

    /// Whether a user currently has the room open. Used to decide between
    /// in-room fan-out and the out-of-room new-message notification.
    pub async fn in_room(&self, conversation_id: Uuid, user_id: Uuid) -> bool {
        self.inner
            .room_members
            .read()
            .await
            .get(&conversation_id)
            .map_or(false, |members| members.contains(&user_id))
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confab_types::api::UserSummary;

    #[tokio::test]
    async fn room_membership_tracks_joins_and_leaves() {
        let dispatcher = Dispatcher::new();
        let conv = Uuid::new_v4();
        let user = Uuid::new_v4();

        assert!(!dispatcher.in_room(conv, user).await);
        dispatcher.join_room(conv, user).await;
        assert!(dispatcher.in_room(conv, user).await);
        dispatcher.leave_room(conv, user).await;
        assert!(!dispatcher.in_room(conv, user).await);
    }

    #[tokio::test]
    async fn user_events_reach_the_registered_channel() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        let (_conn, mut rx) = dispatcher.register_user_channel(user).await;

        dispatcher
            .notify_user(
                user,
                UserEvent::NewMessage {
                    from_user: UserSummary {
                        id: Uuid::new_v4(),
                        username: "ava".into(),
                    },
                    conversation_id: Uuid::new_v4(),
                    message: "hi".into(),
                },
            )
            .await;

        let got = rx.recv().await.unwrap();
        assert!(matches!(got, UserEvent::NewMessage { .. }));

        // Nobody listening on this one; must not error.
        dispatcher
            .notify_user(
                Uuid::new_v4(),
                UserEvent::FriendRequest {
                    from_user: UserSummary {
                        id: Uuid::new_v4(),
                        username: "ben".into(),
                    },
                    message: "ben sent you a friend request".into(),
                },
            )
            .await;
    }

    #[tokio::test]
    async fn newer_registration_supersedes_older() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();

        let (old_conn, _old_rx) = dispatcher.register_user_channel(user).await;
        let (_new_conn, mut new_rx) = dispatcher.register_user_channel(user).await;

        // Stale disconnect must not tear down the new channel.
        dispatcher.unregister_user_channel(user, old_conn).await;

        dispatcher
            .notify_user(
                user,
                UserEvent::FriendRequest {
                    from_user: UserSummary {
                        id: Uuid::new_v4(),
                        username: "cal".into(),
                    },
                    message: "cal sent you a friend request".into(),
                },
            )
            .await;
        assert!(new_rx.recv().await.is_some());
    }
}
