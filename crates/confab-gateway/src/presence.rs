use std::sync::Arc;

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use confab_db::Database;

/// Records online/offline truth per user, process-wide.
///
/// Whether other users get to *see* this state is a profile preference owned
/// by the account subsystem; the registry itself always records reality.
#[derive(Clone)]
pub struct PresenceRegistry {
    db: Arc<Database>,
}

impl PresenceRegistry {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Room connection opened. A failed write is logged, never fatal to the
    /// connection.
    pub fn connected(&self, user_id: Uuid) {
        if let Err(e) = self.db.set_presence(user_id, true, Utc::now()) {
            warn!("Failed to record online presence for {}: {}", user_id, e);
        }
    }

    /// Room connection closed: offline, last_seen = now.
    pub fn disconnected(&self, user_id: Uuid) {
        if let Err(e) = self.db.set_presence(user_id, false, Utc::now()) {
            warn!("Failed to record offline presence for {}: {}", user_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_and_disconnect_flip_the_row() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let user = Uuid::new_v4();
        db.ensure_user(user, "ava").unwrap();

        let presence = PresenceRegistry::new(db.clone());

        presence.connected(user);
        assert!(db.get_user(user).unwrap().unwrap().online);

        presence.disconnected(user);
        let row = db.get_user(user).unwrap().unwrap();
        assert!(!row.online);
        assert!(row.last_seen.is_some());
    }

    #[test]
    fn unknown_user_is_logged_not_fatal() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let presence = PresenceRegistry::new(db);
        // UPDATE on a missing row affects nothing; must not panic.
        presence.connected(Uuid::new_v4());
    }
}
