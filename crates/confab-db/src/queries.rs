use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use uuid::Uuid;

use confab_types::models::{FriendRequest, Message, User};

use crate::models::{FriendRequestRow, MessageHandle, MessageRow, UserRow};
use crate::{ts, Database};

const REQUEST_COLS: &str = "id, from_user, to_user, status, created_at, updated_at";
const MESSAGE_COLS: &str = "id, conversation_id, sender_id, message_type, content, media_id, \
                            created_at, expires_at, is_edited, edited_at, is_unsent";
const USER_COLS: &str = "id, username, retention_hours, online, last_seen";

fn user_row(row: &Row) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        retention_hours: row.get(2)?,
        online: row.get(3)?,
        last_seen: row.get(4)?,
    })
}

fn request_row(row: &Row) -> rusqlite::Result<FriendRequestRow> {
    Ok(FriendRequestRow {
        id: row.get(0)?,
        from_user: row.get(1)?,
        to_user: row.get(2)?,
        status: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn message_row(row: &Row) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        message_type: row.get(3)?,
        content: row.get(4)?,
        media_id: row.get(5)?,
        created_at: row.get(6)?,
        expires_at: row.get(7)?,
        is_edited: row.get(8)?,
        edited_at: row.get(9)?,
        is_unsent: row.get(10)?,
    })
}

impl Database {
    // -- Users --

    /// Upsert a user row on first authenticated contact. Identity itself is
    /// owned by the external account subsystem.
    pub fn ensure_user(&self, id: Uuid, username: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET username = excluded.username",
                params![id.to_string(), username],
            )?;
            Ok(())
        })
    }

    pub fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        let row = self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {USER_COLS} FROM users WHERE id = ?1"))?;
            stmt.query_row([id.to_string()], user_row).optional()
        })?;
        row.map(UserRow::into_user).transpose()
    }

    pub fn set_retention_hours(&self, id: Uuid, hours: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET retention_hours = ?2 WHERE id = ?1",
                params![id.to_string(), hours],
            )?;
            Ok(())
        })
    }

    pub fn set_presence(&self, id: Uuid, online: bool, last_seen: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET online = ?2, last_seen = ?3 WHERE id = ?1",
                params![id.to_string(), online as i64, ts(last_seen)],
            )?;
            Ok(())
        })
    }

    // -- Friend requests --

    pub fn create_friend_request(&self, req: &FriendRequest) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO friend_requests (id, from_user, to_user, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    req.id.to_string(),
                    req.from_user.to_string(),
                    req.to_user.to_string(),
                    req.status.as_str(),
                    ts(req.created_at),
                    ts(req.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_friend_request(&self, id: Uuid) -> Result<Option<FriendRequest>> {
        let row = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {REQUEST_COLS} FROM friend_requests WHERE id = ?1"
            ))?;
            stmt.query_row([id.to_string()], request_row).optional()
        })?;
        row.map(FriendRequestRow::into_request).transpose()
    }

    /// Any record between the pair, in either direction, any status.
    pub fn find_request_between(&self, a: Uuid, b: Uuid) -> Result<Option<FriendRequest>> {
        let row = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {REQUEST_COLS} FROM friend_requests
                 WHERE (from_user = ?1 AND to_user = ?2)
                    OR (from_user = ?2 AND to_user = ?1)"
            ))?;
            stmt.query_row(params![a.to_string(), b.to_string()], request_row)
                .optional()
        })?;
        row.map(FriendRequestRow::into_request).transpose()
    }

    pub fn find_pending_from(&self, from: Uuid, to: Uuid) -> Result<Option<FriendRequest>> {
        let row = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {REQUEST_COLS} FROM friend_requests
                 WHERE from_user = ?1 AND to_user = ?2 AND status = 'pending'"
            ))?;
            stmt.query_row(params![from.to_string(), to.to_string()], request_row)
                .optional()
        })?;
        row.map(FriendRequestRow::into_request).transpose()
    }

    pub fn find_accepted_between(&self, a: Uuid, b: Uuid) -> Result<Option<FriendRequest>> {
        let row = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {REQUEST_COLS} FROM friend_requests
                 WHERE status = 'accepted'
                   AND ((from_user = ?1 AND to_user = ?2)
                     OR (from_user = ?2 AND to_user = ?1))"
            ))?;
            stmt.query_row(params![a.to_string(), b.to_string()], request_row)
                .optional()
        })?;
        row.map(FriendRequestRow::into_request).transpose()
    }

    /// Accept a pending request and open the pair's conversation in one
    /// transaction, so a crash can never leave an accepted record without a
    /// room. Returns the conversation id, reusing an existing one if the
    /// pair already shares a room.
    pub fn accept_friend_request(&self, req: &FriendRequest, now: DateTime<Utc>) -> Result<Uuid> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE friend_requests SET status = 'accepted', updated_at = ?2 WHERE id = ?1",
                params![req.id.to_string(), ts(now)],
            )?;

            let existing = tx
                .query_row(
                    "SELECT c.id FROM conversations c
                     JOIN conversation_participants p1
                       ON p1.conversation_id = c.id AND p1.user_id = ?1
                     JOIN conversation_participants p2
                       ON p2.conversation_id = c.id AND p2.user_id = ?2
                     LIMIT 1",
                    params![req.from_user.to_string(), req.to_user.to_string()],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            if let Some(id) = existing {
                tx.commit()?;
                return Ok(id.parse()?);
            }

            let id = Uuid::new_v4();
            tx.execute(
                "INSERT INTO conversations (id, created_at, updated_at) VALUES (?1, ?2, ?2)",
                params![id.to_string(), ts(now)],
            )?;
            for user in [req.from_user, req.to_user] {
                tx.execute(
                    "INSERT INTO conversation_participants (conversation_id, user_id)
                     VALUES (?1, ?2)",
                    params![id.to_string(), user.to_string()],
                )?;
            }
            tx.commit()?;
            Ok(id)
        })
    }

    /// Returns false when the row was already gone.
    pub fn delete_friend_request(&self, id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM friend_requests WHERE id = ?1",
                [id.to_string()],
            )?;
            Ok(n > 0)
        })
    }

    pub fn list_incoming_pending(&self, user: Uuid) -> Result<Vec<FriendRequest>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {REQUEST_COLS} FROM friend_requests
                 WHERE to_user = ?1 AND status = 'pending'
                 ORDER BY created_at DESC"
            ))?;
            let rows = stmt
                .query_map([user.to_string()], request_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(FriendRequestRow::into_request).collect()
    }

    pub fn list_accepted(&self, user: Uuid) -> Result<Vec<FriendRequest>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {REQUEST_COLS} FROM friend_requests
                 WHERE status = 'accepted' AND (from_user = ?1 OR to_user = ?1)
                 ORDER BY updated_at DESC"
            ))?;
            let rows = stmt
                .query_map([user.to_string()], request_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(FriendRequestRow::into_request).collect()
    }

    // -- Conversations --

    /// Create a conversation with both participants in one transaction.
    pub fn create_conversation(&self, a: Uuid, b: Uuid, now: DateTime<Utc>) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO conversations (id, created_at, updated_at) VALUES (?1, ?2, ?2)",
                params![id.to_string(), ts(now)],
            )?;
            for user in [a, b] {
                tx.execute(
                    "INSERT INTO conversation_participants (conversation_id, user_id)
                     VALUES (?1, ?2)",
                    params![id.to_string(), user.to_string()],
                )?;
            }
            tx.commit()?;
            Ok(())
        })?;
        Ok(id)
    }

    pub fn find_conversation_between(&self, a: Uuid, b: Uuid) -> Result<Option<Uuid>> {
        let id = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id FROM conversations c
                 JOIN conversation_participants p1
                   ON p1.conversation_id = c.id AND p1.user_id = ?1
                 JOIN conversation_participants p2
                   ON p2.conversation_id = c.id AND p2.user_id = ?2
                 LIMIT 1",
            )?;
            stmt.query_row(params![a.to_string(), b.to_string()], |row| {
                row.get::<_, String>(0)
            })
            .optional()
        })?;
        Ok(id.map(|s| s.parse()).transpose()?)
    }

    /// All shared conversations, for unfriend cleanup.
    pub fn conversations_between(&self, a: Uuid, b: Uuid) -> Result<Vec<Uuid>> {
        let ids = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id FROM conversations c
                 JOIN conversation_participants p1
                   ON p1.conversation_id = c.id AND p1.user_id = ?1
                 JOIN conversation_participants p2
                   ON p2.conversation_id = c.id AND p2.user_id = ?2",
            )?;
            let ids = stmt
                .query_map(params![a.to_string(), b.to_string()], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })?;
        ids.into_iter()
            .map(|s| s.parse().map_err(Into::into))
            .collect()
    }

    pub fn is_participant(&self, conversation: Uuid, user: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT 1 FROM conversation_participants
                 WHERE conversation_id = ?1 AND user_id = ?2",
            )?;
            let found = stmt
                .query_row(params![conversation.to_string(), user.to_string()], |_| {
                    Ok(())
                })
                .optional()?;
            Ok(found.is_some())
        })
    }

    pub fn other_participant(&self, conversation: Uuid, user: Uuid) -> Result<Option<User>> {
        let row = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT u.id, u.username, u.retention_hours, u.online, u.last_seen
                 FROM conversation_participants p
                 JOIN users u ON u.id = p.user_id
                 WHERE p.conversation_id = ?1 AND p.user_id != ?2",
            )?;
            stmt.query_row(params![conversation.to_string(), user.to_string()], user_row)
                .optional()
        })?;
        row.map(UserRow::into_user).transpose()
    }

    pub fn conversations_for(&self, user: Uuid) -> Result<Vec<Uuid>> {
        let ids = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id FROM conversations c
                 JOIN conversation_participants p ON p.conversation_id = c.id
                 WHERE p.user_id = ?1
                 ORDER BY c.updated_at DESC",
            )?;
            let ids = stmt
                .query_map([user.to_string()], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })?;
        ids.into_iter()
            .map(|s| s.parse().map_err(Into::into))
            .collect()
    }

    /// Participants first, then the conversation row. Messages must already
    /// be gone; callers own that ordering.
    pub fn delete_conversation(&self, conversation: Uuid) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM conversation_participants WHERE conversation_id = ?1",
                [conversation.to_string()],
            )?;
            tx.execute(
                "DELETE FROM conversations WHERE id = ?1",
                [conversation.to_string()],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Orphan sweep: drop conversations that no longer hold any messages.
    pub fn sweep_empty_conversations(&self) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM conversation_participants WHERE conversation_id IN (
                     SELECT c.id FROM conversations c
                     WHERE NOT EXISTS (SELECT 1 FROM messages m WHERE m.conversation_id = c.id)
                 )",
                [],
            )?;
            let n = tx.execute(
                "DELETE FROM conversations WHERE NOT EXISTS (
                     SELECT 1 FROM messages m WHERE m.conversation_id = conversations.id
                 )",
                [],
            )?;
            tx.commit()?;
            Ok(n)
        })
    }

    // -- Messages --

    /// Persist a message, its sender's read receipt, and the conversation
    /// bump in one transaction.
    pub fn insert_message(&self, msg: &Message) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                &format!(
                    "INSERT INTO messages ({MESSAGE_COLS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    msg.id.to_string(),
                    msg.conversation_id.to_string(),
                    msg.sender_id.to_string(),
                    msg.message_type.as_str(),
                    msg.content,
                    msg.media_id,
                    ts(msg.created_at),
                    ts(msg.expires_at),
                    msg.is_edited as i64,
                    msg.edited_at.map(ts),
                    msg.is_unsent as i64,
                ],
            )?;
            tx.execute(
                "INSERT INTO read_statuses (message_id, user_id, is_read, read_at)
                 VALUES (?1, ?2, 1, ?3)",
                params![
                    msg.id.to_string(),
                    msg.sender_id.to_string(),
                    ts(msg.created_at)
                ],
            )?;
            tx.execute(
                "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
                params![msg.conversation_id.to_string(), ts(msg.created_at)],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        let row = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLS} FROM messages WHERE id = ?1"
            ))?;
            stmt.query_row([id.to_string()], message_row).optional()
        })?;
        row.map(MessageRow::into_message).transpose()
    }

    /// Ascending history fetch since an optional timestamp. Unsent messages
    /// are filtered out for everyone except their sender.
    pub fn messages_since(
        &self,
        conversation: Uuid,
        viewer: Uuid,
        after: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let rows = self.with_conn(|conn| {
            let rows = match after {
                Some(after) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {MESSAGE_COLS} FROM messages
                         WHERE conversation_id = ?1
                           AND (is_unsent = 0 OR sender_id = ?2)
                           AND created_at > ?3
                         ORDER BY created_at ASC LIMIT ?4"
                    ))?;
                    let rows = stmt
                        .query_map(
                            params![
                                conversation.to_string(),
                                viewer.to_string(),
                                ts(after),
                                limit
                            ],
                            message_row,
                        )?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    rows
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {MESSAGE_COLS} FROM messages
                         WHERE conversation_id = ?1
                           AND (is_unsent = 0 OR sender_id = ?2)
                         ORDER BY created_at ASC LIMIT ?3"
                    ))?;
                    let rows = stmt
                        .query_map(
                            params![conversation.to_string(), viewer.to_string(), limit],
                            message_row,
                        )?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    rows
                }
            };
            Ok(rows)
        })?;
        rows.into_iter().map(MessageRow::into_message).collect()
    }

    pub fn last_visible_message(
        &self,
        conversation: Uuid,
        viewer: Uuid,
    ) -> Result<Option<Message>> {
        let row = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLS} FROM messages
                 WHERE conversation_id = ?1 AND (is_unsent = 0 OR sender_id = ?2)
                 ORDER BY created_at DESC LIMIT 1"
            ))?;
            stmt.query_row(
                params![conversation.to_string(), viewer.to_string()],
                message_row,
            )
            .optional()
        })?;
        row.map(MessageRow::into_message).transpose()
    }

    pub fn apply_edit(&self, id: Uuid, content: &str, edited_at: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE messages SET content = ?2, is_edited = 1, edited_at = ?3 WHERE id = ?1",
                params![id.to_string(), content, ts(edited_at)],
            )?;
            Ok(())
        })
    }

    pub fn apply_unsend(&self, id: Uuid) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE messages SET is_unsent = 1 WHERE id = ?1",
                [id.to_string()],
            )?;
            Ok(())
        })
    }

    // -- Read receipts --

    /// Idempotent upsert; a row is only ever written with is_read = 1.
    pub fn mark_read(&self, message: Uuid, user: Uuid, now: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO read_statuses (message_id, user_id, is_read, read_at)
                 VALUES (?1, ?2, 1, ?3)
                 ON CONFLICT(message_id, user_id) DO UPDATE SET is_read = 1",
                params![message.to_string(), user.to_string(), ts(now)],
            )?;
            Ok(())
        })
    }

    /// Mark every unread message in a conversation read for one user.
    /// Returns the number of newly created receipts.
    pub fn mark_conversation_read(
        &self,
        conversation: Uuid,
        user: Uuid,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO read_statuses (message_id, user_id, is_read, read_at)
                 SELECT m.id, ?1, 1, ?2 FROM messages m
                 WHERE m.conversation_id = ?3
                   AND NOT EXISTS (SELECT 1 FROM read_statuses r
                                   WHERE r.message_id = m.id AND r.user_id = ?1)",
                params![user.to_string(), ts(now), conversation.to_string()],
            )?;
            Ok(n)
        })
    }

    /// Absence-based count: messages with no true read row for this user.
    pub fn unread_count(&self, conversation: Uuid, user: Uuid) -> Result<i64> {
        self.with_conn(|conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM messages m
                 WHERE m.conversation_id = ?1
                   AND NOT EXISTS (SELECT 1 FROM read_statuses r
                                   WHERE r.message_id = m.id
                                     AND r.user_id = ?2
                                     AND r.is_read = 1)",
                params![conversation.to_string(), user.to_string()],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    // -- Retention --

    /// Indexed range query over the expiry column.
    pub fn expired_messages(&self, now: DateTime<Utc>) -> Result<Vec<MessageHandle>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, media_id FROM messages WHERE expires_at < ?1")?;
            let rows = stmt
                .query_map([ts(now)], |row| {
                    Ok(MessageHandle {
                        id: row.get(0)?,
                        media_id: row.get(1)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn messages_in_conversation(&self, conversation: Uuid) -> Result<Vec<MessageHandle>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, media_id FROM messages WHERE conversation_id = ?1")?;
            let rows = stmt
                .query_map([conversation.to_string()], |row| {
                    Ok(MessageHandle {
                        id: row.get(0)?,
                        media_id: row.get(1)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Read statuses first, then the message row. Deleting an already-gone
    /// message is a no-op, not an error.
    pub fn delete_message(&self, id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM read_statuses WHERE message_id = ?1", [id])?;
            let n = tx.execute("DELETE FROM messages WHERE id = ?1", [id])?;
            tx.commit()?;
            Ok(n > 0)
        })
    }
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use confab_types::models::{FriendStatus, MessageType};

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn user(db: &Database, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        db.ensure_user(id, name).unwrap();
        id
    }

    fn request(from: Uuid, to: Uuid) -> FriendRequest {
        let now = Utc::now();
        FriendRequest {
            id: Uuid::new_v4(),
            from_user: from,
            to_user: to,
            status: FriendStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Two friends with an accepted request and a shared conversation.
    fn pair(db: &Database) -> (Uuid, Uuid, Uuid) {
        let a = user(db, "ava");
        let b = user(db, "ben");
        let req = request(a, b);
        db.create_friend_request(&req).unwrap();
        let conv = db.accept_friend_request(&req, Utc::now()).unwrap();
        (a, b, conv)
    }

    fn text(conv: Uuid, sender: Uuid, body: &str) -> Message {
        Message::new_text(conv, sender, body.into(), 24)
    }

    #[test]
    fn duplicate_request_rejected_in_both_directions() {
        let db = db();
        let a = user(&db, "ava");
        let b = user(&db, "ben");

        db.create_friend_request(&request(a, b)).unwrap();
        assert!(db.find_request_between(a, b).unwrap().is_some());
        assert!(db.find_request_between(b, a).unwrap().is_some());

        // Same direction hits the ordered unique constraint, the opposite
        // direction hits the symmetric pair index. Both surface as
        // constraint violations so callers can map them to a conflict.
        let same = db.create_friend_request(&request(a, b)).unwrap_err();
        assert!(crate::is_constraint_violation(&same));
        let reversed = db.create_friend_request(&request(b, a)).unwrap_err();
        assert!(crate::is_constraint_violation(&reversed));
    }

    #[test]
    fn accept_creates_conversation_found_idempotently() {
        let db = db();
        let (a, b, conv) = pair(&db);

        assert!(db.is_participant(conv, a).unwrap());
        assert!(db.is_participant(conv, b).unwrap());
        assert!(!db.is_participant(conv, Uuid::new_v4()).unwrap());

        // The accepted record and its room come out of the same commit.
        let req = db.find_accepted_between(a, b).unwrap().unwrap();
        assert_eq!(req.status, FriendStatus::Accepted);

        // Looking the conversation up again returns the same one.
        assert_eq!(db.find_conversation_between(a, b).unwrap(), Some(conv));
        assert_eq!(db.find_conversation_between(b, a).unwrap(), Some(conv));

        // Re-accepting a pair that already shares a room reuses it.
        assert_eq!(db.accept_friend_request(&req, Utc::now()).unwrap(), conv);

        let other = db.other_participant(conv, a).unwrap().unwrap();
        assert_eq!(other.id, b);
        assert_eq!(other.username, "ben");
    }

    #[test]
    fn cancel_deletes_only_pending_from_sender() {
        let db = db();
        let a = user(&db, "ava");
        let b = user(&db, "ben");
        let req = request(a, b);
        db.create_friend_request(&req).unwrap();

        // Recipient has no pending request authored by them.
        assert!(db.find_pending_from(b, a).unwrap().is_none());

        let found = db.find_pending_from(a, b).unwrap().unwrap();
        assert!(db.delete_friend_request(found.id).unwrap());
        assert!(db.find_request_between(a, b).unwrap().is_none());

        // Pair is back to square one.
        assert!(db.create_friend_request(&request(b, a)).is_ok());
    }

    #[test]
    fn unread_count_is_total_minus_read() {
        let db = db();
        let (a, b, conv) = pair(&db);

        let msgs: Vec<Message> = (0..5).map(|i| text(conv, a, &format!("m{i}"))).collect();
        for m in &msgs {
            db.insert_message(m).unwrap();
        }

        // Sender read everything at send time; receiver read nothing.
        assert_eq!(db.unread_count(conv, a).unwrap(), 0);
        assert_eq!(db.unread_count(conv, b).unwrap(), 5);

        db.mark_read(msgs[0].id, b, Utc::now()).unwrap();
        db.mark_read(msgs[1].id, b, Utc::now()).unwrap();
        // Idempotent re-read does not change the count.
        db.mark_read(msgs[1].id, b, Utc::now()).unwrap();
        assert_eq!(db.unread_count(conv, b).unwrap(), 3);

        let newly = db.mark_conversation_read(conv, b, Utc::now()).unwrap();
        assert_eq!(newly, 3);
        assert_eq!(db.unread_count(conv, b).unwrap(), 0);
    }

    #[test]
    fn history_fetch_filters_unsent_for_non_senders() {
        let db = db();
        let (a, b, conv) = pair(&db);

        let mut m1 = text(conv, a, "first");
        m1.created_at = Utc::now() - Duration::minutes(10);
        let mut m2 = text(conv, a, "second");
        m2.created_at = Utc::now() - Duration::minutes(5);
        m2.is_unsent = true;
        let m3 = text(conv, b, "third");
        db.insert_message(&m1).unwrap();
        db.insert_message(&m2).unwrap();
        db.insert_message(&m3).unwrap();

        // Receiver never sees the unsent message; the sender still does.
        let seen_by_b: Vec<_> = db.messages_since(conv, b, None, 50).unwrap();
        assert_eq!(seen_by_b.len(), 2);
        assert!(seen_by_b.iter().all(|m| m.id != m2.id));

        let seen_by_a = db.messages_since(conv, a, None, 50).unwrap();
        assert_eq!(seen_by_a.len(), 3);

        // Since-timestamp window.
        let after = m1.created_at;
        let recent = db.messages_since(conv, a, Some(after), 50).unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent.iter().all(|m| m.created_at > after));

        let last = db.last_visible_message(conv, b).unwrap().unwrap();
        assert_eq!(last.id, m3.id);
    }

    #[test]
    fn edit_and_unsend_persist() {
        let db = db();
        let (a, _b, conv) = pair(&db);
        let m = text(conv, a, "draft");
        db.insert_message(&m).unwrap();

        let edited_at = Utc::now();
        db.apply_edit(m.id, "final", edited_at).unwrap();
        let got = db.get_message(m.id).unwrap().unwrap();
        assert_eq!(got.content.as_deref(), Some("final"));
        assert!(got.is_edited);
        assert!(got.edited_at.is_some());

        db.apply_unsend(m.id).unwrap();
        let got = db.get_message(m.id).unwrap().unwrap();
        assert!(got.is_unsent);
        // Content survives the unsend.
        assert_eq!(got.content.as_deref(), Some("final"));
    }

    #[test]
    fn expired_range_query_and_idempotent_delete() {
        let db = db();
        let (a, _b, conv) = pair(&db);

        let mut old = Message::new_media(
            conv,
            a,
            MessageType::Image,
            None,
            "blob-1.jpg".into(),
            24,
        );
        old.created_at = Utc::now() - Duration::hours(25);
        old.expires_at = old.created_at + Duration::hours(24);
        let fresh = text(conv, a, "recent");
        db.insert_message(&old).unwrap();
        db.insert_message(&fresh).unwrap();

        let expired = db.expired_messages(Utc::now()).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, old.id.to_string());
        assert_eq!(expired[0].media_id.as_deref(), Some("blob-1.jpg"));

        assert!(db.delete_message(&expired[0].id).unwrap());
        // Re-running against the already-deleted row is a no-op.
        assert!(!db.delete_message(&expired[0].id).unwrap());
        assert!(db.get_message(old.id).unwrap().is_none());
        assert!(db.get_message(fresh.id).unwrap().is_some());
    }

    #[test]
    fn orphan_sweep_keeps_conversations_with_messages() {
        let db = db();
        let (a, _b, busy) = pair(&db);
        db.insert_message(&text(busy, a, "hi")).unwrap();

        let c = user(&db, "cal");
        let d = user(&db, "dee");
        let empty = db.create_conversation(c, d, Utc::now()).unwrap();

        assert_eq!(db.sweep_empty_conversations().unwrap(), 1);
        assert!(db.find_conversation_between(c, d).unwrap().is_none());
        assert!(db.is_participant(busy, a).unwrap());
        assert_eq!(db.find_conversation_between(c, d).unwrap(), None);
        let _ = empty;

        // Second run finds nothing.
        assert_eq!(db.sweep_empty_conversations().unwrap(), 0);
    }

    #[test]
    fn presence_flips_are_recorded() {
        use chrono::TimeZone;

        let db = db();
        let a = user(&db, "ava");

        // Whole-second timestamp so the stored value round-trips exactly.
        let t = Utc.with_ymd_and_hms(2026, 8, 25, 10, 0, 0).unwrap();
        db.set_presence(a, true, t).unwrap();
        let u = db.get_user(a).unwrap().unwrap();
        assert!(u.online);

        db.set_presence(a, false, t + Duration::seconds(30)).unwrap();
        let u = db.get_user(a).unwrap().unwrap();
        assert!(!u.online);
        assert_eq!(u.last_seen.unwrap(), t + Duration::seconds(30));
        assert_eq!(u.retention_hours, 24);
    }

    #[test]
    fn unfriend_cleanup_queries_cover_the_tree() {
        let db = db();
        let (a, b, conv) = pair(&db);
        db.insert_message(&text(conv, a, "one")).unwrap();
        db.insert_message(&text(conv, b, "two")).unwrap();

        let convs = db.conversations_between(a, b).unwrap();
        assert_eq!(convs, vec![conv]);

        let handles = db.messages_in_conversation(conv).unwrap();
        assert_eq!(handles.len(), 2);
        for h in &handles {
            db.delete_message(&h.id).unwrap();
        }
        db.delete_conversation(conv).unwrap();

        let req = db.find_accepted_between(a, b).unwrap().unwrap();
        assert!(db.delete_friend_request(req.id).unwrap());

        // Pair is back to None: a fresh request works in either direction.
        assert!(db.find_request_between(a, b).unwrap().is_none());
        assert!(db.create_friend_request(&request(b, a)).is_ok());
    }
}
