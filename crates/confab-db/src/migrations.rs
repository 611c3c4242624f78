use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id              TEXT PRIMARY KEY,
            username        TEXT NOT NULL UNIQUE,
            retention_hours INTEGER NOT NULL DEFAULT 24,
            online          INTEGER NOT NULL DEFAULT 0,
            last_seen       TEXT,
            created_at      TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS friend_requests (
            id          TEXT PRIMARY KEY,
            from_user   TEXT NOT NULL REFERENCES users(id),
            to_user     TEXT NOT NULL REFERENCES users(id),
            status      TEXT NOT NULL DEFAULT 'pending',
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL,
            UNIQUE(from_user, to_user)
        );

        -- One active record per unordered pair, in either direction. Closes
        -- the race between two users sending each other requests at once.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_friend_requests_pair
            ON friend_requests (MIN(from_user, to_user), MAX(from_user, to_user));

        CREATE TABLE IF NOT EXISTS conversations (
            id          TEXT PRIMARY KEY,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conversation_participants (
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            user_id         TEXT NOT NULL REFERENCES users(id),
            PRIMARY KEY (conversation_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            sender_id       TEXT NOT NULL REFERENCES users(id),
            message_type    TEXT NOT NULL DEFAULT 'text',
            content         TEXT,
            media_id        TEXT,
            created_at      TEXT NOT NULL,
            expires_at      TEXT NOT NULL,
            is_edited       INTEGER NOT NULL DEFAULT 0,
            edited_at       TEXT,
            is_unsent       INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at);

        -- Range scan for the retention sweep.
        CREATE INDEX IF NOT EXISTS idx_messages_expiry
            ON messages(expires_at);

        -- A row exists only once a user has read the message; absence of a
        -- row is the unread encoding. No row ever stores is_read = 0.
        CREATE TABLE IF NOT EXISTS read_statuses (
            message_id  TEXT NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            is_read     INTEGER NOT NULL DEFAULT 1,
            read_at     TEXT NOT NULL,
            PRIMARY KEY (message_id, user_id)
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
