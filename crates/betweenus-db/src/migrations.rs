use rusqlite::Connection;
use tracing::info;

use crate::error::StoreResult;

/// Which store a SQLite file backs. The two never share a file, so nothing
/// can span both in one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schema {
    Relational,
    Documents,
}

pub fn run(conn: &Connection, schema: Schema) -> StoreResult<()> {
    match schema {
        Schema::Relational => conn.execute_batch(RELATIONAL)?,
        Schema::Documents => conn.execute_batch(DOCUMENTS)?,
    }

    info!("Database migrations complete ({:?})", schema);
    Ok(())
}

const RELATIONAL: &str = "
    CREATE TABLE IF NOT EXISTS users (
        id          TEXT PRIMARY KEY,
        username    TEXT NOT NULL UNIQUE,
        full_name   TEXT NOT NULL,
        profile_url TEXT,
        created_at  TEXT NOT NULL DEFAULT (datetime('now'))
    );

    -- One row per direction. room_id is the pointer into the document store.
    CREATE TABLE IF NOT EXISTS friendships (
        user_id     TEXT NOT NULL REFERENCES users(id),
        friend_id   TEXT NOT NULL REFERENCES users(id),
        room_id     TEXT,
        created_at  TEXT NOT NULL DEFAULT (datetime('now')),
        PRIMARY KEY (user_id, friend_id)
    );
";

const DOCUMENTS: &str = "
    CREATE TABLE IF NOT EXISTS chat_rooms (
        id                  TEXT PRIMARY KEY,
        pair_key            TEXT NOT NULL UNIQUE,
        user_id             TEXT NOT NULL,
        friend_id           TEXT NOT NULL,
        user_name           TEXT NOT NULL,
        friend_user_name    TEXT NOT NULL,
        user_full_name      TEXT NOT NULL,
        friend_full_name    TEXT NOT NULL,
        user_profile_url    TEXT NOT NULL DEFAULT '',
        friend_profile_url  TEXT NOT NULL DEFAULT '',
        last_message_id     TEXT,
        last_message        TEXT,
        last_message_time   INTEGER,
        message_state       INTEGER NOT NULL DEFAULT 0,
        unread_count        INTEGER NOT NULL DEFAULT 0,
        is_pinned           INTEGER NOT NULL DEFAULT 0,
        is_archived         INTEGER NOT NULL DEFAULT 0,
        -- seq of the latest message; breaks ties between equal timestamps
        activity_seq        INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_rooms_user
        ON chat_rooms(user_id, last_message_time);
    CREATE INDEX IF NOT EXISTS idx_rooms_friend
        ON chat_rooms(friend_id, last_message_time);

    -- seq is the insertion order; ids are random
    CREATE TABLE IF NOT EXISTS messages (
        seq                 INTEGER PRIMARY KEY AUTOINCREMENT,
        id                  TEXT NOT NULL UNIQUE,
        chat_room_id        TEXT NOT NULL,
        from_uid            TEXT NOT NULL,
        to_uid              TEXT NOT NULL,
        message             TEXT NOT NULL,
        timestamp           INTEGER NOT NULL,
        message_type        TEXT NOT NULL DEFAULT 'TEXT',
        media_url           TEXT,
        reply_to_message_id TEXT,
        reply_to_message    TEXT,
        message_state       INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_messages_room
        ON messages(chat_room_id, timestamp, seq);
";
