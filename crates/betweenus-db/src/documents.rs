use std::str::FromStr;

use rusqlite::types::Type;
use rusqlite::{Connection, Row, params};
use tracing::{debug, warn};

use betweenus_types::{
    ChatRoom, Message, MessageId, MessageState, MessageType, Page, PaginationWindow, RoomId, UserId,
};

use crate::error::{StoreError, StoreResult};
use crate::feed::{ChangeEvent, ChangeFeed, ChangeFilter, ChangeOperation, ChangeSubscription, Collection};
use crate::{Database, OptionalExt};

/// Rooms and messages, plus a change feed over both.
pub trait DocumentStore: Send + Sync {
    /// Fails with [`StoreError::Conflict`] if the id or the participant
    /// pair already has a room.
    fn insert_room(&self, room: &ChatRoom) -> StoreResult<RoomId>;

    /// Store a message and roll the room's last-message fields forward.
    /// Fails with [`StoreError::NotFound`] if the room does not exist.
    fn insert_message(&self, message: &Message) -> StoreResult<MessageId>;

    /// Remove a room and everything in it. Missing rooms are not an error.
    fn delete_room_and_messages(&self, room_id: RoomId) -> StoreResult<()>;

    fn get_room(&self, room_id: RoomId) -> StoreResult<Option<ChatRoom>>;

    /// Rooms where `user_id` participates, most recent activity first.
    fn rooms_for_user(&self, user_id: &UserId, window: PaginationWindow) -> StoreResult<Page<ChatRoom>>;

    /// Messages in a room, newest first.
    fn messages_for_room(&self, room_id: RoomId, window: PaginationWindow) -> StoreResult<Page<Message>>;

    /// Advance the state of the given messages. Messages already at or past
    /// `state` are left alone. Returns how many moved.
    fn acknowledge_messages(&self, room_id: RoomId, ids: &[MessageId], state: MessageState) -> StoreResult<u64>;

    fn subscribe_changes(&self, filter: ChangeFilter) -> StoreResult<ChangeSubscription>;
}

pub struct SqliteDocumentStore {
    db: Database,
    feed: ChangeFeed,
}

impl SqliteDocumentStore {
    pub fn new(db: Database, feed: ChangeFeed) -> Self {
        Self { db, feed }
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    pub fn active_subscriptions(&self) -> usize {
        self.feed.active_subscriptions()
    }

    pub fn count_rooms(&self) -> StoreResult<u64> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM chat_rooms", [], |row| row.get(0))?;
            Ok(n as u64)
        })
    }
}

const ROOM_COLUMNS: &str = "id, user_id, friend_id, user_name, friend_user_name, user_full_name,
    friend_full_name, user_profile_url, friend_profile_url, last_message_id, last_message,
    last_message_time, message_state, unread_count, is_pinned, is_archived";

const MESSAGE_COLUMNS: &str = "id, chat_room_id, from_uid, to_uid, message, timestamp, message_type,
    media_url, reply_to_message_id, reply_to_message, message_state";

impl DocumentStore for SqliteDocumentStore {
    fn insert_room(&self, room: &ChatRoom) -> StoreResult<RoomId> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chat_rooms (id, pair_key, user_id, friend_id, user_name, friend_user_name,
                    user_full_name, friend_full_name, user_profile_url, friend_profile_url,
                    last_message_id, last_message, last_message_time, message_state, unread_count,
                    is_pinned, is_archived)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params![
                    room.id.to_string(),
                    room.pair_key(),
                    room.user_id.as_str(),
                    room.friend_id.as_str(),
                    room.user_name,
                    room.friend_user_name,
                    room.user_full_name,
                    room.friend_full_name,
                    room.user_profile_url,
                    room.friend_profile_url,
                    room.last_message_id.map(|id| id.to_string()),
                    room.last_message,
                    room.last_message_time,
                    room.message_state.rank(),
                    room.unread_count,
                    room.is_pinned,
                    room.is_archived,
                ],
            )?;
            Ok(())
        })?;

        debug!("Inserted room {} ({} <-> {})", room.id, room.user_id, room.friend_id);
        self.feed.publish(ChangeEvent::new(
            ChangeOperation::Insert,
            Collection::Rooms,
            room.id,
            room.participants(),
        ));
        Ok(room.id)
    }

    fn insert_message(&self, message: &Message) -> StoreResult<MessageId> {
        let participants = self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let participants = query_participants(&tx, message.chat_room_id)?
                .ok_or_else(|| StoreError::NotFound(format!("room {}", message.chat_room_id)))?;

            tx.execute(
                &format!("INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
                params![
                    message.id.to_string(),
                    message.chat_room_id.to_string(),
                    message.from_uid.as_str(),
                    message.to_uid.as_str(),
                    message.message,
                    message.timestamp,
                    message.message_type.as_str(),
                    message.media_url,
                    message.reply_to_message_id.map(|id| id.to_string()),
                    message.reply_to_message,
                    message.message_state.rank(),
                ],
            )?;
            let seq = tx.last_insert_rowid();

            tx.execute(
                "UPDATE chat_rooms
                 SET last_message_id = ?2, last_message = ?3, last_message_time = ?4,
                     message_state = ?5, unread_count = unread_count + 1, activity_seq = ?6
                 WHERE id = ?1",
                params![
                    message.chat_room_id.to_string(),
                    message.id.to_string(),
                    message.message,
                    message.timestamp,
                    message.message_state.rank(),
                    seq,
                ],
            )?;

            tx.commit()?;
            Ok(participants)
        })?;

        self.feed.publish(ChangeEvent::new(
            ChangeOperation::Insert,
            Collection::Messages,
            message.chat_room_id,
            participants.clone(),
        ));
        self.feed.publish(ChangeEvent::new(
            ChangeOperation::Update,
            Collection::Rooms,
            message.chat_room_id,
            participants,
        ));
        Ok(message.id)
    }

    fn delete_room_and_messages(&self, room_id: RoomId) -> StoreResult<()> {
        let participants = self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let participants = query_participants(&tx, room_id)?;
            let id = room_id.to_string();
            tx.execute("DELETE FROM messages WHERE chat_room_id = ?1", [&id])?;
            tx.execute("DELETE FROM chat_rooms WHERE id = ?1", [&id])?;
            tx.commit()?;
            Ok(participants)
        })?;

        match participants {
            Some(participants) => {
                warn!("Deleted room {} and its messages", room_id);
                self.feed.publish(ChangeEvent::new(
                    ChangeOperation::Delete,
                    Collection::Messages,
                    room_id,
                    participants.clone(),
                ));
                self.feed.publish(ChangeEvent::new(
                    ChangeOperation::Delete,
                    Collection::Rooms,
                    room_id,
                    participants,
                ));
            }
            None => debug!("Delete of missing room {} ignored", room_id),
        }
        Ok(())
    }

    fn get_room(&self, room_id: RoomId) -> StoreResult<Option<ChatRoom>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {ROOM_COLUMNS} FROM chat_rooms WHERE id = ?1"),
                [room_id.to_string()],
                read_room,
            )
            .optional()
        })
    }

    fn rooms_for_user(&self, user_id: &UserId, window: PaginationWindow) -> StoreResult<Page<ChatRoom>> {
        self.db.with_conn(|conn| {
            let total: i64 = conn.query_row(
                "SELECT COUNT(*) FROM chat_rooms WHERE user_id = ?1 OR friend_id = ?1",
                [user_id.as_str()],
                |row| row.get(0),
            )?;

            let mut stmt = conn.prepare(&format!(
                "SELECT {ROOM_COLUMNS} FROM chat_rooms
                 WHERE user_id = ?1 OR friend_id = ?1
                 ORDER BY COALESCE(last_message_time, 0) DESC, activity_seq DESC, rowid DESC
                 LIMIT ?2 OFFSET ?3"
            ))?;
            let rooms = stmt
                .query_map(
                    params![user_id.as_str(), window.limit(), window.offset() as i64],
                    read_room,
                )?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(Page::new(rooms, window, total as u64))
        })
    }

    fn messages_for_room(&self, room_id: RoomId, window: PaginationWindow) -> StoreResult<Page<Message>> {
        self.db.with_conn(|conn| {
            let id = room_id.to_string();
            let total: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE chat_room_id = ?1",
                [&id],
                |row| row.get(0),
            )?;

            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE chat_room_id = ?1
                 ORDER BY timestamp DESC, seq DESC
                 LIMIT ?2 OFFSET ?3"
            ))?;
            let messages = stmt
                .query_map(params![id, window.limit(), window.offset() as i64], read_message)?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(Page::new(messages, window, total as u64))
        })
    }

    fn acknowledge_messages(&self, room_id: RoomId, ids: &[MessageId], state: MessageState) -> StoreResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let outcome = self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let Some(participants) = query_participants(&tx, room_id)? else {
                return Err(StoreError::NotFound(format!("room {}", room_id)));
            };
            let room = room_id.to_string();

            let mut updated = 0u64;
            for id in ids {
                updated += tx.execute(
                    "UPDATE messages SET message_state = ?3
                     WHERE chat_room_id = ?1 AND id = ?2 AND message_state < ?3",
                    params![room, id.to_string(), state.rank()],
                )? as u64;
            }

            if updated > 0 {
                // Room mirrors its last message's state; unread counts what is not yet read
                tx.execute(
                    "UPDATE chat_rooms SET
                        message_state = COALESCE(
                            (SELECT m.message_state FROM messages m WHERE m.id = chat_rooms.last_message_id),
                            message_state),
                        unread_count = (
                            SELECT COUNT(*) FROM messages m
                            WHERE m.chat_room_id = chat_rooms.id AND m.message_state < ?2)
                     WHERE id = ?1",
                    params![room, MessageState::Read.rank()],
                )?;
            }

            tx.commit()?;
            Ok((updated, participants))
        })?;

        let (updated, participants) = outcome;
        if updated > 0 {
            self.feed.publish(ChangeEvent::new(
                ChangeOperation::Update,
                Collection::Messages,
                room_id,
                participants.clone(),
            ));
            self.feed.publish(ChangeEvent::new(
                ChangeOperation::Update,
                Collection::Rooms,
                room_id,
                participants,
            ));
        }
        Ok(updated)
    }

    fn subscribe_changes(&self, filter: ChangeFilter) -> StoreResult<ChangeSubscription> {
        Ok(self.feed.subscribe(filter))
    }
}

fn query_participants(conn: &Connection, room_id: RoomId) -> StoreResult<Option<[UserId; 2]>> {
    conn.query_row(
        "SELECT user_id, friend_id FROM chat_rooms WHERE id = ?1",
        [room_id.to_string()],
        |row| {
            Ok([
                UserId::new(row.get::<_, String>(0)?),
                UserId::new(row.get::<_, String>(1)?),
            ])
        },
    )
    .optional()
}

fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_opt_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        s.parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn state_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<MessageState> {
    let rank: i64 = row.get(idx)?;
    MessageState::from_rank(rank).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, rank))
}

fn read_room(row: &Row<'_>) -> rusqlite::Result<ChatRoom> {
    Ok(ChatRoom {
        id: parse_col(row, 0)?,
        user_id: UserId::new(row.get::<_, String>(1)?),
        friend_id: UserId::new(row.get::<_, String>(2)?),
        user_name: row.get(3)?,
        friend_user_name: row.get(4)?,
        user_full_name: row.get(5)?,
        friend_full_name: row.get(6)?,
        user_profile_url: row.get(7)?,
        friend_profile_url: row.get(8)?,
        last_message_id: parse_opt_col(row, 9)?,
        last_message: row.get(10)?,
        last_message_time: row.get(11)?,
        message_state: state_col(row, 12)?,
        unread_count: row.get(13)?,
        is_pinned: row.get(14)?,
        is_archived: row.get(15)?,
    })
}

fn read_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let kind: String = row.get(6)?;
    Ok(Message {
        id: parse_col(row, 0)?,
        chat_room_id: parse_col(row, 1)?,
        from_uid: UserId::new(row.get::<_, String>(2)?),
        to_uid: UserId::new(row.get::<_, String>(3)?),
        message: row.get(4)?,
        timestamp: row.get(5)?,
        message_type: MessageType::parse(&kind).unwrap_or_default(),
        media_url: row.get(7)?,
        reply_to_message_id: parse_opt_col(row, 8)?,
        reply_to_message: row.get(9)?,
        message_state: state_col(row, 10)?,
    })
}
