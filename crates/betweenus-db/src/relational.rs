use rusqlite::{Connection, params};
use tracing::debug;

use betweenus_types::{RoomId, UserId, UserProfile};

use crate::error::{StoreError, StoreResult};
use crate::{Database, OptionalExt};

/// Friendship rows and their pointer to the shared chat room.
///
/// Implementations must be safe to call from the blocking thread pool.
pub trait RelationalStore: Send + Sync {
    /// Room pointer for the pair, looking at both directions.
    fn lookup_room_id(&self, user_id: &UserId, friend_id: &UserId) -> StoreResult<Option<RoomId>>;

    /// Point both friendship directions at `room_id`.
    ///
    /// Returns `false` when no friendship row exists for the pair. Fails with
    /// [`StoreError::Conflict`] when the pointer is already set to a
    /// different room.
    fn set_room_id(&self, user_id: &UserId, friend_id: &UserId, room_id: RoomId) -> StoreResult<bool>;

    fn clear_room_id(&self, user_id: &UserId, friend_id: &UserId) -> StoreResult<()>;

    fn user_profile(&self, user_id: &UserId) -> StoreResult<Option<UserProfile>>;
}

pub struct SqliteRelationalStore {
    db: Database,
}

impl SqliteRelationalStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn create_user(&self, profile: &UserProfile) -> StoreResult<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, full_name, profile_url) VALUES (?1, ?2, ?3, ?4)",
                params![
                    profile.id.as_str(),
                    profile.username,
                    profile.full_name,
                    profile.profile_url
                ],
            )?;
            Ok(())
        })
    }

    /// Record an accepted friendship in both directions.
    pub fn add_friendship(&self, user_id: &UserId, friend_id: &UserId) -> StoreResult<()> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            for (a, b) in [(user_id, friend_id), (friend_id, user_id)] {
                tx.execute(
                    "INSERT OR IGNORE INTO friendships (user_id, friend_id) VALUES (?1, ?2)",
                    params![a.as_str(), b.as_str()],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }
}

const PAIR_CLAUSE: &str =
    "((user_id = ?1 AND friend_id = ?2) OR (user_id = ?2 AND friend_id = ?1))";

impl RelationalStore for SqliteRelationalStore {
    fn lookup_room_id(&self, user_id: &UserId, friend_id: &UserId) -> StoreResult<Option<RoomId>> {
        self.db.with_conn(|conn| query_room_id(conn, user_id, friend_id))
    }

    fn set_room_id(&self, user_id: &UserId, friend_id: &UserId, room_id: RoomId) -> StoreResult<bool> {
        self.db.with_conn(|conn| {
            let room = room_id.to_string();
            let updated = conn.execute(
                &format!(
                    "UPDATE friendships SET room_id = ?3
                     WHERE {PAIR_CLAUSE} AND (room_id IS NULL OR room_id = ?3)"
                ),
                params![user_id.as_str(), friend_id.as_str(), room],
            )?;

            if updated > 0 {
                debug!("Room pointer {} set for {} <-> {}", room_id, user_id, friend_id);
                return Ok(true);
            }

            // Nothing updated: either no friendship, or a different pointer
            match query_room_id(conn, user_id, friend_id)? {
                Some(existing) => Err(StoreError::Conflict(format!(
                    "room pointer for {} <-> {} already set to {}",
                    user_id, friend_id, existing
                ))),
                None => Ok(false),
            }
        })
    }

    fn clear_room_id(&self, user_id: &UserId, friend_id: &UserId) -> StoreResult<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                &format!("UPDATE friendships SET room_id = NULL WHERE {PAIR_CLAUSE}"),
                params![user_id.as_str(), friend_id.as_str()],
            )?;
            Ok(())
        })
    }

    fn user_profile(&self, user_id: &UserId) -> StoreResult<Option<UserProfile>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, username, full_name, profile_url FROM users WHERE id = ?1",
                [user_id.as_str()],
                |row| {
                    Ok(UserProfile {
                        id: UserId::new(row.get::<_, String>(0)?),
                        username: row.get(1)?,
                        full_name: row.get(2)?,
                        profile_url: row.get(3)?,
                    })
                },
            )
            .optional()
        })
    }
}

fn query_room_id(conn: &Connection, user_id: &UserId, friend_id: &UserId) -> StoreResult<Option<RoomId>> {
    let raw: Option<String> = conn
        .query_row(
            &format!(
                "SELECT room_id FROM friendships
                 WHERE {PAIR_CLAUSE} AND room_id IS NOT NULL
                 LIMIT 1"
            ),
            params![user_id.as_str(), friend_id.as_str()],
            |row| row.get(0),
        )
        .optional()?;

    raw.map(|s| s.parse().map_err(|_| StoreError::corrupt("friendships.room_id", s)))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Schema;

    fn profile(id: &str) -> UserProfile {
        UserProfile {
            id: id.into(),
            username: format!("{id}-name"),
            full_name: format!("{id} full"),
            profile_url: None,
        }
    }

    fn store_with_friends() -> SqliteRelationalStore {
        let store = SqliteRelationalStore::new(Database::open_in_memory(Schema::Relational).unwrap());
        store.create_user(&profile("u1")).unwrap();
        store.create_user(&profile("u2")).unwrap();
        store.create_user(&profile("u3")).unwrap();
        store.add_friendship(&"u1".into(), &"u2".into()).unwrap();
        store
    }

    #[test]
    fn pointer_round_trips_in_both_directions() {
        let store = store_with_friends();
        let (u1, u2) = (UserId::from("u1"), UserId::from("u2"));
        let room = RoomId::for_pair(&u1, &u2);

        assert_eq!(store.lookup_room_id(&u1, &u2).unwrap(), None);
        assert!(store.set_room_id(&u1, &u2, room).unwrap());
        assert_eq!(store.lookup_room_id(&u2, &u1).unwrap(), Some(room));

        // Same id again is a no-op success
        assert!(store.set_room_id(&u2, &u1, room).unwrap());

        store.clear_room_id(&u2, &u1).unwrap();
        assert_eq!(store.lookup_room_id(&u1, &u2).unwrap(), None);
    }

    #[test]
    fn different_pointer_is_a_conflict() {
        let store = store_with_friends();
        let (u1, u2) = (UserId::from("u1"), UserId::from("u2"));
        store.set_room_id(&u1, &u2, RoomId::for_pair(&u1, &u2)).unwrap();

        let other = RoomId::from_uuid(uuid::Uuid::new_v4());
        let err = store.set_room_id(&u1, &u2, other).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn strangers_have_no_row_to_update() {
        let store = store_with_friends();
        let (u1, u3) = (UserId::from("u1"), UserId::from("u3"));
        assert!(!store.set_room_id(&u1, &u3, RoomId::for_pair(&u1, &u3)).unwrap());
    }

    #[test]
    fn profiles_are_readable() {
        let store = store_with_friends();
        let p = store.user_profile(&"u2".into()).unwrap().unwrap();
        assert_eq!(p.full_name, "u2 full");
        assert!(store.user_profile(&"ghost".into()).unwrap().is_none());
    }

    #[test]
    fn duplicate_username_is_a_conflict() {
        let store = store_with_friends();
        let mut dup = profile("u9");
        dup.username = "u1-name".into();
        assert!(store.create_user(&dup).unwrap_err().is_conflict());
    }
}
