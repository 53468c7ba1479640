//! Room creation across the relational and document stores.
//!
//! The two stores share no transaction, so creation runs as a saga: the
//! relational pointer is written first and cleared again if the document
//! writes fail. A crash between those two steps leaves a pointer with no
//! room behind it; the next creation for the pair repairs that on read.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use betweenus_db::{DocumentStore, RelationalStore, StoreError};
use betweenus_types::{ChatRoom, Message, RoomId, UserId, UserProfile};

#[derive(Debug, Error)]
pub enum SagaError {
    #[error("{0}")]
    Validation(String),
    #[error("user {0} not found")]
    UserNotFound(UserId),
    #[error("{0} and {1} are not friends")]
    NotFriends(UserId, UserId),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("saga task failed: {0}")]
    Join(String),
}

/// Outcome of a saga: either both sides committed, or the primary cause
/// plus every compensation step that itself failed.
#[derive(Debug)]
pub enum SagaResult<T, R> {
    Success { relational: T, document: R },
    Failure { error: SagaError, rollback_errors: Vec<StoreError> },
}

impl<T, R> SagaResult<T, R> {
    fn failure(error: impl Into<SagaError>) -> Self {
        Self::Failure {
            error: error.into(),
            rollback_errors: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn document(&self) -> Option<&R> {
        match self {
            Self::Success { document, .. } => Some(document),
            Self::Failure { .. } => None,
        }
    }
}

pub type RoomCreation = SagaResult<(), RoomId>;

#[derive(Clone)]
pub struct ChatRoomCreationSaga {
    relational: Arc<dyn RelationalStore>,
    documents: Arc<dyn DocumentStore>,
}

impl ChatRoomCreationSaga {
    pub fn new(relational: Arc<dyn RelationalStore>, documents: Arc<dyn DocumentStore>) -> Self {
        Self {
            relational,
            documents,
        }
    }

    /// Create the room for a pair, or append to it if it already exists.
    pub async fn create_room(&self, user_id: UserId, friend_id: UserId, message: String) -> RoomCreation {
        let saga = self.clone();
        match tokio::task::spawn_blocking(move || saga.run(&user_id, &friend_id, &message)).await {
            Ok(result) => result,
            Err(e) => {
                error!("spawn_blocking join error: {}", e);
                SagaResult::failure(SagaError::Join(e.to_string()))
            }
        }
    }

    /// Blocking body of [`Self::create_room`].
    pub fn run(&self, user_id: &UserId, friend_id: &UserId, message: &str) -> RoomCreation {
        if user_id.is_blank() || friend_id.is_blank() {
            return SagaResult::failure(SagaError::Validation(
                "userId and friendsId are required".into(),
            ));
        }
        if user_id == friend_id {
            return SagaResult::failure(SagaError::Validation(
                "cannot create a chat room with yourself".into(),
            ));
        }

        let (me, friend) = match self.profiles(user_id, friend_id) {
            Ok(profiles) => profiles,
            Err(e) => return SagaResult::failure(e),
        };

        match self.relational.lookup_room_id(user_id, friend_id) {
            Ok(Some(existing)) => return self.append_or_repair(existing, &me, &friend, message),
            Ok(None) => {}
            Err(e) => return SagaResult::failure(e),
        }

        let room_id = RoomId::for_pair(user_id, friend_id);

        // Phase 1: relational pointer, both directions
        match self.relational.set_room_id(user_id, friend_id, room_id) {
            Ok(true) => {}
            Ok(false) => {
                return SagaResult::failure(SagaError::NotFriends(user_id.clone(), friend_id.clone()));
            }
            Err(e) if e.is_conflict() => {
                debug!("Room pointer for {} <-> {} set concurrently", user_id, friend_id);
                return match self.relational.lookup_room_id(user_id, friend_id) {
                    Ok(Some(existing)) => self.append_or_repair(existing, &me, &friend, message),
                    Ok(None) => SagaResult::failure(e),
                    Err(lookup) => SagaResult::failure(lookup),
                };
            }
            Err(e) => return SagaResult::failure(e),
        }

        // Phase 2: room and first message
        let result = self.write_documents(room_id, &me, &friend, message);
        if result.is_success() {
            info!("Chat room {} created for {} <-> {}", room_id, user_id, friend_id);
        }
        result
    }

    fn profiles(&self, user_id: &UserId, friend_id: &UserId) -> Result<(UserProfile, UserProfile), SagaError> {
        let me = self
            .relational
            .user_profile(user_id)?
            .ok_or_else(|| SagaError::UserNotFound(user_id.clone()))?;
        let friend = self
            .relational
            .user_profile(friend_id)?
            .ok_or_else(|| SagaError::UserNotFound(friend_id.clone()))?;
        Ok((me, friend))
    }

    /// Fast path for a pair that already has a pointer. A pointer whose room
    /// is missing is treated as no room and recreated under the same id.
    fn append_or_repair(
        &self,
        room_id: RoomId,
        me: &UserProfile,
        friend: &UserProfile,
        message: &str,
    ) -> RoomCreation {
        match self.documents.get_room(room_id) {
            Ok(Some(_)) => self.append(room_id, me, friend, message),
            Ok(None) => {
                warn!(
                    "Orphaned room pointer {} for {} <-> {}, recreating room",
                    room_id, me.id, friend.id
                );
                self.write_documents(room_id, me, friend, message)
            }
            Err(e) => SagaResult::failure(e),
        }
    }

    fn append(&self, room_id: RoomId, me: &UserProfile, friend: &UserProfile, message: &str) -> RoomCreation {
        match self
            .documents
            .insert_message(&Message::text(room_id, &me.id, &friend.id, message))
        {
            Ok(message_id) => {
                debug!("Appended message {} to existing room {}", message_id, room_id);
                SagaResult::Success {
                    relational: (),
                    document: room_id,
                }
            }
            Err(e) => SagaResult::failure(e),
        }
    }

    fn write_documents(
        &self,
        room_id: RoomId,
        me: &UserProfile,
        friend: &UserProfile,
        message: &str,
    ) -> RoomCreation {
        match self.documents.insert_room(&ChatRoom::new(room_id, me, friend)) {
            Ok(_) => {}
            // Another invocation for the same pair got there first
            Err(e) if e.is_conflict() => {
                debug!("Room {} already written, appending instead", room_id);
                return self.append(room_id, me, friend, message);
            }
            Err(e) => return self.compensate(e.into(), &me.id, &friend.id, None),
        }

        match self
            .documents
            .insert_message(&Message::text(room_id, &me.id, &friend.id, message))
        {
            Ok(_) => SagaResult::Success {
                relational: (),
                document: room_id,
            },
            Err(e) => self.compensate(e.into(), &me.id, &friend.id, Some(room_id)),
        }
    }

    /// Undo what Phase 1 (and possibly the room insert) committed. Each step
    /// runs once; its failure is recorded, never retried.
    fn compensate(
        &self,
        error: SagaError,
        user_id: &UserId,
        friend_id: &UserId,
        written_room: Option<RoomId>,
    ) -> RoomCreation {
        warn!(
            "Chat room creation for {} <-> {} failed, rolling back: {}",
            user_id, friend_id, error
        );
        let mut rollback_errors = Vec::new();

        if let Some(room_id) = written_room {
            if let Err(e) = self.documents.delete_room_and_messages(room_id) {
                error!("Rollback of room {} failed: {}", room_id, e);
                rollback_errors.push(e);
            }
        }
        if let Err(e) = self.relational.clear_room_id(user_id, friend_id) {
            error!("Rollback of room pointer for {} <-> {} failed: {}", user_id, friend_id, e);
            rollback_errors.push(e);
        }

        SagaResult::Failure {
            error,
            rollback_errors,
        }
    }
}
