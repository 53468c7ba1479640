//! Store wrappers that fail on demand, for exercising compensation and
//! retry paths in other crates' tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use betweenus_types::{
    ChatRoom, Message, MessageId, MessageState, Page, PaginationWindow, RoomId, UserId, UserProfile,
};

use crate::documents::DocumentStore;
use crate::error::{StoreError, StoreResult};
use crate::feed::{ChangeFilter, ChangeSubscription};
use crate::relational::RelationalStore;

fn injected(op: &str) -> StoreError {
    StoreError::Unavailable(format!("injected failure: {op}"))
}

#[derive(Default)]
pub struct RelationalFaults {
    pub set_room_id: AtomicBool,
    pub clear_room_id: AtomicBool,
    pub lookup_room_id: AtomicBool,
    /// Number of upcoming `lookup_room_id` calls that report no pointer
    pub stale_lookups: AtomicU32,
}

pub struct FaultyRelationalStore {
    inner: Arc<dyn RelationalStore>,
    pub faults: RelationalFaults,
}

impl FaultyRelationalStore {
    pub fn new(inner: Arc<dyn RelationalStore>) -> Self {
        Self {
            inner,
            faults: RelationalFaults::default(),
        }
    }
}

impl RelationalStore for FaultyRelationalStore {
    fn lookup_room_id(&self, user_id: &UserId, friend_id: &UserId) -> StoreResult<Option<RoomId>> {
        if self.faults.lookup_room_id.load(Ordering::SeqCst) {
            return Err(injected("lookup_room_id"));
        }
        let stale = self.faults.stale_lookups.load(Ordering::SeqCst);
        if stale > 0 {
            self.faults.stale_lookups.store(stale - 1, Ordering::SeqCst);
            return Ok(None);
        }
        self.inner.lookup_room_id(user_id, friend_id)
    }

    fn set_room_id(&self, user_id: &UserId, friend_id: &UserId, room_id: RoomId) -> StoreResult<bool> {
        if self.faults.set_room_id.load(Ordering::SeqCst) {
            return Err(injected("set_room_id"));
        }
        self.inner.set_room_id(user_id, friend_id, room_id)
    }

    fn clear_room_id(&self, user_id: &UserId, friend_id: &UserId) -> StoreResult<()> {
        if self.faults.clear_room_id.load(Ordering::SeqCst) {
            return Err(injected("clear_room_id"));
        }
        self.inner.clear_room_id(user_id, friend_id)
    }

    fn user_profile(&self, user_id: &UserId) -> StoreResult<Option<UserProfile>> {
        self.inner.user_profile(user_id)
    }
}

#[derive(Default)]
pub struct DocumentFaults {
    pub insert_room: AtomicBool,
    pub insert_message: AtomicBool,
    pub delete_room: AtomicBool,
    pub rooms_for_user: AtomicBool,
    /// Number of upcoming `subscribe_changes` calls that fail
    pub subscribe_failures: AtomicU32,
}

pub struct FaultyDocumentStore {
    inner: Arc<dyn DocumentStore>,
    pub faults: DocumentFaults,
    subscribe_attempts: AtomicU32,
}

impl FaultyDocumentStore {
    pub fn new(inner: Arc<dyn DocumentStore>) -> Self {
        Self {
            inner,
            faults: DocumentFaults::default(),
            subscribe_attempts: AtomicU32::new(0),
        }
    }

    pub fn fail_subscriptions(&self, times: u32) {
        self.faults.subscribe_failures.store(times, Ordering::SeqCst);
    }

    pub fn subscribe_attempts(&self) -> u32 {
        self.subscribe_attempts.load(Ordering::SeqCst)
    }
}

impl DocumentStore for FaultyDocumentStore {
    fn insert_room(&self, room: &ChatRoom) -> StoreResult<RoomId> {
        if self.faults.insert_room.load(Ordering::SeqCst) {
            return Err(injected("insert_room"));
        }
        self.inner.insert_room(room)
    }

    fn insert_message(&self, message: &Message) -> StoreResult<MessageId> {
        if self.faults.insert_message.load(Ordering::SeqCst) {
            return Err(injected("insert_message"));
        }
        self.inner.insert_message(message)
    }

    fn delete_room_and_messages(&self, room_id: RoomId) -> StoreResult<()> {
        if self.faults.delete_room.load(Ordering::SeqCst) {
            return Err(injected("delete_room_and_messages"));
        }
        self.inner.delete_room_and_messages(room_id)
    }

    fn get_room(&self, room_id: RoomId) -> StoreResult<Option<ChatRoom>> {
        self.inner.get_room(room_id)
    }

    fn rooms_for_user(&self, user_id: &UserId, window: PaginationWindow) -> StoreResult<Page<ChatRoom>> {
        if self.faults.rooms_for_user.load(Ordering::SeqCst) {
            return Err(injected("rooms_for_user"));
        }
        self.inner.rooms_for_user(user_id, window)
    }

    fn messages_for_room(&self, room_id: RoomId, window: PaginationWindow) -> StoreResult<Page<Message>> {
        self.inner.messages_for_room(room_id, window)
    }

    fn acknowledge_messages(&self, room_id: RoomId, ids: &[MessageId], state: MessageState) -> StoreResult<u64> {
        self.inner.acknowledge_messages(room_id, ids, state)
    }

    fn subscribe_changes(&self, filter: ChangeFilter) -> StoreResult<ChangeSubscription> {
        self.subscribe_attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.faults.subscribe_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.faults
                .subscribe_failures
                .store(remaining.saturating_sub(1), Ordering::SeqCst);
            return Err(injected("subscribe_changes"));
        }
        self.inner.subscribe_changes(filter)
    }
}
