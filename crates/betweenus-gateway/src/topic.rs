use std::fmt;
use std::hash::Hash;

use bytes::Bytes;

use betweenus_db::{ChangeFilter, DocumentStore};
use betweenus_types::events::{FrameKind, MessagesFrame, ServerFrame};
use betweenus_types::{PaginationWindow, RoomId, UserId};

use crate::registry::SnapshotError;

/// What a family of live channels follows: which store changes wake a key's
/// watcher, and how one window of current state is rendered for a channel.
pub trait Topic: Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Ord + fmt::Display + Send + Sync + 'static;

    /// Noun for the key in log lines
    const KEY_NAME: &'static str;
    /// What the channels are watching, for log lines
    const WATCHES: &'static str;

    fn filter(key: &Self::Key) -> ChangeFilter;

    /// Blocking; runs on the blocking pool.
    fn render(
        documents: &dyn DocumentStore,
        key: &Self::Key,
        window: PaginationWindow,
        kind: FrameKind,
    ) -> Result<Bytes, SnapshotError>;
}

/// A user's chat room list, newest activity first.
pub struct RoomList;

impl Topic for RoomList {
    type Key = UserId;

    const KEY_NAME: &'static str = "user";
    const WATCHES: &'static str = "chat rooms";

    fn filter(key: &UserId) -> ChangeFilter {
        ChangeFilter::rooms_involving(key.clone())
    }

    fn render(
        documents: &dyn DocumentStore,
        key: &UserId,
        window: PaginationWindow,
        kind: FrameKind,
    ) -> Result<Bytes, SnapshotError> {
        let page = documents.rooms_for_user(key, window)?;
        Ok(Bytes::from(serde_json::to_vec(&ServerFrame::new(kind, page.data))?))
    }
}

/// The conversation inside one chat room, newest message first.
pub struct RoomMessages;

impl Topic for RoomMessages {
    type Key = RoomId;

    const KEY_NAME: &'static str = "room";
    const WATCHES: &'static str = "messages";

    fn filter(key: &RoomId) -> ChangeFilter {
        ChangeFilter::messages_in(*key)
    }

    fn render(
        documents: &dyn DocumentStore,
        key: &RoomId,
        window: PaginationWindow,
        kind: FrameKind,
    ) -> Result<Bytes, SnapshotError> {
        let page = documents.messages_for_room(*key, window)?;
        Ok(Bytes::from(serde_json::to_vec(&MessagesFrame::new(kind, *key, page))?))
    }
}
