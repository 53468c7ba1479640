//! Live push of chat state to connected clients.
//!
//! Each client channel is registered with a [`ConnectionRegistry`], which
//! keeps one change watcher per key and re-renders that key's view, once per
//! distinct window, whenever the document store reports a matching change.
//! Two topics exist: a user's room list and one room's conversation.

pub mod channel;
pub mod connection;
pub mod registry;
pub mod topic;
pub mod watcher;

pub use channel::{ChannelError, ConnectionId, PushChannel, SocketChannel};
pub use connection::{
    ConnectRejection, WindowQuery, connect_params, handle_connection, reject_connection, room_connect_params,
};
pub use registry::{ConnectionRegistry, MessageFeedRegistry, RoomListRegistry, SnapshotError};
pub use topic::{RoomList, RoomMessages, Topic};
pub use watcher::RetryPolicy;
