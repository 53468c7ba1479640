//! Value objects shared by the stores, the push gateway and the HTTP layer.

pub mod api;
pub mod events;
pub mod models;
pub mod pagination;

pub use models::{ChatRoom, Message, MessageId, MessageState, MessageType, RoomId, UserId, UserProfile};
pub use pagination::{Page, PageInfo, PaginationError, PaginationWindow};
