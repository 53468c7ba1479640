use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{ChatRoom, Message, RoomId, now_millis};
use crate::pagination::{Page, PageInfo, PaginationError, PaginationWindow};

pub const INVALID_PAGINATION_FORMAT: &str = "Invalid pagination request format";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameKind {
    /// First snapshot sent right after a channel registers
    InitialData,
    /// Snapshot recomputed after a store change or window change
    UpdateData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRoomsData {
    pub chat_rooms: Vec<ChatRoom>,
}

/// One window of a room's conversation, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesData {
    pub chat_room_id: RoomId,
    pub messages: Vec<Message>,
    pub pagination: PageInfo,
}

/// Envelope for everything pushed from server to client on a live channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame<D> {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    pub data: D,
    /// Epoch milliseconds
    pub timestamp: i64,
}

/// Room list push on `/ws/chats`.
pub type ServerFrame = Frame<ChatRoomsData>;

/// Conversation push on `/ws/chats/{roomId}/messages`.
pub type MessagesFrame = Frame<MessagesData>;

impl<D> Frame<D> {
    fn wrap(kind: FrameKind, data: D) -> Self {
        Self {
            kind,
            data,
            timestamp: now_millis(),
        }
    }
}

impl Frame<ChatRoomsData> {
    pub fn new(kind: FrameKind, chat_rooms: Vec<ChatRoom>) -> Self {
        Self::wrap(kind, ChatRoomsData { chat_rooms })
    }
}

impl Frame<MessagesData> {
    pub fn new(kind: FrameKind, chat_room_id: RoomId, page: Page<Message>) -> Self {
        Self::wrap(
            kind,
            MessagesData {
                chat_room_id,
                messages: page.data,
                pagination: page.pagination,
            },
        )
    }
}

/// Error reply to a bad control frame. The channel stays open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Client -> server control frame asking for a different window.
#[derive(Debug, Clone, Deserialize)]
pub struct PaginationCommand {
    pub page: i64,
    pub size: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlFrameError {
    /// Not JSON, or not shaped like `{ "page": int, "size": int }`
    #[error("malformed pagination command")]
    Malformed,
    /// Well formed but outside the allowed bounds
    #[error(transparent)]
    OutOfRange(PaginationError),
}

impl ControlFrameError {
    pub fn to_frame(&self) -> ErrorFrame {
        ErrorFrame {
            error: INVALID_PAGINATION_FORMAT.to_string(),
            details: match self {
                Self::Malformed => None,
                Self::OutOfRange(e) => Some(e.to_string()),
            },
        }
    }
}

/// Parse an inbound text frame into a validated window.
pub fn parse_pagination_frame(text: &str) -> Result<PaginationWindow, ControlFrameError> {
    let cmd: PaginationCommand =
        serde_json::from_str(text).map_err(|_| ControlFrameError::Malformed)?;
    PaginationWindow::new(cmd.page, cmd.size).map_err(ControlFrameError::OutOfRange)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_matches_wire_format() {
        let frame = ServerFrame::new(FrameKind::InitialData, vec![]);
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "INITIAL_DATA");
        assert!(json["data"]["chatRooms"].as_array().unwrap().is_empty());
        assert!(json["timestamp"].as_i64().unwrap() > 0);

        let update = serde_json::to_value(ServerFrame::new(FrameKind::UpdateData, vec![])).unwrap();
        assert_eq!(update["type"], "UPDATE_DATA");
    }

    #[test]
    fn messages_envelope_carries_room_and_page() {
        let room = RoomId::for_pair(&"u1".into(), &"u2".into());
        let page = Page::new(vec![], PaginationWindow::default(), 0);
        let json = serde_json::to_value(MessagesFrame::new(FrameKind::UpdateData, room, page)).unwrap();
        assert_eq!(json["type"], "UPDATE_DATA");
        assert_eq!(json["data"]["chatRoomId"], room.to_string());
        assert!(json["data"]["messages"].as_array().unwrap().is_empty());
        assert_eq!(json["data"]["pagination"]["totalPages"], 1);
    }

    #[test]
    fn control_frames_parse_into_windows() {
        let w = parse_pagination_frame(r#"{"page":2,"size":5}"#).unwrap();
        assert_eq!((w.page(), w.size()), (2, 5));
    }

    #[test]
    fn garbage_is_malformed() {
        assert_eq!(parse_pagination_frame("hello"), Err(ControlFrameError::Malformed));
        assert_eq!(parse_pagination_frame(r#"{"page":"one","size":5}"#), Err(ControlFrameError::Malformed));
        assert_eq!(parse_pagination_frame(r#"{"size":5}"#), Err(ControlFrameError::Malformed));
    }

    #[test]
    fn bounds_violations_carry_details() {
        let err = parse_pagination_frame(r#"{"page":1,"size":500}"#).unwrap_err();
        assert!(matches!(err, ControlFrameError::OutOfRange(PaginationError::InvalidSize(500))));

        let frame = err.to_frame();
        assert_eq!(frame.error, INVALID_PAGINATION_FORMAT);
        assert!(frame.details.is_some());

        let malformed = serde_json::to_value(ControlFrameError::Malformed.to_frame()).unwrap();
        assert_eq!(malformed, serde_json::json!({ "error": INVALID_PAGINATION_FORMAT }));
    }
}
