use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for room ids. Same as the RFC 4122 DNS namespace.
const ROOM_NAMESPACE: Uuid = Uuid::NAMESPACE_DNS;

/// Opaque user identifier, as issued by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(Uuid);

impl RoomId {
    /// Deterministic id for the unordered pair `(a, b)`.
    ///
    /// Both argument orders yield the same id, so retried or concurrent room
    /// creation for one pair always converges on a single room.
    pub fn for_pair(a: &UserId, b: &UserId) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        let name = format!("{}:{}", low, high);
        Self(Uuid::new_v5(&ROOM_NAMESPACE, name.as_bytes()))
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for RoomId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Delivery state shared by rooms (for their last message) and messages.
/// Ordered: a message only ever moves forward through these states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageState {
    #[default]
    Pending,
    Sent,
    Delivered,
    Read,
}

impl MessageState {
    /// Stable integer rank used for storage and forward-only comparisons.
    pub fn rank(self) -> i64 {
        match self {
            Self::Pending => 0,
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Read => 3,
        }
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            0 => Some(Self::Pending),
            1 => Some(Self::Sent),
            2 => Some(Self::Delivered),
            3 => Some(Self::Read),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    Video,
    Audio,
    File,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Image => "IMAGE",
            Self::Video => "VIDEO",
            Self::Audio => "AUDIO",
            Self::File => "FILE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TEXT" => Some(Self::Text),
            "IMAGE" => Some(Self::Image),
            "VIDEO" => Some(Self::Video),
            "AUDIO" => Some(Self::Audio),
            "FILE" => Some(Self::File),
            _ => None,
        }
    }
}

/// Display data for one user, read from the relational store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    pub full_name: String,
    pub profile_url: Option<String>,
}

/// One-to-one chat room document.
///
/// Participant display fields are denormalized so a room list renders
/// without a join against the relational store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRoom {
    pub id: RoomId,
    pub user_id: UserId,
    pub friend_id: UserId,
    pub user_name: String,
    pub friend_user_name: String,
    pub user_full_name: String,
    pub friend_full_name: String,
    pub user_profile_url: String,
    pub friend_profile_url: String,
    pub last_message_id: Option<MessageId>,
    pub last_message: Option<String>,
    pub last_message_time: Option<i64>,
    pub message_state: MessageState,
    pub unread_count: u32,
    pub is_pinned: bool,
    pub is_archived: bool,
}

impl ChatRoom {
    /// New, empty room between `user` (the creator) and `friend`.
    pub fn new(id: RoomId, user: &UserProfile, friend: &UserProfile) -> Self {
        Self {
            id,
            user_id: user.id.clone(),
            friend_id: friend.id.clone(),
            user_name: user.username.clone(),
            friend_user_name: friend.username.clone(),
            user_full_name: user.full_name.clone(),
            friend_full_name: friend.full_name.clone(),
            user_profile_url: user.profile_url.clone().unwrap_or_default(),
            friend_profile_url: friend.profile_url.clone().unwrap_or_default(),
            last_message_id: None,
            last_message: None,
            last_message_time: None,
            message_state: MessageState::Pending,
            unread_count: 0,
            is_pinned: false,
            is_archived: false,
        }
    }

    pub fn involves(&self, user_id: &UserId) -> bool {
        &self.user_id == user_id || &self.friend_id == user_id
    }

    pub fn participants(&self) -> [UserId; 2] {
        [self.user_id.clone(), self.friend_id.clone()]
    }

    /// Unique key for the unordered participant pair.
    pub fn pair_key(&self) -> String {
        pair_key(&self.user_id, &self.friend_id)
    }
}

pub fn pair_key(a: &UserId, b: &UserId) -> String {
    if a <= b {
        format!("{}:{}", a, b)
    } else {
        format!("{}:{}", b, a)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub chat_room_id: RoomId,
    pub from_uid: UserId,
    pub to_uid: UserId,
    pub message: String,
    pub timestamp: i64,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub reply_to_message_id: Option<MessageId>,
    #[serde(default)]
    pub reply_to_message: Option<String>,
    #[serde(default)]
    pub message_state: MessageState,
}

impl Message {
    /// Plain text message stamped with the current time, already marked sent.
    pub fn text(room_id: RoomId, from: &UserId, to: &UserId, text: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            chat_room_id: room_id,
            from_uid: from.clone(),
            to_uid: to.clone(),
            message: text.into(),
            timestamp: now_millis(),
            message_type: MessageType::Text,
            media_url: None,
            reply_to_message_id: None,
            reply_to_message: None,
            message_state: MessageState::Sent,
        }
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_id_ignores_argument_order() {
        let a = UserId::from("u1");
        let b = UserId::from("u2");
        assert_eq!(RoomId::for_pair(&a, &b), RoomId::for_pair(&b, &a));
        assert_ne!(RoomId::for_pair(&a, &b), RoomId::for_pair(&a, &UserId::from("u3")));
    }

    #[test]
    fn room_id_is_v5_over_sorted_pair() {
        let id = RoomId::for_pair(&UserId::from("u2"), &UserId::from("u1"));
        let expected = Uuid::new_v5(&Uuid::NAMESPACE_DNS, b"u1:u2");
        assert_eq!(id.as_uuid(), expected);
        assert_eq!(id.as_uuid().get_version_num(), 5);
    }

    #[test]
    fn message_state_is_ordered() {
        assert!(MessageState::Pending < MessageState::Sent);
        assert!(MessageState::Delivered < MessageState::Read);
        for state in [
            MessageState::Pending,
            MessageState::Sent,
            MessageState::Delivered,
            MessageState::Read,
        ] {
            assert_eq!(MessageState::from_rank(state.rank()), Some(state));
        }
        assert_eq!(MessageState::from_rank(9), None);
    }

    #[test]
    fn chat_room_serializes_camel_case() {
        let user = UserProfile {
            id: "u1".into(),
            username: "ann".into(),
            full_name: "Ann A".into(),
            profile_url: None,
        };
        let friend = UserProfile {
            id: "u2".into(),
            username: "bob".into(),
            full_name: "Bob B".into(),
            profile_url: Some("https://img/bob".into()),
        };
        let room = ChatRoom::new(RoomId::for_pair(&user.id, &friend.id), &user, &friend);
        let json = serde_json::to_value(&room).unwrap();
        assert_eq!(json["friendFullName"], "Bob B");
        assert_eq!(json["userProfileUrl"], "");
        assert_eq!(json["messageState"], "PENDING");
        assert_eq!(json["isPinned"], false);
    }
}
