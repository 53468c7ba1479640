use serde::{Deserialize, Serialize};

use crate::models::{MessageId, MessageState, MessageType, RoomId, UserId};

// -- Chat rooms --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateChatRoomRequest {
    pub user_id: UserId,
    pub friends_id: UserId,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChatRoomResponse {
    pub chat_room_id: RoomId,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SendMessageRequest {
    pub from_uid: UserId,
    pub to_uid: UserId,
    pub message: String,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub reply_to_message_id: Option<MessageId>,
    #[serde(default)]
    pub reply_to_message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AcknowledgeRequest {
    #[serde(default)]
    pub message_id: Option<MessageId>,
    #[serde(default)]
    pub message_ids: Option<Vec<MessageId>>,
    pub state: MessageState,
}

impl AcknowledgeRequest {
    /// All ids named by the request, single and batch combined.
    pub fn ids(&self) -> Vec<MessageId> {
        let mut ids: Vec<MessageId> = self.message_ids.clone().unwrap_or_default();
        if let Some(id) = self.message_id {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AcknowledgeResponse {
    pub updated: u64,
}

// -- Errors --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub message: String,
    pub code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Compensation failures from a partially applied saga; any entry here
    /// means the two stores need manual reconciliation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rollback_errors: Vec<String>,
}

// -- Diagnostics --

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub total_connections: usize,
    pub connected_users: Vec<UserId>,
    pub active_watchers: Vec<UserId>,
    pub connections_per_user: std::collections::BTreeMap<UserId, usize>,
    #[serde(default)]
    pub message_feeds: MessageFeedDiagnostics,
}

/// Per-room conversation channels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageFeedDiagnostics {
    pub total_connections: usize,
    pub watched_rooms: Vec<RoomId>,
    pub active_watchers: Vec<RoomId>,
    pub connections_per_room: std::collections::BTreeMap<RoomId, usize>,
}
