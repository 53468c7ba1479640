use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::{debug, info};

use betweenus_gateway::WindowQuery;
use betweenus_types::api::{AcknowledgeRequest, AcknowledgeResponse, SendMessageRequest};
use betweenus_types::models::now_millis;
use betweenus_types::{Message, MessageId, MessageState, RoomId};

use crate::error::ApiError;
use crate::state::AppState;

/// Store a message in an existing room. Both ends must be the room's
/// participants; the message starts out as sent.
pub async fn send_message(
    State(state): State<AppState>,
    Path(room_id): Path<RoomId>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let documents = state.documents.clone();
    let message = tokio::task::spawn_blocking(move || {
        let room = documents
            .get_room(room_id)?
            .ok_or_else(|| ApiError::NotFound(format!("Chat room {} not found", room_id)))?;

        if req.from_uid == req.to_uid || !room.involves(&req.from_uid) || !room.involves(&req.to_uid) {
            return Err(ApiError::BadRequest(
                "fromUid and toUid must be the room's participants".into(),
            ));
        }

        let message = Message {
            id: MessageId::new(),
            chat_room_id: room_id,
            from_uid: req.from_uid,
            to_uid: req.to_uid,
            message: req.message,
            timestamp: now_millis(),
            message_type: req.message_type,
            media_url: req.media_url,
            reply_to_message_id: req.reply_to_message_id,
            reply_to_message: req.reply_to_message,
            message_state: MessageState::Sent,
        };
        documents.insert_message(&message)?;
        Ok::<_, ApiError>(message)
    })
    .await
    .map_err(ApiError::join)??;

    debug!("Message {} stored in room {}", message.id, room_id);
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(room_id): Path<RoomId>,
    Query(query): Query<WindowQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let window = query.window()?;
    let documents = state.documents.clone();
    let page = tokio::task::spawn_blocking(move || documents.messages_for_room(room_id, window))
        .await
        .map_err(ApiError::join)??;
    Ok(Json(page))
}

pub async fn acknowledge(
    State(state): State<AppState>,
    Path(room_id): Path<RoomId>,
    Json(req): Json<AcknowledgeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ids = req.ids();
    if ids.is_empty() {
        return Err(ApiError::BadRequest("messageId or messageIds is required".into()));
    }

    let documents = state.documents.clone();
    let target = req.state;
    let updated =
        tokio::task::spawn_blocking(move || documents.acknowledge_messages(room_id, &ids, target))
            .await
            .map_err(ApiError::join)??;

    info!("{} messages in room {} acknowledged as {:?}", updated, room_id, target);
    Ok(Json(AcknowledgeResponse { updated }))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use crate::fixtures::{Stores, get, post};

    async fn room(app: &axum::Router) -> String {
        let (_, body) = post(
            app,
            "/chats",
            json!({"userId": "u1", "friendsId": "u2", "message": "hi"}),
        )
        .await;
        body["chatRoomId"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn send_and_page_messages() {
        let app = Stores::new().router();
        let room = room(&app).await;

        let (status, body) = post(
            &app,
            &format!("/chats/{room}/messages"),
            json!({"fromUid": "u2", "toUid": "u1", "message": "hey", "messageType": "TEXT"}),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["messageState"], "SENT");

        let (status, body) = get(&app, &format!("/chats/{room}/messages?page=1&size=1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["message"], "hey");
        assert_eq!(body["pagination"]["totalItems"], 2);
        assert_eq!(body["pagination"]["totalPages"], 2);
        assert_eq!(body["pagination"]["hasNext"], true);
    }

    #[tokio::test]
    async fn send_checks_room_and_participants() {
        let app = Stores::new().router();
        let room = room(&app).await;

        let (status, _) = post(
            &app,
            &format!("/chats/{room}/messages"),
            json!({"fromUid": "u3", "toUid": "u1", "message": "sneaky"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let missing = uuid_like();
        let (status, body) = post(
            &app,
            &format!("/chats/{missing}/messages"),
            json!({"fromUid": "u1", "toUid": "u2", "message": "lost"}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], 404);
    }

    #[tokio::test]
    async fn acknowledge_moves_state_forward_only() {
        let app = Stores::new().router();
        let room = room(&app).await;
        let (_, page) = get(&app, &format!("/chats/{room}/messages")).await;
        let id = page["data"][0]["id"].as_str().unwrap().to_string();
        let ack = format!("/chats/{room}/messages/acknowledge");

        let (status, body) = post(&app, &ack, json!({"messageId": id, "state": "READ"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["updated"], 1);

        let (_, body) = post(&app, &ack, json!({"messageIds": [id], "state": "DELIVERED"})).await;
        assert_eq!(body["updated"], 0);

        let (_, rooms) = get(&app, "/users/u1/chats").await;
        assert_eq!(rooms["data"][0]["messageState"], "READ");
        assert_eq!(rooms["data"][0]["unreadCount"], 0);

        let (status, _) = post(&app, &ack, json!({"state": "READ"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    fn uuid_like() -> String {
        "00000000-0000-0000-0000-000000000001".to_string()
    }
}
