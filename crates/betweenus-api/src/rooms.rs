use axum::{
    Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use tracing::debug;

use betweenus_gateway::WindowQuery;
use betweenus_types::api::{CreateChatRoomRequest, CreateChatRoomResponse};
use betweenus_types::UserId;

use crate::error::ApiError;
use crate::saga::SagaResult;
use crate::state::AppState;

pub async fn create_room(
    State(state): State<AppState>,
    Json(req): Json<CreateChatRoomRequest>,
) -> Result<impl IntoResponse, ApiError> {
    match state
        .saga
        .create_room(req.user_id, req.friends_id, req.message)
        .await
    {
        SagaResult::Success { document, .. } => Ok(Json(CreateChatRoomResponse {
            chat_room_id: document,
        })),
        SagaResult::Failure {
            error,
            rollback_errors,
        } => Err(ApiError::saga(error, rollback_errors)),
    }
}

pub async fn list_rooms(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    Query(query): Query<WindowQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if user_id.is_blank() {
        return Err(ApiError::BadRequest("userId is required".into()));
    }
    let window = query.window()?;

    let documents = state.documents.clone();
    let page = tokio::task::spawn_blocking(move || documents.rooms_for_user(&user_id, window))
        .await
        .map_err(ApiError::join)??;

    debug!(
        "Listed {} of {} rooms (page {})",
        page.data.len(),
        page.pagination.total_items,
        page.pagination.current_page
    );
    Ok(Json(page))
}

pub async fn diagnostics(State(state): State<AppState>) -> impl IntoResponse {
    let mut diagnostics = state.registry.diagnostics().await;
    diagnostics.message_feeds = state.message_feeds.diagnostics().await;
    Json(diagnostics)
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use std::sync::Arc;

    use betweenus_gateway::SocketChannel;
    use betweenus_types::{PaginationWindow, RoomId};

    use crate::fixtures::{Stores, get, post};

    #[tokio::test]
    async fn create_then_list() {
        let stores = Stores::new();
        let app = stores.router();

        let (status, body) = post(
            &app,
            "/chats",
            json!({"userId": "u1", "friendsId": "u2", "message": "hi"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let expected = RoomId::for_pair(&"u1".into(), &"u2".into()).to_string();
        assert_eq!(body["chatRoomId"], expected.as_str());

        let (status, body) = get(&app, "/users/u2/chats?page=1&size=5").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["id"], expected.as_str());
        assert_eq!(body["data"][0]["lastMessage"], "hi");
        assert_eq!(body["pagination"]["totalItems"], 1);
        assert_eq!(body["pagination"]["hasNext"], false);
    }

    #[tokio::test]
    async fn create_maps_saga_failures() {
        let stores = Stores::new();
        let app = stores.router();

        let (status, body) = post(
            &app,
            "/chats",
            json!({"userId": "u1", "friendsId": "u1", "message": "me"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 400);

        let (status, _) = post(
            &app,
            "/chats",
            json!({"userId": "u1", "friendsId": "u3", "message": "hi"}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_rejects_bad_window() {
        let app = Stores::new().router();
        let (status, body) = get(&app, "/users/u1/chats?page=0").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["details"].as_str().unwrap().contains("Page"));

        let (status, _) = get(&app, "/users/u1/chats?size=101").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Non-numeric values get the same JSON error body
        let (status, body) = get(&app, "/users/u1/chats?page=abc").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 400);
        assert!(body["details"].as_str().unwrap().contains("abc"));
    }

    #[tokio::test]
    async fn diagnostics_start_empty() {
        let app = Stores::new().router();
        let (status, body) = get(&app, "/diagnostics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalConnections"], 0);
        assert!(body["activeWatchers"].as_array().unwrap().is_empty());
        assert_eq!(body["messageFeeds"]["totalConnections"], 0);
        assert!(body["messageFeeds"]["watchedRooms"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn diagnostics_report_both_channel_kinds() {
        let stores = Stores::new();
        let state = stores.state();
        let app = crate::router(state.clone());
        let room = RoomId::for_pair(&"u1".into(), &"u2".into());

        let (list, _list_rx) = SocketChannel::new();
        let (feed, _feed_rx) = SocketChannel::new();
        state
            .registry
            .add_connection("u1".into(), PaginationWindow::default(), Arc::new(list))
            .await;
        state
            .message_feeds
            .add_connection(room, PaginationWindow::default(), Arc::new(feed))
            .await;

        let (_, body) = get(&app, "/diagnostics").await;
        assert_eq!(body["totalConnections"], 1);
        assert_eq!(body["connectedUsers"][0], "u1");
        assert_eq!(body["messageFeeds"]["totalConnections"], 1);
        assert_eq!(body["messageFeeds"]["watchedRooms"][0], room.to_string());
        assert_eq!(body["messageFeeds"]["connectionsPerRoom"][room.to_string()], 1);
    }
}
