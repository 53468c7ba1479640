//! HTTP surface of the chat core: room creation through the saga, room and
//! message listing, acknowledgements and registry diagnostics.

pub mod error;
pub mod messages;
pub mod rooms;
pub mod saga;
pub mod state;

#[cfg(test)]
mod fixtures;

use axum::{
    Router,
    routing::{get, post},
};

pub use error::ApiError;
pub use saga::{ChatRoomCreationSaga, SagaError, SagaResult};
pub use state::{AppState, AppStateInner};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/chats", post(rooms::create_room))
        .route("/users/{user_id}/chats", get(rooms::list_rooms))
        .route("/chats/{room_id}/messages", get(messages::get_messages))
        .route("/chats/{room_id}/messages", post(messages::send_message))
        .route("/chats/{room_id}/messages/acknowledge", post(messages::acknowledge))
        .route("/diagnostics", get(rooms::diagnostics))
        .with_state(state)
}
