use std::sync::Arc;

use betweenus_db::{DocumentStore, RelationalStore};
use betweenus_gateway::{MessageFeedRegistry, RetryPolicy, RoomListRegistry};

use crate::saga::ChatRoomCreationSaga;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub documents: Arc<dyn DocumentStore>,
    pub saga: ChatRoomCreationSaga,
    pub registry: RoomListRegistry,
    pub message_feeds: MessageFeedRegistry,
}

impl AppStateInner {
    /// The relational store is only reached through the saga.
    pub fn new(
        relational: Arc<dyn RelationalStore>,
        documents: Arc<dyn DocumentStore>,
        retry: RetryPolicy,
    ) -> AppState {
        Arc::new(Self {
            saga: ChatRoomCreationSaga::new(relational, documents.clone()),
            registry: RoomListRegistry::new(documents.clone(), retry),
            message_feeds: MessageFeedRegistry::new(documents.clone(), retry),
            documents,
        })
    }
}
