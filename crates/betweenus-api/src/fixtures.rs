use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use tower::ServiceExt;

use betweenus_db::{ChangeFeed, Database, Schema, SqliteDocumentStore, SqliteRelationalStore};
use betweenus_gateway::RetryPolicy;
use betweenus_types::UserProfile;

use crate::saga::ChatRoomCreationSaga;
use crate::state::{AppState, AppStateInner};

/// In-memory stores with users u1, u2 and u3, where only u1 and u2 are friends.
pub(crate) struct Stores {
    pub relational: Arc<SqliteRelationalStore>,
    pub documents: Arc<SqliteDocumentStore>,
}

impl Stores {
    pub fn new() -> Self {
        let relational =
            SqliteRelationalStore::new(Database::open_in_memory(Schema::Relational).unwrap());
        for id in ["u1", "u2", "u3"] {
            relational
                .create_user(&UserProfile {
                    id: id.into(),
                    username: id.to_string(),
                    full_name: format!("User {id}"),
                    profile_url: None,
                })
                .unwrap();
        }
        relational.add_friendship(&"u1".into(), &"u2".into()).unwrap();

        let documents = SqliteDocumentStore::new(
            Database::open_in_memory(Schema::Documents).unwrap(),
            ChangeFeed::new(64),
        );
        Self {
            relational: Arc::new(relational),
            documents: Arc::new(documents),
        }
    }

    pub fn saga(&self) -> ChatRoomCreationSaga {
        ChatRoomCreationSaga::new(self.relational.clone(), self.documents.clone())
    }

    pub fn state(&self) -> AppState {
        AppStateInner::new(
            self.relational.clone(),
            self.documents.clone(),
            RetryPolicy::default(),
        )
    }

    pub fn router(&self) -> Router {
        crate::router(self.state())
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

pub(crate) async fn get(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    send(app, Request::get(uri).body(Body::empty()).unwrap()).await
}

pub(crate) async fn post(
    app: &Router,
    uri: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let request = Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(app, request).await
}
