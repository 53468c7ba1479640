mod config;

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, Query, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use betweenus_api::{AppState, AppStateInner};
use betweenus_db::{ChangeFeed, Database, Schema, SqliteDocumentStore, SqliteRelationalStore};
use betweenus_gateway::{
    WindowQuery, connect_params, handle_connection, reject_connection, room_connect_params,
};

use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "betweenus=debug,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;

    let relational = SqliteRelationalStore::new(Database::open(&config.relational_db, Schema::Relational)?);
    let documents = SqliteDocumentStore::new(
        Database::open(&config.document_db, Schema::Documents)?,
        ChangeFeed::new(config.feed_capacity),
    );
    let state: AppState = AppStateInner::new(
        Arc::new(relational),
        Arc::new(documents),
        config.retry_policy(),
    );

    let ws_route = Router::new()
        .route("/ws/chats", get(ws_upgrade_query))
        .route("/ws/chats/{id}", get(ws_upgrade))
        .route("/ws/chats/{id}/messages", get(ws_upgrade_messages))
        .with_state(state.clone());

    let app = Router::new()
        .merge(betweenus_api::router(state))
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = config.addr()?;
    info!("BetweenUs chat core listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(serde::Deserialize)]
struct ChatQuery {
    #[serde(rename = "userId")]
    user_id: Option<String>,
    page: Option<String>,
    size: Option<String>,
}

async fn ws_upgrade(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(window): Query<WindowQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade(state, ws, Some(user_id), window)
}

/// Same channel, with the user id carried on the query string.
async fn ws_upgrade_query(
    State(state): State<AppState>,
    Query(query): Query<ChatQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let window = WindowQuery {
        page: query.page,
        size: query.size,
    };
    upgrade(state, ws, query.user_id, window)
}

fn upgrade(
    state: AppState,
    ws: WebSocketUpgrade,
    user_id: Option<String>,
    window: WindowQuery,
) -> impl IntoResponse {
    let params = connect_params(user_id.as_deref(), &window);
    ws.on_upgrade(move |socket| async move {
        match params {
            Ok((user_id, window)) => {
                handle_connection(socket, state.registry.clone(), user_id, window).await
            }
            Err(reason) => reject_connection(socket, reason).await,
        }
    })
}

/// Live conversation of one room.
async fn ws_upgrade_messages(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(window): Query<WindowQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let params = room_connect_params(Some(room_id.as_str()), &window);
    ws.on_upgrade(move |socket| async move {
        match params {
            Ok((room_id, window)) => {
                handle_connection(socket, state.message_feeds.clone(), room_id, window).await
            }
            Err(reason) => reject_connection(socket, reason).await,
        }
    })
}
