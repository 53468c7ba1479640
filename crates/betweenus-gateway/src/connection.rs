use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use betweenus_types::events::{ErrorFrame, parse_pagination_frame};
use betweenus_types::{PaginationError, PaginationWindow, RoomId, UserId};

use crate::channel::{PushChannel, SocketChannel};
use crate::registry::ConnectionRegistry;
use crate::topic::Topic;

/// Server sends a Ping every 15 seconds; two missed Pongs drop the socket.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Optional window carried on a query string. Values stay raw so that a
/// non-numeric one is reported by validation rather than by the extractor.
#[derive(Debug, Default, Deserialize)]
pub struct WindowQuery {
    pub page: Option<String>,
    pub size: Option<String>,
}

impl WindowQuery {
    /// Missing fields fall back to page 1 and the default page size.
    pub fn window(&self) -> Result<PaginationWindow, PaginationError> {
        PaginationWindow::from_query(self.page.as_deref(), self.size.as_deref())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectRejection {
    #[error("User ID is required")]
    MissingUserId,
    #[error("Personal Chat Room ID is required")]
    MissingRoomId,
    #[error("invalid chat room id {0:?}")]
    InvalidRoomId(String),
    #[error(transparent)]
    InvalidWindow(#[from] PaginationError),
}

/// Resolve who is connecting and what they want to see first.
pub fn connect_params(
    user_id: Option<&str>,
    query: &WindowQuery,
) -> Result<(UserId, PaginationWindow), ConnectRejection> {
    let user_id = match user_id.map(UserId::from) {
        Some(id) if !id.is_blank() => id,
        _ => return Err(ConnectRejection::MissingUserId),
    };
    Ok((user_id, query.window()?))
}

/// Resolve which conversation a message channel follows.
pub fn room_connect_params(
    room_id: Option<&str>,
    query: &WindowQuery,
) -> Result<(RoomId, PaginationWindow), ConnectRejection> {
    let raw = match room_id.map(str::trim) {
        Some(raw) if !raw.is_empty() => raw,
        _ => return Err(ConnectRejection::MissingRoomId),
    };
    let room_id = raw
        .parse()
        .map_err(|_| ConnectRejection::InvalidRoomId(raw.to_string()))?;
    Ok((room_id, query.window()?))
}

/// Close an upgraded socket that failed `connect_params`.
pub async fn reject_connection(mut socket: WebSocket, reason: ConnectRejection) {
    warn!("Rejecting live connection: {}", reason);
    let frame = CloseFrame {
        code: close_code::UNSUPPORTED,
        reason: reason.to_string().into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!("Close frame not delivered: {}", e);
    }
}

/// Drive one live socket until either side goes away.
pub async fn handle_connection<T: Topic>(
    socket: WebSocket,
    registry: ConnectionRegistry<T>,
    key: T::Key,
    window: PaginationWindow,
) {
    let (mut sender, mut receiver) = socket.split();
    let (channel, mut outbound) = SocketChannel::new();
    let channel = Arc::new(channel);

    info!("{} {} connected to {} gateway ({})", T::KEY_NAME, key, T::WATCHES, channel.id());
    registry.add_connection(key.clone(), window, channel.clone()).await;

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                payload = outbound.recv() => {
                    let Some(payload) = payload else { break };
                    let text = match String::from_utf8(payload.to_vec()) {
                        Ok(text) => text,
                        Err(e) => {
                            error!("Dropping non-UTF-8 frame: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let recv_registry = registry.clone();
    let recv_key = key.clone();
    let recv_channel = channel.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    handle_control_frame(&recv_registry, &recv_key, recv_channel.as_ref(), text.as_str())
                        .await;
                }
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    channel.mark_inactive();
    registry.remove_connection(&key, channel.as_ref()).await;
    info!("{} {} disconnected from {} gateway ({})", T::KEY_NAME, key, T::WATCHES, channel.id());
}

/// Apply one inbound text frame. Anything but a valid pagination command
/// gets an error frame back; the connection and its window are left alone.
pub async fn handle_control_frame<T: Topic>(
    registry: &ConnectionRegistry<T>,
    key: &T::Key,
    channel: &dyn PushChannel,
    text: &str,
) {
    match parse_pagination_frame(text) {
        Ok(window) => {
            if !registry.update_connection_pagination(key, window, channel).await {
                warn!("{} {} sent pagination for unregistered connection {}", T::KEY_NAME, key, channel.id());
            }
        }
        Err(e) => {
            warn!(
                "{} {} bad pagination frame: {} -- raw: {}",
                T::KEY_NAME,
                key,
                e,
                text.chars().take(200).collect::<String>()
            );
            send_error(channel, &e.to_frame());
        }
    }
}

fn send_error(channel: &dyn PushChannel, frame: &ErrorFrame) {
    match serde_json::to_vec(frame) {
        Ok(body) => {
            if let Err(e) = channel.send(Bytes::from(body)) {
                debug!("Error frame not delivered: {}", e);
            }
        }
        Err(e) => error!("Failed to encode error frame: {}", e),
    }
}
