use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

pub type ConnectionId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel {0} is closed")]
    Closed(ConnectionId),
}

/// What the registry needs from a client connection, and nothing more.
pub trait PushChannel: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Queue one serialized frame for delivery.
    fn send(&self, payload: Bytes) -> Result<(), ChannelError>;

    fn is_active(&self) -> bool;
}

/// Channel backed by an mpsc queue that a socket's send task drains.
#[derive(Debug, Clone)]
pub struct SocketChannel {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Bytes>,
    active: Arc<AtomicBool>,
}

impl SocketChannel {
    /// Returns the channel and the receiving end for the socket writer.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Self {
            id: Uuid::new_v4(),
            tx,
            active: Arc::new(AtomicBool::new(true)),
        };
        (channel, rx)
    }

    pub fn mark_inactive(&self) {
        self.active.store(false, Ordering::Release);
    }
}

impl PushChannel for SocketChannel {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, payload: Bytes) -> Result<(), ChannelError> {
        if !self.is_active() {
            return Err(ChannelError::Closed(self.id));
        }
        self.tx.send(payload).map_err(|_| ChannelError::Closed(self.id))
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) && !self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_reach_the_receiver() {
        let (channel, mut rx) = SocketChannel::new();
        channel.send(Bytes::from_static(b"{}")).unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"{}"));
        assert!(channel.is_active());
    }

    #[test]
    fn dropped_receiver_closes_the_channel() {
        let (channel, rx) = SocketChannel::new();
        drop(rx);
        assert!(!channel.is_active());
        assert_eq!(channel.send(Bytes::new()), Err(ChannelError::Closed(channel.id())));
    }

    #[test]
    fn marked_inactive_refuses_sends() {
        let (channel, _rx) = SocketChannel::new();
        channel.mark_inactive();
        assert!(!channel.is_active());
        assert!(channel.send(Bytes::new()).is_err());
    }
}
