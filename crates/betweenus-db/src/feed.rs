use std::fmt;

use thiserror::Error;
use tokio::sync::broadcast;

use betweenus_types::{RoomId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    Rooms,
    Messages,
}

/// One committed write in the document store.
///
/// Carries identities only, never the document body: subscribers are
/// expected to re-read current state rather than patch from events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub operation: ChangeOperation,
    pub collection: Collection,
    pub room_id: RoomId,
    pub participants: [UserId; 2],
    /// Epoch milliseconds
    pub at: i64,
}

impl ChangeEvent {
    pub fn new(
        operation: ChangeOperation,
        collection: Collection,
        room_id: RoomId,
        participants: [UserId; 2],
    ) -> Self {
        Self {
            operation,
            collection,
            room_id,
            participants,
            at: betweenus_types::models::now_millis(),
        }
    }

    pub fn involves(&self, user_id: &UserId) -> bool {
        self.participants.iter().any(|p| p == user_id)
    }
}

/// Predicate applied to a subscription before events reach the subscriber.
pub struct ChangeFilter(Box<dyn Fn(&ChangeEvent) -> bool + Send + Sync>);

impl ChangeFilter {
    pub fn new(f: impl Fn(&ChangeEvent) -> bool + Send + Sync + 'static) -> Self {
        Self(Box::new(f))
    }

    pub fn all() -> Self {
        Self::new(|_| true)
    }

    /// Room writes where `user_id` is either participant.
    pub fn rooms_involving(user_id: UserId) -> Self {
        Self::new(move |event| event.collection == Collection::Rooms && event.involves(&user_id))
    }

    /// Message writes in one room, including the room's deletion.
    pub fn messages_in(room_id: RoomId) -> Self {
        Self::new(move |event| event.collection == Collection::Messages && event.room_id == room_id)
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        (self.0)(event)
    }
}

impl fmt::Debug for ChangeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChangeFilter(..)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("change feed lagged, {0} events dropped")]
    Lagged(u64),
    #[error("change feed closed")]
    Closed,
}

/// Live, filtered view of the change feed. Dropping it (or calling
/// [`ChangeSubscription::close`]) releases the store-side receiver.
#[derive(Debug)]
pub struct ChangeSubscription {
    rx: broadcast::Receiver<ChangeEvent>,
    filter: ChangeFilter,
}

impl ChangeSubscription {
    pub fn new(rx: broadcast::Receiver<ChangeEvent>, filter: ChangeFilter) -> Self {
        Self { rx, filter }
    }

    /// Wait for the next event that passes the filter.
    pub async fn next(&mut self) -> Result<ChangeEvent, FeedError> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(&event) => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => return Err(FeedError::Lagged(n)),
                Err(broadcast::error::RecvError::Closed) => return Err(FeedError::Closed),
            }
        }
    }

    pub fn close(self) {
        drop(self);
    }
}

/// Fan-out point for committed document writes.
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: ChangeEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self, filter: ChangeFilter) -> ChangeSubscription {
        ChangeSubscription::new(self.tx.subscribe(), filter)
    }

    /// Number of open subscriptions.
    pub fn active_subscriptions(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(1024)
    }
}
