use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use betweenus_db::{DocumentStore, StoreError};
use betweenus_types::api::{Diagnostics, MessageFeedDiagnostics};
use betweenus_types::PaginationWindow;
use betweenus_types::events::FrameKind;

use crate::channel::{ConnectionId, PushChannel};
use crate::topic::{RoomList, RoomMessages, Topic};
use crate::watcher::{self, RetryPolicy, WatcherHandle};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("snapshot task failed: {0}")]
    Join(String),
    #[error("snapshot encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One registered push channel and the window it is currently looking at.
pub struct ConnectionEntry<K> {
    channel: Arc<dyn PushChannel>,
    key: K,
    window: RwLock<PaginationWindow>,
    live: AtomicBool,
}

impl<K> ConnectionEntry<K> {
    fn new(key: K, window: PaginationWindow, channel: Arc<dyn PushChannel>) -> Self {
        Self {
            channel,
            key,
            window: RwLock::new(window),
            live: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.channel.id()
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire) && self.channel.is_active()
    }

    pub async fn window(&self) -> PaginationWindow {
        *self.window.read().await
    }

    fn mark_dead(&self) {
        self.live.store(false, Ordering::Release);
    }
}

/// Tracks every push channel per key, owns the per-key change watchers,
/// and fans recomputed snapshots out to channels.
///
/// A key's watcher is started by the first connection and stopped when the
/// last one goes away; nothing else starts or stops it.
pub struct ConnectionRegistry<T: Topic = RoomList> {
    inner: Arc<RegistryInner<T>>,
}

/// Room list channels, one watcher per user.
pub type RoomListRegistry = ConnectionRegistry<RoomList>;

/// Conversation channels, one watcher per room.
pub type MessageFeedRegistry = ConnectionRegistry<RoomMessages>;

impl<T: Topic> Clone for ConnectionRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct RegistryInner<T: Topic> {
    documents: Arc<dyn DocumentStore>,
    retry: RetryPolicy,
    /// Connections and watchers share one lock so their lifetimes move together
    state: Mutex<RegistryState<T>>,
}

struct RegistryState<T: Topic> {
    connections: HashMap<T::Key, Vec<Arc<ConnectionEntry<T::Key>>>>,
    watchers: HashMap<T::Key, WatcherHandle>,
}

impl<T: Topic> Default for RegistryState<T> {
    fn default() -> Self {
        Self {
            connections: HashMap::new(),
            watchers: HashMap::new(),
        }
    }
}

/// Point-in-time counts behind the diagnostics endpoint.
struct Counts<K> {
    total_connections: usize,
    per_key: BTreeMap<K, usize>,
    watchers: Vec<K>,
}

impl<T: Topic> ConnectionRegistry<T> {
    pub fn new(documents: Arc<dyn DocumentStore>, retry: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                documents,
                retry,
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    pub(crate) fn documents(&self) -> &Arc<dyn DocumentStore> {
        &self.inner.documents
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        self.inner.retry
    }

    /// Register a channel, send it an initial snapshot, and make sure the
    /// key has a running watcher.
    pub async fn add_connection(&self, key: T::Key, window: PaginationWindow, channel: Arc<dyn PushChannel>) {
        let entry = Arc::new(ConnectionEntry::new(key.clone(), window, channel));

        let total = {
            let mut state = self.inner.state.lock().await;
            state
                .connections
                .entry(key.clone())
                .or_default()
                .push(entry.clone());
            state.connections.values().map(Vec::len).sum::<usize>()
        };
        info!(
            "{} {} connected for {} ({}). Total connections: {}",
            T::KEY_NAME,
            key,
            T::WATCHES,
            entry.id(),
            total
        );

        self.push_snapshot(&entry, FrameKind::InitialData).await;
        self.ensure_watcher(&key).await;
    }

    /// Start a watcher for `key` unless one is already running or the key
    /// has no connections left.
    async fn ensure_watcher(&self, key: &T::Key) {
        let mut state = self.inner.state.lock().await;

        let connected = state.connections.get(key).is_some_and(|set| !set.is_empty());
        if !connected {
            return;
        }
        if let Some(watcher) = state.watchers.get(key).filter(|w| !w.is_finished()) {
            watcher.note_join();
            return;
        }

        let handle = watcher::spawn(self.clone(), key.clone());
        debug!("Watcher {} registered for {} {}", handle.id(), T::KEY_NAME, key);
        state.watchers.insert(key.clone(), handle);
    }

    /// Replace the window of one channel. Other channels of the same key
    /// keep theirs. The channel gets a fresh snapshot for its new window.
    ///
    /// Returns `false` if the channel is not registered under `key`.
    pub async fn update_connection_pagination(
        &self,
        key: &T::Key,
        window: PaginationWindow,
        channel: &dyn PushChannel,
    ) -> bool {
        let Some(entry) = self.find_entry(key, channel.id()).await else {
            warn!("Pagination update for unknown connection {} of {} {}", channel.id(), T::KEY_NAME, key);
            return false;
        };

        *entry.window.write().await = window;
        debug!(
            "Connection {} of {} {} now at page {} size {}",
            entry.id(),
            T::KEY_NAME,
            key,
            window.page(),
            window.size()
        );

        self.push_snapshot(&entry, FrameKind::UpdateData).await;
        true
    }

    pub async fn remove_connection(&self, key: &T::Key, channel: &dyn PushChannel) {
        let removed = self.purge(key, &[channel.id()]).await;
        info!(
            "{} {} disconnected ({}), {} entries removed. Total connections: {}",
            T::KEY_NAME,
            key,
            channel.id(),
            removed,
            self.total_connections().await
        );
    }

    /// Drop the given connections; stop the key's watcher if none remain.
    async fn purge(&self, key: &T::Key, ids: &[ConnectionId]) -> usize {
        let (removed, stopped) = {
            let mut state = self.inner.state.lock().await;
            let Some(set) = state.connections.get_mut(key) else {
                return 0;
            };

            let before = set.len();
            set.retain(|entry| !ids.contains(&entry.id()));
            let removed = before - set.len();

            if set.is_empty() {
                state.connections.remove(key);
                (removed, state.watchers.remove(key))
            } else {
                (removed, None)
            }
        };

        if let Some(handle) = stopped {
            handle.cancel();
            info!("Stopped watching {} for {} {} - no more connections", T::WATCHES, T::KEY_NAME, key);
        }
        removed
    }

    /// Recompute and push an update to every live channel of `key`.
    /// Returns how many channels it reached.
    pub async fn broadcast(&self, key: &T::Key) -> usize {
        // Snapshot membership; delivery happens without the lock
        let entries: Vec<Arc<ConnectionEntry<T::Key>>> = {
            let state = self.inner.state.lock().await;
            match state.connections.get(key) {
                Some(set) => set.clone(),
                None => return 0,
            }
        };

        let mut rendered: HashMap<PaginationWindow, Bytes> = HashMap::new();
        let mut failed: Vec<ConnectionId> = Vec::new();
        let mut delivered = 0;

        for entry in &entries {
            if !entry.is_live() {
                debug!("Connection {} of {} {} inactive", entry.id(), T::KEY_NAME, key);
                failed.push(entry.id());
                continue;
            }

            let window = entry.window().await;
            let payload = match rendered.get(&window) {
                Some(payload) => payload.clone(),
                None => match self.render(key, window, FrameKind::UpdateData).await {
                    Ok(payload) => {
                        rendered.insert(window, payload.clone());
                        payload
                    }
                    Err(e) => {
                        error!("Error computing {} for {} {}: {}", T::WATCHES, T::KEY_NAME, key, e);
                        continue;
                    }
                },
            };

            match entry.channel.send(payload) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!("Error sending to {} {}: {}", T::KEY_NAME, key, e);
                    entry.mark_dead();
                    failed.push(entry.id());
                }
            }
        }

        if !failed.is_empty() {
            let purged = self.purge(key, &failed).await;
            info!("Purged {} dead connections of {} {}", purged, T::KEY_NAME, key);
        }
        delivered
    }

    /// Render and send one snapshot to a single entry.
    async fn push_snapshot(&self, entry: &ConnectionEntry<T::Key>, kind: FrameKind) {
        let window = entry.window().await;
        let payload = match self.render(&entry.key, window, kind).await {
            Ok(payload) => payload,
            Err(e) => {
                error!("Error sending {:?} to {} {}: {}", kind, T::KEY_NAME, entry.key, e);
                return;
            }
        };

        if let Err(e) = entry.channel.send(payload) {
            warn!("Snapshot for {} {} not delivered: {}", T::KEY_NAME, entry.key, e);
            entry.mark_dead();
        }
    }

    async fn render(&self, key: &T::Key, window: PaginationWindow, kind: FrameKind) -> Result<Bytes, SnapshotError> {
        let documents = self.inner.documents.clone();
        let key = key.clone();
        tokio::task::spawn_blocking(move || T::render(documents.as_ref(), &key, window, kind))
            .await
            .map_err(|e| SnapshotError::Join(e.to_string()))?
    }

    async fn find_entry(&self, key: &T::Key, id: ConnectionId) -> Option<Arc<ConnectionEntry<T::Key>>> {
        let state = self.inner.state.lock().await;
        state
            .connections
            .get(key)?
            .iter()
            .find(|entry| entry.id() == id)
            .cloned()
    }

    pub async fn has_connections(&self, key: &T::Key) -> bool {
        let state = self.inner.state.lock().await;
        state.connections.get(key).is_some_and(|set| !set.is_empty())
    }

    async fn total_connections(&self) -> usize {
        let state = self.inner.state.lock().await;
        state.connections.values().map(Vec::len).sum()
    }

    /// Called by a watcher that has used up its retries. Deregisters it
    /// under the state lock unless a connection joined since its last
    /// success, in which case the watcher must keep going.
    pub(crate) async fn retire_watcher(&self, key: &T::Key, watcher_id: Uuid) -> bool {
        let mut state = self.inner.state.lock().await;
        match state.watchers.get(key) {
            Some(w) if w.id() == watcher_id => {
                if w.take_join() {
                    return false;
                }
                state.watchers.remove(key);
                debug!("Watcher {} for {} {} retired", watcher_id, T::KEY_NAME, key);
                true
            }
            // Already replaced or removed
            _ => true,
        }
    }

    /// Called by a watcher on its way out. Only removes the registration if
    /// it still belongs to that watcher; a newer one may have replaced it.
    pub(crate) async fn watcher_exited(&self, key: &T::Key, watcher_id: Uuid) {
        let mut state = self.inner.state.lock().await;
        if state.watchers.get(key).is_some_and(|w| w.id() == watcher_id) {
            state.watchers.remove(key);
            debug!("Watcher {} for {} {} deregistered", watcher_id, T::KEY_NAME, key);
        }
    }

    #[cfg(test)]
    pub(crate) async fn watcher_id(&self, key: &T::Key) -> Option<Uuid> {
        let state = self.inner.state.lock().await;
        state.watchers.get(key).map(WatcherHandle::id)
    }

    async fn counts(&self) -> Counts<T::Key> {
        let state = self.inner.state.lock().await;

        let per_key: BTreeMap<T::Key, usize> = state
            .connections
            .iter()
            .map(|(key, set)| (key.clone(), set.len()))
            .collect();
        let mut watchers: Vec<T::Key> = state.watchers.keys().cloned().collect();
        watchers.sort();

        Counts {
            total_connections: per_key.values().sum(),
            per_key,
            watchers,
        }
    }
}

impl ConnectionRegistry<RoomList> {
    pub async fn diagnostics(&self) -> Diagnostics {
        let counts = self.counts().await;
        Diagnostics {
            total_connections: counts.total_connections,
            connected_users: counts.per_key.keys().cloned().collect(),
            active_watchers: counts.watchers,
            connections_per_user: counts.per_key,
            message_feeds: MessageFeedDiagnostics::default(),
        }
    }
}

impl ConnectionRegistry<RoomMessages> {
    pub async fn diagnostics(&self) -> MessageFeedDiagnostics {
        let counts = self.counts().await;
        MessageFeedDiagnostics {
            total_connections: counts.total_connections,
            watched_rooms: counts.per_key.keys().cloned().collect(),
            active_watchers: counts.watchers,
            connections_per_room: counts.per_key,
        }
    }
}
