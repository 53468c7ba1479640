use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use betweenus_db::{FeedError, StoreError};

use crate::registry::ConnectionRegistry;
use crate::topic::Topic;

/// Bounded linear backoff for re-establishing a change subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Wait before the attempt that follows failed attempt number `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

#[derive(Debug, Error)]
enum WatchError {
    #[error("subscribe failed: {0}")]
    Subscribe(#[from] StoreError),
    #[error("change stream failed: {0}")]
    Stream(#[from] FeedError),
}

pub(crate) struct WatcherHandle {
    id: Uuid,
    cancel: CancellationToken,
    /// Set when a connection joins while this watcher is running
    joined: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn note_join(&self) {
        self.joined.store(true, Ordering::Release);
    }

    pub(crate) fn take_join(&self) -> bool {
        self.joined.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the task to stop. It closes its subscription on the way out.
    pub(crate) fn cancel(self) {
        self.cancel.cancel();
    }
}

pub(crate) fn spawn<T: Topic>(registry: ConnectionRegistry<T>, key: T::Key) -> WatcherHandle {
    let id = Uuid::new_v4();
    let cancel = CancellationToken::new();
    let joined = Arc::new(AtomicBool::new(false));
    let watcher = ChangeStreamWatcher {
        id,
        key,
        registry,
        cancel: cancel.clone(),
        joined: joined.clone(),
    };
    let task = tokio::spawn(watcher.run());

    WatcherHandle {
        id,
        cancel,
        joined,
        task,
    }
}

enum WatchEnd {
    Cancelled,
    Failed { error: WatchError, delivered: u64 },
}

/// Keeps one key's channels current: holds a filtered change subscription
/// and re-broadcasts on every matching event, resubscribing under the
/// registry's retry policy when the subscription fails.
struct ChangeStreamWatcher<T: Topic> {
    id: Uuid,
    key: T::Key,
    registry: ConnectionRegistry<T>,
    cancel: CancellationToken,
    joined: Arc<AtomicBool>,
}

impl<T: Topic> ChangeStreamWatcher<T> {
    async fn run(self) {
        let policy = self.registry.retry_policy();
        let mut attempt: u32 = 0;
        info!("Starting to watch {} for {} {}", T::WATCHES, T::KEY_NAME, self.key);

        loop {
            if self.cancel.is_cancelled() || !self.registry.has_connections(&self.key).await {
                break;
            }

            match self.watch_once().await {
                WatchEnd::Cancelled => {
                    debug!("Watch for {} {} cancelled", T::KEY_NAME, self.key);
                    break;
                }
                WatchEnd::Failed { error, delivered } => {
                    // A subscription that carried events counts as a recovery
                    if delivered > 0 {
                        attempt = 0;
                        self.joined.store(false, Ordering::Release);
                    }
                    attempt += 1;
                    warn!(
                        "Error watching {} for {} {} (attempt {}/{}): {}",
                        T::WATCHES,
                        T::KEY_NAME,
                        self.key,
                        attempt,
                        policy.max_attempts,
                        error
                    );

                    if policy.exhausted(attempt) {
                        if self.registry.retire_watcher(&self.key, self.id).await {
                            warn!("Max retries reached for {} {}, stopping watch", T::KEY_NAME, self.key);
                            break;
                        }
                        // A connection joined mid-retry; it gets a full budget
                        info!("New connection for {} {}, restarting watch", T::KEY_NAME, self.key);
                        attempt = 0;
                        continue;
                    }

                    let delay = policy.delay_for(attempt);
                    info!("Retrying watch for {} {} in {:?}", T::KEY_NAME, self.key, delay);
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.registry.watcher_exited(&self.key, self.id).await;
        debug!("Watcher {} for {} {} exited", self.id, T::KEY_NAME, self.key);
    }

    /// Hold one subscription until it fails or the watcher is cancelled.
    async fn watch_once(&self) -> WatchEnd {
        let filter = T::filter(&self.key);
        let mut subscription = match self.registry.documents().subscribe_changes(filter) {
            Ok(subscription) => subscription,
            Err(e) => {
                return WatchEnd::Failed {
                    error: e.into(),
                    delivered: 0,
                };
            }
        };

        let mut delivered = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                next = subscription.next() => Some(next),
            };
            let Some(next) = next else {
                subscription.close();
                return WatchEnd::Cancelled;
            };

            match next {
                Ok(event) => trace!(
                    "{:?} on {:?} {} for {} {}",
                    event.operation,
                    event.collection,
                    event.room_id,
                    T::KEY_NAME,
                    self.key
                ),
                // Missed events still mean the view is stale; one refresh covers them
                Err(FeedError::Lagged(skipped)) => {
                    warn!("Watch for {} {} lagged by {} events", T::KEY_NAME, self.key, skipped)
                }
                Err(e) => {
                    subscription.close();
                    return WatchEnd::Failed {
                        error: e.into(),
                        delivered,
                    };
                }
            }

            let reached = self.registry.broadcast(&self.key).await;
            delivered += 1;
            trace!("Update for {} {} reached {} channels", T::KEY_NAME, self.key, reached);

            if self.cancel.is_cancelled() {
                subscription.close();
                return WatchEnd::Cancelled;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use betweenus_db::testing::FaultyDocumentStore;
    use betweenus_types::{PaginationWindow, RoomId, UserId};

    use crate::channel::SocketChannel;
    use crate::registry::tests::{next_frame, seeded_store};
    use crate::registry::{MessageFeedRegistry, RoomListRegistry};

    async fn wait_for_no_watchers(registry: &RoomListRegistry) {
        for _ in 0..100 {
            if registry.diagnostics().await.active_watchers.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        panic!("watcher never exited");
    }

    #[test]
    fn backoff_grows_linearly() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert!(!policy.exhausted(2));
        assert!(policy.exhausted(3));
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let policy = RetryPolicy::new(0, Duration::from_millis(10));
        assert_eq!(policy.max_attempts, 1);
        assert!(policy.exhausted(1));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts_and_restarts_on_new_connection() {
        let faulty = Arc::new(FaultyDocumentStore::new(seeded_store("u1", 1)));
        faulty.fail_subscriptions(3);
        let registry = RoomListRegistry::new(faulty.clone(), RetryPolicy::default());

        let (first, mut first_rx) = SocketChannel::new();
        registry
            .add_connection("u1".into(), PaginationWindow::default(), Arc::new(first))
            .await;
        assert_eq!(next_frame(&mut first_rx).await["type"], "INITIAL_DATA");

        wait_for_no_watchers(&registry).await;
        assert_eq!(faulty.subscribe_attempts(), 3);

        // The connection survives the dead watcher
        let diag = registry.diagnostics().await;
        assert_eq!(diag.total_connections, 1);
        assert!(diag.active_watchers.is_empty());

        // A later connection starts a fresh watcher, which now subscribes
        let (second, _second_rx) = SocketChannel::new();
        registry
            .add_connection("u1".into(), PaginationWindow::default(), Arc::new(second))
            .await;
        assert_eq!(
            registry.diagnostics().await.active_watchers,
            vec![UserId::from("u1")]
        );
        for _ in 0..100 {
            if faulty.subscribe_attempts() == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(faulty.subscribe_attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_joining_mid_retry_keeps_the_watcher_alive() {
        let faulty = Arc::new(FaultyDocumentStore::new(seeded_store("u1", 1)));
        faulty.fail_subscriptions(4);
        let registry = RoomListRegistry::new(faulty.clone(), RetryPolicy::default());

        let (first, _first_rx) = SocketChannel::new();
        registry
            .add_connection("u1".into(), PaginationWindow::default(), Arc::new(first))
            .await;

        // Inside the 4s backoff before the last attempt
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(faulty.subscribe_attempts(), 2);
        let (second, _second_rx) = SocketChannel::new();
        registry
            .add_connection("u1".into(), PaginationWindow::default(), Arc::new(second))
            .await;

        // Third attempt fails at 6s but the watcher stays: fourth fails
        // straight away, fifth subscribes after another 2s
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(faulty.subscribe_attempts(), 5);
        assert_eq!(
            registry.diagnostics().await.active_watchers,
            vec![UserId::from("u1")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retired_watcher_never_removes_its_successor() {
        let faulty = Arc::new(FaultyDocumentStore::new(seeded_store("u1", 1)));
        faulty.fail_subscriptions(3);
        let registry = RoomListRegistry::new(faulty.clone(), RetryPolicy::default());

        let (first, _first_rx) = SocketChannel::new();
        registry
            .add_connection("u1".into(), PaginationWindow::default(), Arc::new(first))
            .await;
        let u1 = UserId::from("u1");
        let first_id = registry.watcher_id(&u1).await.unwrap();

        wait_for_no_watchers(&registry).await;

        let (second, _second_rx) = SocketChannel::new();
        registry
            .add_connection("u1".into(), PaginationWindow::default(), Arc::new(second))
            .await;
        let second_id = registry.watcher_id(&u1).await.unwrap();
        assert_ne!(first_id, second_id);

        // The old task finishing later must not remove its successor
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(registry.watcher_id(&u1).await, Some(second_id));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_when_a_retry_succeeds() {
        let faulty = Arc::new(FaultyDocumentStore::new(seeded_store("u1", 1)));
        faulty.fail_subscriptions(2);
        let registry = RoomListRegistry::new(faulty.clone(), RetryPolicy::default());

        let (channel, _rx) = SocketChannel::new();
        registry
            .add_connection("u1".into(), PaginationWindow::default(), Arc::new(channel))
            .await;

        // 2s then 4s of backoff before the third attempt
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(faulty.subscribe_attempts(), 3);
        assert_eq!(
            registry.diagnostics().await.active_watchers,
            vec![UserId::from("u1")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn message_feed_watcher_retries_under_the_same_policy() {
        let faulty = Arc::new(FaultyDocumentStore::new(seeded_store("u1", 1)));
        faulty.fail_subscriptions(3);
        let registry = MessageFeedRegistry::new(faulty.clone(), RetryPolicy::default());
        let room = RoomId::for_pair(&"u1".into(), &"f00".into());

        let (channel, mut rx) = SocketChannel::new();
        registry
            .add_connection(room, PaginationWindow::default(), Arc::new(channel))
            .await;
        assert_eq!(next_frame(&mut rx).await["type"], "INITIAL_DATA");

        // 0s, 2s and 6s, then it gives up
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(faulty.subscribe_attempts(), 3);
        let diag = registry.diagnostics().await;
        assert!(diag.active_watchers.is_empty());
        assert_eq!(diag.total_connections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let faulty = Arc::new(FaultyDocumentStore::new(seeded_store("u1", 1)));
        faulty.fail_subscriptions(u32::MAX);
        let registry = RoomListRegistry::new(faulty.clone(), RetryPolicy::new(10, Duration::from_secs(60)));

        let (channel, _rx) = SocketChannel::new();
        let channel = Arc::new(channel);
        registry
            .add_connection("u1".into(), PaginationWindow::default(), channel.clone())
            .await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(faulty.subscribe_attempts(), 1);

        registry.remove_connection(&"u1".into(), channel.as_ref()).await;
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(faulty.subscribe_attempts(), 1);
        assert!(registry.diagnostics().await.active_watchers.is_empty());
    }
}
