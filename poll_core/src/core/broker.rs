//! # Subscription Broker
//!
//! Fans committed poll snapshots out to every attached viewer of that poll.
//!
//! ## Delivery model
//!
//! 1.  **One watch channel per poll**: the channel holds the newest
//!     `Arc<Poll>`; every viewer owns its own receiver. Publishing replaces
//!     the held value and never waits on a receiver, so a slow or vanished
//!     viewer cannot stall the commit path or the other viewers.
//!
//! 2.  **Coalesce-to-latest**: a viewer that falls behind skips straight to
//!     the newest snapshot when it next polls. It can miss intermediate
//!     versions but never sees one twice.
//!
//! 3.  **No roll-back**: `publish` only replaces the held snapshot with a
//!     strictly newer version, so concurrent publishers that finish out of
//!     order cannot push a viewer backwards.
//!
//! 4.  **Linger**: when the last viewer leaves, the channel (and the cached
//!     snapshot in it) stays around for `linger_secs`. A viewer arriving in
//!     that window cancels the eviction and skips the store read.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::BrokerConfig;
use crate::errors::StoreError;
use crate::model::{Poll, PollId};
use crate::store::PollStore;

/// Handle identifying one viewer attachment.
pub type SubscriptionId = u64;

type Channels = Arc<Mutex<HashMap<PollId, PollChannel>>>;

#[derive(Debug)]
struct PollChannel {
    sender: watch::Sender<Arc<Poll>>,
    viewers: HashSet<SubscriptionId>,
    linger: CancellationToken,
}

impl PollChannel {
    fn new(initial: Arc<Poll>) -> Self {
        let (sender, _) = watch::channel(initial);
        Self {
            sender,
            viewers: HashSet::new(),
            linger: CancellationToken::new(),
        }
    }
}

/// A viewer's live feed of one poll. Dropping it detaches the viewer just
/// like [`SubscriptionBroker::unsubscribe`].
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    poll_id: PollId,
    initial: Arc<Poll>,
    updates: watch::Receiver<Arc<Poll>>,
    channels: Weak<Mutex<HashMap<PollId, PollChannel>>>,
    linger: Duration,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn poll_id(&self) -> &PollId {
        &self.poll_id
    }

    /// The snapshot current at the time of subscribing.
    pub fn initial(&self) -> &Arc<Poll> {
        &self.initial
    }

    /// Waits for a snapshot newer than the last one returned. `None` once
    /// the broker has dropped the poll's channel.
    pub async fn next(&mut self) -> Option<Arc<Poll>> {
        self.updates.changed().await.ok()?;
        Some(self.updates.borrow_and_update().clone())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(channels) = self.channels.upgrade() {
            detach(&channels, self.linger, &self.poll_id, self.id);
        }
    }
}

pub struct SubscriptionBroker<S> {
    store: Arc<S>,
    channels: Channels,
    next_id: AtomicU64,
    linger: Duration,
}

impl<S: PollStore> SubscriptionBroker<S> {
    pub fn new(store: Arc<S>, config: &BrokerConfig) -> Self {
        Self {
            store,
            channels: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            linger: Duration::from_secs(config.linger_secs),
        }
    }

    /// Attaches a viewer. The current snapshot comes from the poll's channel
    /// when one exists, otherwise from the store.
    pub async fn subscribe(&self, poll_id: &PollId) -> Result<Subscription, StoreError> {
        if let Some(subscription) = self.attach(poll_id, None) {
            return Ok(subscription);
        }

        let fetched = Arc::new(self.store.get(poll_id).await?);
        let subscription = match self.attach(poll_id, Some(fetched)) {
            Some(subscription) => subscription,
            None => return Err(StoreError::NotFound),
        };

        // Commits between the read above and the channel's creation were
        // published to nobody. One more read closes that window.
        match self.store.get(poll_id).await {
            Ok(fresh) => self.publish(poll_id, Arc::new(fresh)),
            Err(e) => tracing::warn!(%poll_id, error = %e, "Catch-up read after subscribe failed"),
        }

        Ok(subscription)
    }

    /// Registers a viewer on an existing channel, or on a new one seeded with
    /// `seed`. Returns `None` if there is neither.
    fn attach(&self, poll_id: &PollId, seed: Option<Arc<Poll>>) -> Option<Subscription> {
        let mut channels = self.channels.lock().expect("Broker lock poisoned");

        let channel = match (channels.contains_key(poll_id), seed) {
            (true, seed) => {
                let channel = channels.get_mut(poll_id)?;
                if let Some(seed) = seed {
                    advance(&channel.sender, seed);
                }
                channel
            }
            (false, Some(seed)) => channels
                .entry(poll_id.clone())
                .or_insert_with(|| PollChannel::new(seed)),
            (false, None) => return None,
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        channel.viewers.insert(id);
        if channel.viewers.len() == 1 {
            // Someone was lingering on this poll; call the eviction off.
            channel.linger.cancel();
            channel.linger = CancellationToken::new();
        }

        let mut updates = channel.sender.subscribe();
        let initial = updates.borrow_and_update().clone();
        tracing::debug!(%poll_id, subscription = id, viewers = channel.viewers.len(), "Viewer attached");

        Some(Subscription {
            id,
            poll_id: poll_id.clone(),
            initial,
            updates,
            channels: Arc::downgrade(&self.channels),
            linger: self.linger,
        })
    }

    /// Detaches a viewer. Unknown polls and handles are ignored, so this is
    /// safe to repeat, and dropping the `Subscription` afterwards is a no-op.
    pub fn unsubscribe(&self, poll_id: &PollId, id: SubscriptionId) {
        detach(&self.channels, self.linger, poll_id, id);
    }

    /// Hands a committed snapshot to every viewer of the poll. Snapshots not
    /// newer than the one already held are discarded.
    pub fn publish(&self, poll_id: &PollId, snapshot: Arc<Poll>) {
        let channels = self.channels.lock().expect("Broker lock poisoned");
        let Some(channel) = channels.get(poll_id) else {
            tracing::trace!(%poll_id, version = snapshot.version, "No viewers, snapshot not cached");
            return;
        };

        let version = snapshot.version;
        if advance(&channel.sender, snapshot) {
            tracing::trace!(%poll_id, version, viewers = channel.viewers.len(), "Snapshot published");
        }
    }

    /// The newest snapshot held for a poll with a live or lingering channel.
    pub fn latest(&self, poll_id: &PollId) -> Option<Arc<Poll>> {
        let channels = self.channels.lock().expect("Broker lock poisoned");
        channels.get(poll_id).map(|c| c.sender.borrow().clone())
    }

    pub fn viewer_count(&self, poll_id: &PollId) -> usize {
        let channels = self.channels.lock().expect("Broker lock poisoned");
        channels.get(poll_id).map_or(0, |c| c.viewers.len())
    }
}

/// Removes viewer `id` from a poll's channel. The last viewer out starts the
/// linger timer, or drops the channel at once when there is no linger or no
/// runtime to run the timer on.
fn detach(channels_handle: &Channels, linger: Duration, poll_id: &PollId, id: SubscriptionId) {
    let mut channels = channels_handle.lock().expect("Broker lock poisoned");

    let Some(channel) = channels.get_mut(poll_id) else {
        return;
    };
    if !channel.viewers.remove(&id) {
        return;
    }
    tracing::debug!(%poll_id, subscription = id, viewers = channel.viewers.len(), "Viewer detached");
    if !channel.viewers.is_empty() {
        return;
    }

    let runtime = match Handle::try_current() {
        Ok(runtime) if !linger.is_zero() => runtime,
        _ => {
            channels.remove(poll_id);
            return;
        }
    };

    let token = channel.linger.clone();
    let poll_id = poll_id.clone();
    let channels_handle = Arc::clone(channels_handle);

    runtime.spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {
                tracing::trace!(%poll_id, "Linger cancelled");
            }
            _ = sleep(linger) => {
                let mut channels = channels_handle.lock().expect("Broker lock poisoned");
                if channels.get(&poll_id).is_some_and(|c| c.viewers.is_empty()) {
                    channels.remove(&poll_id);
                    tracing::debug!(%poll_id, "Linger expired, channel dropped");
                }
            }
        }
    });
}

/// Replaces the held snapshot if `snapshot` is strictly newer.
fn advance(sender: &watch::Sender<Arc<Poll>>, snapshot: Arc<Poll>) -> bool {
    sender.send_if_modified(|current| {
        if snapshot.version > current.version {
            *current = snapshot;
            true
        } else {
            false
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::sample_poll;
    use crate::store::MemoryPollStore;

    async fn broker_with_poll(linger_secs: u64) -> SubscriptionBroker<MemoryPollStore> {
        let store = Arc::new(MemoryPollStore::new());
        store.insert(sample_poll("p1", &["Red", "Blue"])).await.unwrap();
        SubscriptionBroker::new(store, &BrokerConfig { linger_secs })
    }

    fn at_version(version: u64) -> Arc<Poll> {
        let mut poll = sample_poll("p1", &["Red", "Blue"]);
        poll.version = version;
        Arc::new(poll)
    }

    #[tokio::test]
    async fn subscribe_returns_current_snapshot() {
        let broker = broker_with_poll(0).await;
        let sub = broker.subscribe(&"p1".into()).await.unwrap();

        assert_eq!(sub.initial().version, 0);
        assert_eq!(broker.viewer_count(&"p1".into()), 1);
    }

    #[tokio::test]
    async fn subscribe_to_unknown_poll_fails() {
        let broker = broker_with_poll(0).await;
        let err = broker.subscribe(&"missing".into()).await.unwrap_err();
        assert_eq!(err, StoreError::NotFound);
    }

    #[tokio::test]
    async fn publish_reaches_every_viewer() {
        let broker = broker_with_poll(0).await;
        let mut a = broker.subscribe(&"p1".into()).await.unwrap();
        let mut b = broker.subscribe(&"p1".into()).await.unwrap();

        broker.publish(&"p1".into(), at_version(1));

        assert_eq!(a.next().await.unwrap().version, 1);
        assert_eq!(b.next().await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn slow_viewer_coalesces_to_latest() {
        let broker = broker_with_poll(0).await;
        let mut sub = broker.subscribe(&"p1".into()).await.unwrap();

        for version in 1..=5 {
            broker.publish(&"p1".into(), at_version(version));
        }

        assert_eq!(sub.next().await.unwrap().version, 5);
    }

    #[tokio::test]
    async fn older_snapshot_never_replaces_newer() {
        let broker = broker_with_poll(0).await;
        let mut sub = broker.subscribe(&"p1".into()).await.unwrap();

        broker.publish(&"p1".into(), at_version(3));
        broker.publish(&"p1".into(), at_version(2));
        broker.publish(&"p1".into(), at_version(3));

        assert_eq!(sub.next().await.unwrap().version, 3);
        assert_eq!(broker.latest(&"p1".into()).unwrap().version, 3);
        let pending = tokio::time::timeout(Duration::from_millis(20), sub.next()).await;
        assert!(pending.is_err(), "stale or duplicate snapshot was delivered");
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_drops_channel_without_linger() {
        let broker = broker_with_poll(0).await;
        let mut sub = broker.subscribe(&"p1".into()).await.unwrap();

        broker.unsubscribe(&"p1".into(), sub.id());
        broker.unsubscribe(&"p1".into(), sub.id());
        broker.unsubscribe(&"gone".into(), 42);

        assert_eq!(broker.viewer_count(&"p1".into()), 0);
        assert!(broker.latest(&"p1".into()).is_none());
        assert!(sub.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn channel_lingers_then_expires() {
        let broker = broker_with_poll(5).await;
        let sub = broker.subscribe(&"p1".into()).await.unwrap();
        broker.unsubscribe(&"p1".into(), sub.id());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(broker.latest(&"p1".into()).is_some());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(broker.latest(&"p1".into()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribe_cancels_linger() {
        let broker = broker_with_poll(5).await;
        let first = broker.subscribe(&"p1".into()).await.unwrap();
        broker.unsubscribe(&"p1".into(), first.id());

        tokio::time::sleep(Duration::from_secs(1)).await;
        let _second = broker.subscribe(&"p1".into()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(broker.viewer_count(&"p1".into()), 1);
        assert!(broker.latest(&"p1".into()).is_some());
    }

    #[tokio::test]
    async fn dropped_subscription_detaches_itself() {
        let broker = broker_with_poll(0).await;
        let kept = broker.subscribe(&"p1".into()).await.unwrap();
        let dropped = broker.subscribe(&"p1".into()).await.unwrap();
        assert_eq!(broker.viewer_count(&"p1".into()), 2);

        drop(dropped);
        assert_eq!(broker.viewer_count(&"p1".into()), 1);

        broker.unsubscribe(&"p1".into(), kept.id());
        drop(kept);
        assert!(broker.latest(&"p1".into()).is_none());
    }

    #[test]
    fn detach_outside_a_runtime_drops_the_channel_at_once() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (broker, first, second) = runtime.block_on(async {
            let broker = broker_with_poll(30).await;
            let first = broker.subscribe(&"p1".into()).await.unwrap();
            let second = broker.subscribe(&"p1".into()).await.unwrap();
            (broker, first, second)
        });
        drop(runtime);

        broker.unsubscribe(&"p1".into(), first.id());
        assert_eq!(broker.viewer_count(&"p1".into()), 1);
        drop(second);
        assert!(broker.latest(&"p1".into()).is_none());
        drop(first);
    }
}
