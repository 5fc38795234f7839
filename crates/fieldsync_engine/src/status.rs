//! Observable sync status.
//!
//! [`SyncStatePublisher`] owns the single [`SyncState`] of a manager. The
//! scheduler and the change listeners report what they are doing; the
//! publisher derives the user-facing status from that and notifies
//! subscribers synchronously whenever the snapshot changes.

use crate::error::SyncResult;
use fieldsync_protocol::Value;
use fieldsync_store::LocalStore;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// Table holding engine bookkeeping.
pub const SYNC_META_TABLE: &str = "sync_meta";

const SYNC_META_KEY: &str = "state";

/// User-facing sync status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// The connectivity monitor reports no network.
    Offline,
    /// Nothing to do, or waiting for the next retry after a clean pass.
    Idle,
    /// A drain pass is writing to the remote store.
    Pushing,
    /// Remote changes are being merged locally.
    Pulling,
    /// The last drain pass hit a failure; retries are still scheduled.
    Error,
}

impl SyncStatus {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Offline => "offline",
            SyncStatus::Idle => "idle",
            SyncStatus::Pushing => "pushing",
            SyncStatus::Pulling => "pulling",
            SyncStatus::Error => "error",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the sync state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncState {
    /// Current status.
    pub status: SyncStatus,
    /// Pending operations, parked ones included.
    pub queued_count: usize,
    /// Message of the last failure, cleared by the next clean drain pass.
    pub last_error: Option<String>,
    /// Time (ms) of the last successful remote write.
    pub last_synced_at: Option<i64>,
    /// Latest low-severity notice, such as an automatic payload correction.
    pub last_notice: Option<String>,
}

/// What the scheduler last reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Pushing,
    Error,
}

type Listener = Arc<dyn Fn(&SyncState) + Send + Sync>;

struct Inner {
    phase: Phase,
    online: bool,
    pulling: usize,
    queued_count: usize,
    last_error: Option<String>,
    last_synced_at: Option<i64>,
    last_notice: Option<String>,
    published: SyncState,
    listeners: BTreeMap<u64, Listener>,
    next_listener: u64,
}

impl Inner {
    fn snapshot(&self) -> SyncState {
        let status = if !self.online {
            SyncStatus::Offline
        } else if self.phase == Phase::Pushing {
            SyncStatus::Pushing
        } else if self.pulling > 0 {
            SyncStatus::Pulling
        } else if self.phase == Phase::Error {
            SyncStatus::Error
        } else {
            SyncStatus::Idle
        };

        SyncState {
            status,
            queued_count: self.queued_count,
            last_error: self.last_error.clone(),
            last_synced_at: self.last_synced_at,
            last_notice: self.last_notice.clone(),
        }
    }
}

/// Holds the sync state and notifies subscribers of every change.
///
/// Listeners run on the thread that caused the change, after the internal
/// lock is released, so a listener may read the state again. Updates that
/// leave the snapshot unchanged notify nobody.
pub struct SyncStatePublisher {
    inner: Mutex<Inner>,
}

impl SyncStatePublisher {
    /// Creates a publisher.
    pub fn new(online: bool, queued_count: usize, last_synced_at: Option<i64>) -> Self {
        let mut inner = Inner {
            phase: Phase::Idle,
            online,
            pulling: 0,
            queued_count,
            last_error: None,
            last_synced_at,
            last_notice: None,
            published: SyncState {
                status: SyncStatus::Idle,
                queued_count,
                last_error: None,
                last_synced_at,
                last_notice: None,
            },
            listeners: BTreeMap::new(),
            next_listener: 0,
        };
        inner.published = inner.snapshot();
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Returns the current snapshot.
    pub fn state(&self) -> SyncState {
        self.inner.lock().published.clone()
    }

    /// Registers a listener.
    ///
    /// The listener is called once right away with the current state, then
    /// on every change until the returned [`Subscription`] is dropped or
    /// unsubscribed.
    pub fn subscribe<F>(self: &Arc<Self>, listener: F) -> Subscription
    where
        F: Fn(&SyncState) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        let (id, current) = {
            let mut inner = self.inner.lock();
            let id = inner.next_listener;
            inner.next_listener += 1;
            inner.listeners.insert(id, Arc::clone(&listener));
            (id, inner.published.clone())
        };
        listener(&current);

        Subscription {
            publisher: Arc::downgrade(self),
            id,
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    fn remove_listener(&self, id: u64) {
        self.inner.lock().listeners.remove(&id);
    }

    fn update(&self, change: impl FnOnce(&mut Inner)) {
        let notify = {
            let mut inner = self.inner.lock();
            change(&mut inner);
            let next = inner.snapshot();
            if next == inner.published {
                return;
            }
            inner.published = next.clone();
            let listeners: Vec<Listener> = inner.listeners.values().cloned().collect();
            (next, listeners)
        };

        let (state, listeners) = notify;
        for listener in listeners {
            listener(&state);
        }
    }

    pub(crate) fn set_online(&self, online: bool) {
        self.update(|inner| inner.online = online);
    }

    pub(crate) fn set_queued(&self, queued_count: usize) {
        self.update(|inner| inner.queued_count = queued_count);
    }

    pub(crate) fn begin_push(&self) {
        self.update(|inner| inner.phase = Phase::Pushing);
    }

    /// Ends a drain pass. `failure` becomes `last_error`; a clean pass
    /// clears it.
    pub(crate) fn finish_push(&self, failure: Option<String>) {
        self.update(|inner| {
            inner.phase = if failure.is_some() {
                Phase::Error
            } else {
                Phase::Idle
            };
            inner.last_error = failure;
        });
    }

    pub(crate) fn begin_pull(&self) {
        self.update(|inner| inner.pulling += 1);
    }

    pub(crate) fn end_pull(&self) {
        self.update(|inner| inner.pulling = inner.pulling.saturating_sub(1));
    }

    pub(crate) fn mark_synced(&self, at: i64) {
        self.update(|inner| inner.last_synced_at = Some(at));
    }

    pub(crate) fn notice(&self, message: String) {
        self.update(|inner| inner.last_notice = Some(message));
    }
}

impl fmt::Debug for SyncStatePublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SyncStatePublisher")
            .field("state", &inner.published)
            .field("listeners", &inner.listeners.len())
            .finish()
    }
}

/// Handle returned by [`SyncStatePublisher::subscribe`].
///
/// Dropping it unsubscribes.
#[must_use = "dropping a subscription unsubscribes the listener"]
pub struct Subscription {
    publisher: Weak<SyncStatePublisher>,
    id: u64,
}

impl Subscription {
    /// Stops notifications.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(publisher) = self.publisher.upgrade() {
            publisher.remove_listener(self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Reads the persisted time of the last successful remote write.
pub fn load_last_synced_at(store: &dyn LocalStore) -> SyncResult<Option<i64>> {
    Ok(store
        .get(SYNC_META_TABLE, SYNC_META_KEY)?
        .and_then(|doc| doc.get("lastSyncedAt").and_then(Value::as_i64)))
}

/// Persists the time of the last successful remote write.
pub fn save_last_synced_at(store: &dyn LocalStore, at: i64) -> SyncResult<()> {
    store.put(
        SYNC_META_TABLE,
        SYNC_META_KEY,
        Value::object().with("lastSyncedAt", at),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_store::MemoryStore;

    fn recording(publisher: &Arc<SyncStatePublisher>) -> (Arc<Mutex<Vec<SyncState>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = publisher.subscribe(move |state| sink.lock().push(state.clone()));
        (seen, subscription)
    }

    #[test]
    fn subscriber_gets_current_state_immediately() {
        let publisher = Arc::new(SyncStatePublisher::new(true, 3, Some(42)));
        let (seen, _sub) = recording(&publisher);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].status, SyncStatus::Idle);
        assert_eq!(seen[0].queued_count, 3);
        assert_eq!(seen[0].last_synced_at, Some(42));
    }

    #[test]
    fn transitions_are_published_once() {
        let publisher = Arc::new(SyncStatePublisher::new(true, 0, None));
        let (seen, _sub) = recording(&publisher);

        publisher.begin_push();
        publisher.begin_push();
        publisher.finish_push(Some("transport error: timeout".into()));
        publisher.finish_push(None);

        let statuses: Vec<_> = seen.lock().iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![
                SyncStatus::Idle,
                SyncStatus::Pushing,
                SyncStatus::Error,
                SyncStatus::Idle
            ]
        );
    }

    #[test]
    fn offline_masks_and_restores_previous_status() {
        let publisher = Arc::new(SyncStatePublisher::new(true, 0, None));
        publisher.begin_push();
        publisher.finish_push(Some("boom".into()));
        assert_eq!(publisher.state().status, SyncStatus::Error);

        publisher.set_online(false);
        assert_eq!(publisher.state().status, SyncStatus::Offline);

        publisher.set_online(true);
        assert_eq!(publisher.state().status, SyncStatus::Error);
        assert_eq!(publisher.state().last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn pulling_shows_unless_pushing() {
        let publisher = Arc::new(SyncStatePublisher::new(true, 0, None));
        publisher.begin_pull();
        assert_eq!(publisher.state().status, SyncStatus::Pulling);
        publisher.begin_push();
        assert_eq!(publisher.state().status, SyncStatus::Pushing);
        publisher.finish_push(None);
        assert_eq!(publisher.state().status, SyncStatus::Pulling);
        publisher.end_pull();
        assert_eq!(publisher.state().status, SyncStatus::Idle);
    }

    #[test]
    fn dropped_subscription_stops_notifications() {
        let publisher = Arc::new(SyncStatePublisher::new(true, 0, None));
        let (seen, sub) = recording(&publisher);
        assert_eq!(publisher.listener_count(), 1);

        sub.unsubscribe();
        publisher.set_queued(5);

        assert_eq!(publisher.listener_count(), 0);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn listener_may_read_state() {
        let publisher = Arc::new(SyncStatePublisher::new(true, 0, None));
        let reader = Arc::clone(&publisher);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = publisher.subscribe(move |_| sink.lock().push(reader.state().queued_count));

        publisher.set_queued(2);
        assert_eq!(*seen.lock(), vec![0, 2]);
    }

    #[test]
    fn last_synced_at_is_persisted() {
        let store = MemoryStore::new();
        assert_eq!(load_last_synced_at(&store).unwrap(), None);
        save_last_synced_at(&store, 1_700).unwrap();
        assert_eq!(load_last_synced_at(&store).unwrap(), Some(1_700));
    }
}
