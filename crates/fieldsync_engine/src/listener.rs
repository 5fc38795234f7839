//! Merges remote change streams into the local store.

use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteStore;
use crate::stats::SharedStats;
use crate::status::SyncStatePublisher;
use fieldsync_protocol::{merge_decision, sanitize, updated_at, ChangeBatch, RemoteChange, Value, UPDATED_AT};
use fieldsync_store::{LocalStore, LocalStoreExt};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type MergeObserver = Arc<dyn Fn(&str, &RemoteChange) + Send + Sync>;

/// What a merged batch did to the local store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    /// Incoming documents written locally.
    pub merged: usize,
    /// Incoming documents older than the local copy.
    pub stale: usize,
    /// Incoming documents dropped as malformed.
    pub skipped: usize,
    /// Local documents deleted because the remote one was.
    pub removed: usize,
}

/// Applies remote changes with last-write-wins.
///
/// Each batch is merged in one local transaction. The local table for a
/// collection has the collection's name.
pub struct ChangeListener {
    store: Arc<dyn LocalStore>,
    publisher: Arc<SyncStatePublisher>,
    stats: SharedStats,
    observers: RwLock<Vec<MergeObserver>>,
}

impl ChangeListener {
    pub(crate) fn new(
        store: Arc<dyn LocalStore>,
        publisher: Arc<SyncStatePublisher>,
        stats: SharedStats,
    ) -> Self {
        Self {
            store,
            publisher,
            stats,
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Registers a callback run for every change written locally.
    pub fn on_merge<F>(&self, observer: F)
    where
        F: Fn(&str, &RemoteChange) + Send + Sync + 'static,
    {
        self.observers.write().push(Arc::new(observer));
    }

    /// Merges one batch.
    ///
    /// Upserts replace the local document when their `updatedAt` is at least
    /// the local one. Removals always delete. Malformed documents are logged
    /// and skipped without failing the batch.
    pub fn merge_batch(&self, batch: &ChangeBatch) -> SyncResult<MergeSummary> {
        let _pulling = PullGuard::new(&self.publisher);
        let table = batch.collection.as_str();

        let (summary, applied) = self.store.transaction(|txn| {
            let mut summary = MergeSummary::default();
            let mut applied = Vec::new();

            for change in &batch.changes {
                match change {
                    RemoteChange::Upsert { id, doc } => {
                        let Some(doc) = accept_shape(table, id, doc) else {
                            summary.skipped += 1;
                            continue;
                        };
                        let local = txn.get(table, id);
                        if merge_decision(local.as_ref(), &doc).accepts() {
                            txn.put(table, id, doc.clone());
                            summary.merged += 1;
                            applied.push(RemoteChange::Upsert {
                                id: id.clone(),
                                doc,
                            });
                        } else {
                            debug!(collection = table, id = %id, "stale remote change ignored");
                            summary.stale += 1;
                        }
                    }
                    RemoteChange::Removed { id } => {
                        txn.delete(table, id);
                        summary.removed += 1;
                        applied.push(change.clone());
                    }
                }
            }
            Ok::<_, SyncError>((summary, applied))
        })?;

        let observers: Vec<MergeObserver> = self.observers.read().clone();
        for change in &applied {
            for observer in &observers {
                observer(table, change);
            }
        }

        {
            let mut stats = self.stats.write();
            stats.remote_merged += (summary.merged + summary.removed) as u64;
            stats.remote_stale += summary.stale as u64;
            stats.remote_skipped += summary.skipped as u64;
        }
        debug!(
            collection = table,
            merged = summary.merged,
            stale = summary.stale,
            skipped = summary.skipped,
            removed = summary.removed,
            "remote batch merged"
        );
        Ok(summary)
    }

    /// Subscribes to `collection` and merges every batch until `shutdown`
    /// flips or the stream ends.
    pub fn spawn(
        self: Arc<Self>,
        remote: &dyn RemoteStore,
        collection: &str,
        mut shutdown: watch::Receiver<bool>,
    ) -> SyncResult<JoinHandle<()>> {
        let mut changes = remote.subscribe(collection)?;
        let collection = collection.to_string();
        info!(collection = %collection, "listening for remote changes");

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    batch = changes.recv() => {
                        let Some(batch) = batch else {
                            info!(collection = %collection, "remote change stream closed");
                            break;
                        };
                        if let Err(err) = self.merge_batch(&batch) {
                            warn!(collection = %collection, error = %err, "failed to merge remote batch");
                        }
                    }
                }
            }
        }))
    }
}

impl std::fmt::Debug for ChangeListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeListener")
            .field("observers", &self.observers.read().len())
            .finish()
    }
}

/// Permissive shape check for incoming documents.
///
/// Only rejects what cannot be merged at all: a document that is not an
/// object, or one whose `updatedAt` is present but not a timestamp.
fn accept_shape(collection: &str, id: &str, doc: &Value) -> Option<Value> {
    let cleaned = sanitize(doc, &format!("{collection}/{id}")).cleaned;
    if cleaned.as_object().is_none() {
        warn!(collection, id, kind = doc.type_name(), "remote document is not an object; skipped");
        return None;
    }
    if cleaned.get(UPDATED_AT).is_some_and(|v| !v.is_null()) && updated_at(&cleaned).is_none() {
        warn!(collection, id, "remote document has an unreadable updatedAt; skipped");
        return None;
    }
    Some(cleaned)
}

/// Reports a pull to the publisher for as long as it lives.
struct PullGuard<'a>(&'a SyncStatePublisher);

impl<'a> PullGuard<'a> {
    fn new(publisher: &'a SyncStatePublisher) -> Self {
        publisher.begin_pull();
        Self(publisher)
    }
}

impl Drop for PullGuard<'_> {
    fn drop(&mut self) {
        self.0.end_pull();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use crate::stats::SyncStats;
    use crate::status::SyncStatus;
    use fieldsync_store::MemoryStore;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn listener() -> (Arc<ChangeListener>, Arc<MemoryStore>, Arc<SyncStatePublisher>) {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(SyncStatePublisher::new(true, 0, None));
        let listener = Arc::new(ChangeListener::new(
            store.clone(),
            Arc::clone(&publisher),
            Arc::new(RwLock::new(SyncStats::default())),
        ));
        (listener, store, publisher)
    }

    fn job(at: i64, client: &str) -> Value {
        Value::object()
            .with("id", 1)
            .with("client", client)
            .with(UPDATED_AT, at)
    }

    fn upsert(doc: Value) -> ChangeBatch {
        ChangeBatch::new("jobs", vec![RemoteChange::Upsert { id: "1".into(), doc }])
    }

    #[test]
    fn newer_or_equal_remote_wins() {
        let (listener, store, _) = listener();
        store.put("jobs", "1", job(100, "local")).unwrap();

        let summary = listener.merge_batch(&upsert(job(100, "remote"))).unwrap();
        assert_eq!(summary.merged, 1);
        assert_eq!(
            store.get("jobs", "1").unwrap().unwrap().get("client").and_then(Value::as_str),
            Some("remote")
        );

        let summary = listener.merge_batch(&upsert(job(99, "older"))).unwrap();
        assert_eq!(summary.stale, 1);
        assert_eq!(
            store.get("jobs", "1").unwrap().unwrap().get("client").and_then(Value::as_str),
            Some("remote")
        );
    }

    #[test]
    fn remote_document_replaces_local_wholesale() {
        let (listener, store, _) = listener();
        store
            .put("jobs", "1", job(10, "local").with("notes", "draft"))
            .unwrap();
        listener.merge_batch(&upsert(job(20, "remote"))).unwrap();
        assert_eq!(store.get("jobs", "1").unwrap().unwrap(), job(20, "remote"));
    }

    #[test]
    fn malformed_documents_are_skipped() {
        let (listener, store, _) = listener();
        let batch = ChangeBatch::new(
            "jobs",
            vec![
                RemoteChange::Upsert { id: "1".into(), doc: Value::Text("nope".into()) },
                RemoteChange::Upsert {
                    id: "2".into(),
                    doc: Value::object().with(UPDATED_AT, "yesterday"),
                },
                RemoteChange::Upsert { id: "3".into(), doc: job(5, "fine") },
            ],
        );
        let summary = listener.merge_batch(&batch).unwrap();
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.merged, 1);
        assert_eq!(store.count("jobs").unwrap(), 1);
    }

    #[test]
    fn removals_delete_and_notify_observers() {
        let (listener, store, _) = listener();
        store.put("jobs", "1", job(500, "local")).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        listener.on_merge(move |collection, change| {
            sink.lock().push(format!("{collection}/{}", change.id()));
        });

        let batch = ChangeBatch::new("jobs", vec![RemoteChange::Removed { id: "1".into() }]);
        assert_eq!(listener.merge_batch(&batch).unwrap().removed, 1);
        assert!(store.get("jobs", "1").unwrap().is_none());
        assert_eq!(*seen.lock(), vec!["jobs/1".to_string()]);
    }

    #[test]
    fn status_is_pulling_only_during_merge() {
        let (listener, _, publisher) = listener();
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&statuses);
        let _sub = publisher.subscribe(move |state| sink.lock().push(state.status));

        listener.merge_batch(&upsert(job(1, "a"))).unwrap();
        assert_eq!(
            *statuses.lock(),
            vec![SyncStatus::Idle, SyncStatus::Pulling, SyncStatus::Idle]
        );
    }

    #[tokio::test]
    async fn spawned_listener_merges_until_shutdown() {
        let (listener, store, _) = listener();
        let remote = MemoryRemote::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = Arc::clone(&listener)
            .spawn(&remote, "jobs", shutdown_rx)
            .unwrap();
        remote.push_remote_change(upsert(job(7, "pushed")));

        for _ in 0..50 {
            if store.get("jobs", "1").unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(store.get("jobs", "1").unwrap().is_some());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
