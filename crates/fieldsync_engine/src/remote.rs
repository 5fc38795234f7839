//! Remote store abstraction.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use fieldsync_protocol::{ChangeBatch, OpId, RemoteChange, RemoteWrite, Value, WriteKind};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

/// The shared remote document store.
///
/// This trait abstracts the hosted backend, allowing for different
/// implementations (a hosted document database, an in-memory store for
/// testing, etc.).
///
/// Every write carries the id of the operation that produced it, so an
/// implementation can acknowledge a replayed write without applying it twice.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Performs one atomic document write.
    async fn commit(&self, write: RemoteWrite) -> SyncResult<()>;

    /// Uploads a binary object and returns its download URL.
    async fn upload_blob(&self, path: &str, bytes: Vec<u8>, content_type: &str)
        -> SyncResult<String>;

    /// Subscribes to the change stream of a collection.
    ///
    /// The stream ends when the remote store drops the subscription.
    fn subscribe(&self, collection: &str) -> SyncResult<mpsc::UnboundedReceiver<ChangeBatch>>;
}

/// A stored binary object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    /// Object contents.
    pub bytes: Vec<u8>,
    /// MIME type.
    pub content_type: String,
}

#[derive(Default)]
struct RemoteInner {
    docs: BTreeMap<String, Value>,
    blobs: BTreeMap<String, Blob>,
    applied: HashSet<OpId>,
    writes: Vec<RemoteWrite>,
    subscribers: Vec<(String, mpsc::UnboundedSender<ChangeBatch>)>,
    failing_commits: usize,
    failing_uploads: usize,
}

/// An in-memory remote store for testing.
///
/// Emits a change batch to the matching subscribers after every applied
/// write, like a hosted store echoing writes back to its listeners.
pub struct MemoryRemote {
    inner: Mutex<RemoteInner>,
    connected: AtomicBool,
    calls: AtomicUsize,
}

impl MemoryRemote {
    /// Creates an empty, reachable remote store.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RemoteInner::default()),
            connected: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        }
    }

    /// Sets whether the store is reachable.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Returns true if the store is reachable.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Makes the next `count` commits fail with a retryable transport error.
    pub fn fail_next_commits(&self, count: usize) {
        self.inner.lock().failing_commits = count;
    }

    /// Makes the next `count` uploads fail mid-transfer.
    pub fn fail_next_uploads(&self, count: usize) {
        self.inner.lock().failing_uploads = count;
    }

    /// Number of commit and upload calls made so far, failed ones included.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Reads a document.
    pub fn document(&self, path: &str) -> Option<Value> {
        self.inner.lock().docs.get(path).cloned()
    }

    /// Reads a binary object.
    pub fn blob(&self, path: &str) -> Option<Blob> {
        self.inner.lock().blobs.get(path).cloned()
    }

    /// Writes that were applied, in order.
    pub fn writes(&self) -> Vec<RemoteWrite> {
        self.inner.lock().writes.clone()
    }

    /// Stores a batch under `collection/id` and delivers it to the
    /// subscribers of its collection, as if another client had written it.
    pub fn push_remote_change(&self, batch: ChangeBatch) {
        let mut inner = self.inner.lock();
        for change in &batch.changes {
            let path = format!("{}/{}", batch.collection, change.id());
            match change {
                RemoteChange::Upsert { doc, .. } => {
                    inner.docs.insert(path, doc.clone());
                }
                RemoteChange::Removed { .. } => {
                    inner.docs.remove(&path);
                }
            }
        }
        publish(&mut inner, batch);
    }

    fn check_reachable(&self) -> SyncResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.is_connected() {
            Ok(())
        } else {
            Err(SyncError::transport_retryable("remote store unreachable"))
        }
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

fn publish(inner: &mut RemoteInner, batch: ChangeBatch) {
    inner.subscribers.retain(|(collection, tx)| {
        if *collection != batch.collection {
            return true;
        }
        tx.send(batch.clone()).is_ok()
    });
}

/// Adds `amount` to the number at `field`, creating intermediate objects as
/// needed.
fn increment(doc: &mut Value, field: &[String], amount: i64) {
    let mut target = doc;
    let mut segments = field.iter().peekable();
    while let Some(segment) = segments.next() {
        if target.as_object().is_none() {
            *target = Value::object();
        }
        let Some(fields) = target.as_object_mut() else {
            return;
        };
        if segments.peek().is_none() {
            let current = fields.get(segment).and_then(Value::as_f64).unwrap_or(0.0);
            fields.insert(segment.clone(), Value::Number(current + amount as f64));
            return;
        }
        target = fields
            .entry(segment.clone())
            .or_insert_with(Value::object);
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn commit(&self, write: RemoteWrite) -> SyncResult<()> {
        self.check_reachable()?;

        let mut inner = self.inner.lock();
        if inner.failing_commits > 0 {
            inner.failing_commits -= 1;
            return Err(SyncError::transport_retryable("remote store unavailable"));
        }
        if inner.applied.contains(&write.op_id) {
            debug!(op_id = %write.op_id, "replayed write acknowledged");
            return Ok(());
        }

        let path = write.path.as_str().to_string();
        let next = match &write.kind {
            WriteKind::Set(doc) => Some(doc.clone()),
            WriteKind::Merge(fields) => {
                let mut doc = inner.docs.get(&path).cloned().unwrap_or_else(Value::object);
                for (key, value) in fields.as_object().into_iter().flatten() {
                    doc.insert(key.clone(), value.clone());
                }
                Some(doc)
            }
            WriteKind::Delete => None,
            WriteKind::Increment { field, amount } => {
                let mut doc = inner.docs.get(&path).cloned().unwrap_or_else(Value::object);
                increment(&mut doc, field, *amount);
                Some(doc)
            }
        };

        let change = match next {
            Some(doc) => {
                inner.docs.insert(path, doc.clone());
                RemoteChange::Upsert {
                    id: write.path.id().to_string(),
                    doc,
                }
            }
            None => {
                inner.docs.remove(&path);
                RemoteChange::Removed {
                    id: write.path.id().to_string(),
                }
            }
        };
        let batch = ChangeBatch::new(write.path.collection(), vec![change]);

        inner.applied.insert(write.op_id.clone());
        inner.writes.push(write);
        publish(&mut inner, batch);
        Ok(())
    }

    async fn upload_blob(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> SyncResult<String> {
        self.check_reachable()?;

        let mut inner = self.inner.lock();
        if inner.failing_uploads > 0 {
            inner.failing_uploads -= 1;
            return Err(SyncError::Upload(format!("transfer of {path} interrupted")));
        }
        inner.blobs.insert(
            path.to_string(),
            Blob {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(format!("mem://{path}"))
    }

    fn subscribe(&self, collection: &str) -> SyncResult<mpsc::UnboundedReceiver<ChangeBatch>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().subscribers.push((collection.to_string(), tx));
        Ok(rx)
    }
}
