//! Durable queue of pending operations.

use crate::clock::Clock;
use crate::config::RetryConfig;
use crate::connectivity::Connectivity;
use crate::error::{SyncError, SyncResult};
use crate::status::SyncStatePublisher;
use fieldsync_protocol::{
    next_logical_time, DocumentPath, Mutation, OpId, PendingOperation, SanitizationReport, Value,
};
use fieldsync_store::{LocalStore, LocalStoreExt, Record};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Table holding pending operations, keyed by operation id.
pub const OUTBOX_TABLE: &str = "outbox";

const DUE_FIELD: &str = "nextAttemptAt";

/// Result of a successful enqueue.
#[derive(Debug, Clone, PartialEq)]
pub struct Enqueued {
    /// Id of the new pending operation.
    pub op_id: OpId,
    /// What the sanitizer changed in the payload.
    pub report: SanitizationReport,
}

/// An optimistic local write made together with an enqueue.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalChange {
    /// Entity table.
    pub table: String,
    /// Document key.
    pub key: String,
    /// New contents, or `None` to delete.
    pub doc: Option<Value>,
}

impl LocalChange {
    /// Writes `doc` under `table/key`.
    pub fn put(table: impl Into<String>, key: impl Into<String>, doc: Value) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
            doc: Some(doc),
        }
    }

    /// Deletes `table/key`.
    pub fn delete(table: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
            doc: None,
        }
    }
}

/// The outbox queue manager.
///
/// Appends validated mutations as [`PendingOperation`] records and wakes the
/// scheduler when online. Only the scheduler changes `attempt` and
/// `nextAttemptAt` afterwards.
pub struct Outbox {
    store: Arc<dyn LocalStore>,
    clock: Arc<dyn Clock>,
    retry: RetryConfig,
    publisher: Arc<SyncStatePublisher>,
    connectivity: Connectivity,
    wake: Arc<Notify>,
    last_created: Mutex<Option<i64>>,
    logged_paths: Mutex<HashSet<String>>,
}

impl Outbox {
    /// Creates an outbox over `store`.
    ///
    /// `wake` is notified whenever an operation is queued while online.
    pub fn new(
        store: Arc<dyn LocalStore>,
        clock: Arc<dyn Clock>,
        retry: RetryConfig,
        publisher: Arc<SyncStatePublisher>,
        connectivity: Connectivity,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            clock,
            retry,
            publisher,
            connectivity,
            wake,
            last_created: Mutex::new(None),
            logged_paths: Mutex::new(HashSet::new()),
        }
    }

    /// Sanitizes `mutation` and queues it.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] naming the offending field if the
    /// payload is invalid; nothing is queued in that case.
    pub fn enqueue(&self, mutation: Mutation) -> SyncResult<Enqueued> {
        self.enqueue_with_local(mutation, Vec::new())
    }

    /// Sanitizes `mutation`, then writes `changes` and the new pending
    /// operation in one transaction.
    ///
    /// Validation runs before anything is written, so an invalid payload
    /// leaves the local tables untouched.
    pub fn enqueue_with_local(
        &self,
        mutation: Mutation,
        changes: Vec<LocalChange>,
    ) -> SyncResult<Enqueued> {
        let kind = mutation.kind();
        let (clean, report) = mutation.sanitize().map_err(|err| {
            warn!(kind, error = %err, "mutation rejected");
            SyncError::from(err)
        })?;
        self.note_corrections(&report);

        let now = self.clock.now_ms();
        let mut op = PendingOperation::new(OpId::generate(), clean, self.next_created_at(now));
        op.next_attempt_at = now;
        let record = op.to_value();

        self.store.transaction(|txn| {
            for change in changes {
                match change.doc {
                    Some(doc) => txn.put(&change.table, &change.key, doc),
                    None => txn.delete(&change.table, &change.key),
                }
            }
            txn.put(OUTBOX_TABLE, op.id.as_str(), record);
            Ok::<_, SyncError>(())
        })?;

        debug!(op_id = %op.id, kind, "operation queued");
        self.refresh_depth()?;
        if self.connectivity.is_online() {
            self.wake.notify_one();
        }

        Ok(Enqueued {
            op_id: op.id,
            report,
        })
    }

    /// Operations due at `threshold`, ordered by `nextAttemptAt` then
    /// `createdAt`. Parked operations are never due.
    pub fn dequeue_due(&self, threshold: i64) -> SyncResult<Vec<PendingOperation>> {
        let records = self
            .store
            .scan_ordered(OUTBOX_TABLE, DUE_FIELD, Some(threshold as f64))?;
        let mut due: Vec<_> = decode_all(records)
            .into_iter()
            .filter(|op| !op.is_parked())
            .collect();
        due.sort_by_key(|op| (op.next_attempt_at, op.created_at));
        Ok(due)
    }

    /// Due operations that may be applied now.
    ///
    /// Like [`Outbox::dequeue_due`], minus any operation queued behind an
    /// older one for the same document. A document's writes go out in the
    /// order they were queued even while the oldest one backs off or is
    /// parked.
    pub fn dequeue_runnable(&self, threshold: i64) -> SyncResult<Vec<PendingOperation>> {
        let ops = self.list()?;
        let blocked = queued_behind(&ops);
        Ok(ops
            .into_iter()
            .filter(|op| {
                !op.is_parked() && op.next_attempt_at <= threshold && !blocked.contains(&op.id)
            })
            .collect())
    }

    /// Every pending operation, parked ones included, in due order.
    pub fn list(&self) -> SyncResult<Vec<PendingOperation>> {
        let mut ops = decode_all(self.store.scan(OUTBOX_TABLE)?);
        ops.sort_by_key(|op| (op.next_attempt_at, op.created_at));
        Ok(ops)
    }

    /// Reads one pending operation.
    pub fn get(&self, op_id: &OpId) -> SyncResult<Option<PendingOperation>> {
        self.store
            .get(OUTBOX_TABLE, op_id.as_str())?
            .map(|doc| PendingOperation::from_value(&doc))
            .transpose()
            .map_err(SyncError::from)
    }

    /// Number of pending operations, parked ones included.
    pub fn depth(&self) -> SyncResult<usize> {
        Ok(self.store.count(OUTBOX_TABLE)?)
    }

    /// Earliest `nextAttemptAt` among operations that could run: not parked
    /// and not queued behind an older operation for the same document.
    pub fn next_due_at(&self) -> SyncResult<Option<i64>> {
        let ops = self.list()?;
        let blocked = queued_behind(&ops);
        Ok(ops
            .into_iter()
            .filter(|op| !op.is_parked() && !blocked.contains(&op.id))
            .map(|op| op.next_attempt_at)
            .min())
    }

    /// Deletes an operation whose remote write succeeded.
    pub fn complete(&self, op_id: &OpId) -> SyncResult<()> {
        self.store.delete(OUTBOX_TABLE, op_id.as_str())?;
        self.refresh_depth()
    }

    /// Records a failed apply attempt and reschedules the operation.
    ///
    /// The delay is computed from the attempt count before the failure, so
    /// the first retry waits about one base delay. `nextAttemptAt` never
    /// moves backwards.
    pub fn record_failure(
        &self,
        op: &PendingOperation,
        error: &SyncError,
    ) -> SyncResult<Option<PendingOperation>> {
        let now = self.clock.now_ms();
        let delay = i64::try_from(self.retry.delay_for_attempt(op.attempt).as_millis())
            .unwrap_or(i64::MAX);
        let message = error.to_string();

        let updated = self.update(&op.id, |stored| {
            stored.attempt = stored.attempt.saturating_add(1);
            stored.next_attempt_at = (stored.next_attempt_at + 1).max(now.saturating_add(delay));
            stored.updated_at = now;
            stored.last_error = Some(message.clone());
        })?;

        if let Some(op) = &updated {
            warn!(
                op_id = %op.id,
                kind = op.mutation.kind(),
                attempt = op.attempt,
                next_attempt_at = op.next_attempt_at,
                error = %message,
                "apply failed; retry scheduled"
            );
        }
        Ok(updated)
    }

    /// Parks an operation that failed validation at apply time.
    ///
    /// Parked operations stay queued and counted but are skipped by
    /// [`Outbox::dequeue_due`] until [`Outbox::amend`]ed or
    /// [`Outbox::discard`]ed.
    pub fn park(&self, op: &PendingOperation, error: &SyncError) -> SyncResult<()> {
        let now = self.clock.now_ms();
        let reason = error.to_string();
        let parked = self.update(&op.id, |stored| {
            stored.parked = Some(reason.clone());
            stored.last_error = Some(reason.clone());
            stored.updated_at = now;
        })?;
        if parked.is_some() {
            warn!(op_id = %op.id, kind = op.mutation.kind(), reason = %reason, "operation parked");
        }
        Ok(())
    }

    /// Replaces the mutation of a pending operation and makes it due now.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotFound`] for an unknown id and
    /// [`SyncError::Validation`] if the new payload is still invalid.
    pub fn amend(&self, op_id: &OpId, mutation: Mutation) -> SyncResult<SanitizationReport> {
        let (clean, report) = mutation.sanitize()?;
        self.note_corrections(&report);
        let now = self.clock.now_ms();

        let amended = self.update(op_id, move |stored| {
            stored.mutation = clean;
            stored.parked = None;
            stored.next_attempt_at = stored.next_attempt_at.max(now);
            stored.updated_at = now;
        })?;
        if amended.is_none() {
            return Err(SyncError::NotFound(op_id.to_string()));
        }

        info!(op_id = %op_id, "operation amended");
        if self.connectivity.is_online() {
            self.wake.notify_one();
        }
        Ok(report)
    }

    /// Drops a pending operation without applying it. Returns false if there
    /// was no such operation.
    pub fn discard(&self, op_id: &OpId) -> SyncResult<bool> {
        let existed = self.store.transaction(|txn| {
            let existed = txn.get(OUTBOX_TABLE, op_id.as_str()).is_some();
            txn.delete(OUTBOX_TABLE, op_id.as_str());
            Ok::<_, SyncError>(existed)
        })?;
        if existed {
            info!(op_id = %op_id, "operation discarded");
            self.refresh_depth()?;
        }
        Ok(existed)
    }

    /// Publishes the current queue depth.
    pub fn refresh_depth(&self) -> SyncResult<()> {
        self.publisher.set_queued(self.depth()?);
        Ok(())
    }

    fn update(
        &self,
        op_id: &OpId,
        change: impl FnOnce(&mut PendingOperation),
    ) -> SyncResult<Option<PendingOperation>> {
        self.store.transaction(|txn| {
            let Some(doc) = txn.get(OUTBOX_TABLE, op_id.as_str()) else {
                return Ok(None);
            };
            let mut op = PendingOperation::from_value(&doc)?;
            change(&mut op);
            txn.put(OUTBOX_TABLE, op_id.as_str(), op.to_value());
            Ok::<_, SyncError>(Some(op))
        })
    }

    /// Strictly increasing creation time, so simultaneous enqueues keep
    /// their order.
    fn next_created_at(&self, now: i64) -> i64 {
        let mut last = self.last_created.lock();
        let now = next_logical_time(*last, now);
        *last = Some(now);
        now
    }

    /// Logs corrections once per document path and surfaces a notice.
    pub(crate) fn note_corrections(&self, report: &SanitizationReport) {
        if report.is_clean() {
            return;
        }
        let mut logged = self.logged_paths.lock();
        let fresh: Vec<&str> = report
            .paths()
            .map(document_of)
            .filter(|doc| logged.insert((*doc).to_string()))
            .collect();
        drop(logged);

        for doc in &fresh {
            warn!(path = %doc, corrections = %report.summary(), "payload corrected before sync");
        }
        if let Some(doc) = fresh.first() {
            self.publisher
                .notice(format!("{doc}: {}", report.summary()));
        }
    }
}

fn decode_all(records: Vec<Record>) -> Vec<PendingOperation> {
    records
        .into_iter()
        .filter_map(|record| match PendingOperation::from_value(&record.doc) {
            Ok(op) => Some(op),
            Err(err) => {
                warn!(key = %record.key, error = %err, "undecodable pending operation left in place");
                None
            }
        })
        .collect()
}

/// Ids of operations with an older operation for the same document still
/// queued.
fn queued_behind(ops: &[PendingOperation]) -> HashSet<OpId> {
    let targets: Vec<Option<DocumentPath>> = ops.iter().map(|op| op.mutation.target()).collect();

    let mut oldest: HashMap<&DocumentPath, &PendingOperation> = HashMap::new();
    for (op, target) in ops.iter().zip(&targets) {
        let Some(target) = target else { continue };
        oldest
            .entry(target)
            .and_modify(|head| {
                if op.created_at < head.created_at {
                    *head = op;
                }
            })
            .or_insert(op);
    }

    ops.iter()
        .zip(&targets)
        .filter(|(op, target)| match target {
            Some(target) => oldest.get(target).is_some_and(|head| head.id != op.id),
            None => false,
        })
        .map(|(op, _)| op.id.clone())
        .collect()
}

/// Document part of a field path (`jobs/1.crew[0]` -> `jobs/1`).
fn document_of(path: &str) -> &str {
    path.split(['.', '[']).next().unwrap_or(path)
}
