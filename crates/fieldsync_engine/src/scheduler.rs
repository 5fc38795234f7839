//! The retry scheduler: one worker draining the outbox.

use crate::clock::Clock;
use crate::connectivity::Connectivity;
use crate::dispatch::Dispatcher;
use crate::error::SyncResult;
use crate::outbox::Outbox;
use crate::stats::SharedStats;
use crate::status::{save_last_synced_at, SyncStatePublisher};
use fieldsync_store::LocalStore;
use std::future::pending;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// False if the pass was skipped (offline or already draining).
    pub ran: bool,
    /// Operations applied and removed from the outbox.
    pub pushed: usize,
    /// Operations parked after failing validation.
    pub parked: usize,
    /// True if the pass stopped at a failed operation.
    pub failed: bool,
}

/// Drains due operations in order and schedules retries.
///
/// At most one pass runs at a time, and a pass keeps going until nothing is
/// due. It stops at the first operation that fails for a reason other than
/// validation; that operation's backoff decides when the next pass runs.
/// Later operations on the same document wait behind it, while operations
/// on other documents go ahead in the next pass.
pub struct Scheduler {
    outbox: Arc<Outbox>,
    dispatcher: Dispatcher,
    publisher: Arc<SyncStatePublisher>,
    connectivity: Connectivity,
    clock: Arc<dyn Clock>,
    store: Arc<dyn LocalStore>,
    stats: SharedStats,
    batch_size: usize,
    wake: Arc<Notify>,
    processing: AtomicBool,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        outbox: Arc<Outbox>,
        dispatcher: Dispatcher,
        publisher: Arc<SyncStatePublisher>,
        connectivity: Connectivity,
        clock: Arc<dyn Clock>,
        store: Arc<dyn LocalStore>,
        stats: SharedStats,
        batch_size: usize,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            outbox,
            dispatcher,
            publisher,
            connectivity,
            clock,
            store,
            stats,
            batch_size: batch_size.max(1),
            wake,
            processing: AtomicBool::new(false),
        }
    }

    /// Runs one drain pass.
    ///
    /// Skipped when offline or when another pass is in progress.
    pub async fn drain_pass(&self) -> SyncResult<DrainReport> {
        if !self.connectivity.is_online() {
            debug!("offline; drain skipped");
            return Ok(DrainReport::default());
        }
        let Some(_guard) = ProcessingGuard::acquire(&self.processing) else {
            debug!("drain already in progress");
            return Ok(DrainReport::default());
        };

        self.stats.write().drain_passes += 1;
        self.publisher.begin_push();

        let mut report = DrainReport {
            ran: true,
            ..DrainReport::default()
        };
        let outcome = self.drain_due(&mut report).await;

        let failure = match &outcome {
            Ok(failure) => failure.clone(),
            Err(err) => {
                report.failed = true;
                Some(err.to_string())
            }
        };
        self.publisher.finish_push(failure);

        if report.pushed > 0 || report.parked > 0 || report.failed {
            info!(
                pushed = report.pushed,
                parked = report.parked,
                failed = report.failed,
                "drain pass finished"
            );
        }
        outcome.map(|_| report)
    }

    /// Applies due operations, reading them in chunks of `batch_size` until
    /// nothing runnable is left. Returns the message to surface as the last
    /// error: the failure that stopped the pass, or else the reason the
    /// first operation was parked.
    async fn drain_due(&self, report: &mut DrainReport) -> SyncResult<Option<String>> {
        let mut parked_reason = None;

        loop {
            let chunk = self.outbox.dequeue_runnable(self.clock.now_ms())?;
            if chunk.is_empty() {
                return Ok(parked_reason);
            }

            // At most one operation per document per chunk, so nothing in a
            // chunk depends on another.
            for op in chunk.into_iter().take(self.batch_size) {
                if !self.connectivity.is_online() {
                    debug!("went offline mid-pass");
                    return Ok(parked_reason);
                }
                if op.attempt > 0 {
                    self.stats.write().retries += 1;
                }

                match self.dispatcher.apply(&op).await {
                    Ok(corrections) => {
                        self.outbox.note_corrections(&corrections);
                        self.outbox.complete(&op.id)?;
                        let at = self.clock.now_ms();
                        self.publisher.mark_synced(at);
                        save_last_synced_at(self.store.as_ref(), at)?;
                        self.stats.write().operations_pushed += 1;
                        report.pushed += 1;
                    }
                    Err(err) if err.is_validation() => {
                        self.outbox.park(&op, &err)?;
                        self.stats.write().operations_parked += 1;
                        report.parked += 1;
                        parked_reason.get_or_insert_with(|| err.to_string());
                    }
                    Err(err) => {
                        if err.is_structural() {
                            warn!(op_id = %op.id, error = %err, "operation blocked until fixed");
                        }
                        self.outbox.record_failure(&op, &err)?;
                        self.stats.write().operations_failed += 1;
                        report.failed = true;
                        return Ok(Some(err.to_string()));
                    }
                }
            }
        }
    }

    /// Runs the worker until `shutdown` flips to true.
    ///
    /// Drains on start, on every wake-up, when connectivity returns, and when
    /// the earliest backoff expires. At most one timer is armed; going
    /// offline disarms it.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut online = self.connectivity.subscribe();
        let mut deadline = if *online.borrow_and_update() {
            self.drain_and_rearm().await
        } else {
            None
        };

        loop {
            let timer = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => pending::<()>().await,
                }
            };

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *online.borrow_and_update() {
                        deadline = self.drain_and_rearm().await;
                    } else {
                        deadline = None;
                    }
                }
                _ = self.wake.notified() => {
                    deadline = self.drain_and_rearm().await;
                }
                _ = timer => {
                    deadline = self.drain_and_rearm().await;
                }
            }
        }
        debug!("scheduler stopped");
    }

    async fn drain_and_rearm(&self) -> Option<Instant> {
        if let Err(err) = self.drain_pass().await {
            warn!(error = %err, "drain pass failed");
        }
        if !self.connectivity.is_online() {
            return None;
        }
        match self.outbox.next_due_at() {
            Ok(Some(at)) => {
                let wait = u64::try_from(at - self.clock.now_ms()).unwrap_or(0);
                Some(Instant::now() + Duration::from_millis(wait))
            }
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, "could not read next retry time");
                None
            }
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("batch_size", &self.batch_size)
            .field("processing", &self.processing.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Holds the processing flag for one pass.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl<'a> ProcessingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAuthorizer;
    use crate::clock::ManualClock;
    use crate::config::RetryConfig;
    use crate::remote::MemoryRemote;
    use crate::stats::SyncStats;
    use crate::status::{load_last_synced_at, SyncStatus};
    use fieldsync_protocol::{Mutation, OpId, PendingOperation, Value};
    use fieldsync_store::MemoryStore;
    use parking_lot::RwLock;

    struct Fixture {
        scheduler: Arc<Scheduler>,
        outbox: Arc<Outbox>,
        remote: Arc<MemoryRemote>,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        publisher: Arc<SyncStatePublisher>,
        stats: SharedStats,
    }

    fn fixture(batch_size: usize) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(MemoryRemote::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let publisher = Arc::new(SyncStatePublisher::new(true, 0, None));
        let connectivity = Connectivity::new(true);
        let wake = Arc::new(Notify::new());
        let stats: SharedStats = Arc::new(RwLock::new(SyncStats::default()));
        let outbox = Arc::new(Outbox::new(
            store.clone(),
            clock.clone(),
            RetryConfig::default().with_jitter(false),
            Arc::clone(&publisher),
            connectivity.clone(),
            Arc::clone(&wake),
        ));
        let dispatcher = Dispatcher::new(
            remote.clone(),
            Arc::new(StaticAuthorizer::allow()),
            store.clone(),
            clock.clone(),
        );
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&outbox),
            dispatcher,
            Arc::clone(&publisher),
            connectivity,
            clock.clone(),
            store.clone(),
            Arc::clone(&stats),
            batch_size,
            wake,
        ));
        Fixture {
            scheduler,
            outbox,
            remote,
            store,
            clock,
            publisher,
            stats,
        }
    }

    fn custom(n: i64) -> Mutation {
        Mutation::Custom {
            payload: Value::object().with("n", n),
        }
    }

    fn job(id: i64) -> Value {
        Value::object()
            .with("id", id)
            .with("date", "2025-11-28")
            .with("crew", Value::Array(vec!["ana".into()]))
            .with("client", "Harbor Dental")
            .with("scope", "Windows")
    }

    #[tokio::test]
    async fn drains_in_order_and_records_sync_time() {
        let f = fixture(50);
        for n in 0..3 {
            f.outbox.enqueue(custom(n)).unwrap();
        }

        let report = f.scheduler.drain_pass().await.unwrap();
        assert_eq!(report.pushed, 3);
        assert_eq!(f.outbox.depth().unwrap(), 0);

        let order: Vec<_> = f
            .remote
            .writes()
            .iter()
            .map(|w| match &w.kind {
                fieldsync_protocol::WriteKind::Set(doc) => doc.get("n").and_then(Value::as_i64),
                _ => None,
            })
            .collect();
        assert_eq!(order, vec![Some(0), Some(1), Some(2)]);

        let state = f.publisher.state();
        assert_eq!(state.status, SyncStatus::Idle);
        assert_eq!(state.queued_count, 0);
        assert_eq!(state.last_synced_at, Some(1_000));
        assert_eq!(load_last_synced_at(f.store.as_ref()).unwrap(), Some(1_000));
    }

    #[tokio::test]
    async fn failure_stops_the_pass_and_backs_off() {
        let f = fixture(50);
        let first = f.outbox.enqueue(custom(1)).unwrap().op_id;
        f.outbox.enqueue(custom(2)).unwrap();
        f.remote.fail_next_commits(1);

        let report = f.scheduler.drain_pass().await.unwrap();
        assert!(report.failed);
        assert_eq!(report.pushed, 0);
        assert_eq!(f.remote.call_count(), 1);

        let op = f.outbox.get(&first).unwrap().unwrap();
        assert_eq!(op.attempt, 1);
        assert_eq!(op.next_attempt_at, 2_000);

        let state = f.publisher.state();
        assert_eq!(state.status, SyncStatus::Error);
        assert!(state.last_error.is_some());

        // The first operation is backing off; the second writes a different
        // document, so it goes ahead.
        let report = f.scheduler.drain_pass().await.unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(f.outbox.depth().unwrap(), 1);

        f.clock.advance(Duration::from_millis(1_000));
        let report = f.scheduler.drain_pass().await.unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(f.stats.read().retries, 1);
        assert_eq!(f.publisher.state().last_error, None);
    }

    #[tokio::test]
    async fn validation_failures_park_and_continue() {
        let f = fixture(50);
        let missing = f
            .outbox
            .enqueue(Mutation::MediaUpload { media_id: "m-404".into() })
            .unwrap()
            .op_id;
        f.outbox.enqueue(custom(1)).unwrap();

        let report = f.scheduler.drain_pass().await.unwrap();
        assert_eq!(report.parked, 1);
        assert_eq!(report.pushed, 1);
        assert!(!report.failed);

        let parked = f.outbox.get(&missing).unwrap().unwrap();
        assert!(parked.is_parked());
        assert!(parked.last_error.unwrap().contains("mediaId"));

        let state = f.publisher.state();
        assert_eq!(state.queued_count, 1);
        assert_eq!(state.status, SyncStatus::Error);
        assert!(state.last_error.unwrap().contains("mediaId"));

        // Nothing left to fail: the next pass is clean.
        f.scheduler.drain_pass().await.unwrap();
        assert_eq!(f.publisher.state().status, SyncStatus::Idle);
    }

    #[tokio::test]
    async fn one_pass_drains_every_batch() {
        let f = fixture(2);
        for n in 0..5 {
            f.outbox.enqueue(custom(n)).unwrap();
        }
        let report = f.scheduler.drain_pass().await.unwrap();
        assert_eq!(report.pushed, 5);
        assert_eq!(f.outbox.depth().unwrap(), 0);
        assert_eq!(f.publisher.state().status, SyncStatus::Idle);

        let f = fixture(50);
        for n in 0..60 {
            f.outbox.enqueue(custom(n)).unwrap();
        }
        assert_eq!(f.scheduler.drain_pass().await.unwrap().pushed, 60);
        assert!(f.outbox.dequeue_due(f.clock.now_ms()).unwrap().is_empty());
        assert_eq!(f.stats.read().drain_passes, 1);
    }

    #[tokio::test]
    async fn update_never_overtakes_a_failed_add() {
        let f = fixture(50);
        f.outbox
            .enqueue(Mutation::JobAdd {
                job: job(1).with("updatedAt", 1_000),
            })
            .unwrap();
        f.outbox
            .enqueue(Mutation::JobUpdate {
                job: Value::object()
                    .with("id", 1)
                    .with("scope", "Gutters")
                    .with("updatedAt", 1_001),
            })
            .unwrap();
        f.remote.fail_next_commits(1);

        assert!(f.scheduler.drain_pass().await.unwrap().failed);
        let report = f.scheduler.drain_pass().await.unwrap();
        assert_eq!(report.pushed, 0);
        assert_eq!(f.remote.call_count(), 1);
        assert_eq!(f.outbox.depth().unwrap(), 2);
        assert_eq!(f.outbox.next_due_at().unwrap(), Some(2_000));

        f.clock.advance(Duration::from_millis(1_000));
        let report = f.scheduler.drain_pass().await.unwrap();
        assert_eq!(report.pushed, 2);
        assert_eq!(f.outbox.depth().unwrap(), 0);

        let kinds: Vec<_> = f.remote.writes().iter().map(|w| w.kind.name()).collect();
        assert_eq!(kinds, vec!["set", "merge"]);
        let doc = f.remote.document("jobs/1").unwrap();
        assert_eq!(doc.get("scope").and_then(Value::as_str), Some("Gutters"));
        assert_eq!(doc.get("updatedAt").and_then(Value::as_i64), Some(1_001));
    }

    #[tokio::test]
    async fn apply_time_corrections_surface_a_notice() {
        let f = fixture(50);
        let op = PendingOperation::new(
            OpId::new("op-raw"),
            Mutation::JobAdd {
                job: job(4).with("client", " Harbor Dental "),
            },
            1_000,
        );
        f.store
            .put(crate::outbox::OUTBOX_TABLE, "op-raw", op.to_value())
            .unwrap();

        assert_eq!(f.scheduler.drain_pass().await.unwrap().pushed, 1);
        assert_eq!(
            f.publisher.state().last_notice.as_deref(),
            Some("jobs/4: 0 removed, 0 numeric, 1 string corrections")
        );
    }

    #[tokio::test]
    async fn offline_pass_is_skipped() {
        let f = fixture(50);
        f.outbox.enqueue(custom(1)).unwrap();
        f.scheduler.connectivity.set_online(false);

        let report = f.scheduler.drain_pass().await.unwrap();
        assert!(!report.ran);
        assert_eq!(f.remote.call_count(), 0);
        assert_eq!(f.stats.read().drain_passes, 0);
    }

    #[test]
    fn processing_guard_is_exclusive() {
        let flag = AtomicBool::new(false);
        let guard = ProcessingGuard::acquire(&flag).unwrap();
        assert!(ProcessingGuard::acquire(&flag).is_none());
        drop(guard);
        assert!(ProcessingGuard::acquire(&flag).is_some());
    }
}
