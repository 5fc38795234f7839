//! Sync manager for coordinating the outbox, scheduler and listeners.

use crate::auth::{Authorizer, StaticAuthorizer};
use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::connectivity::Connectivity;
use crate::dispatch::Dispatcher;
use crate::error::{SyncError, SyncResult};
use crate::listener::ChangeListener;
use crate::outbox::{Enqueued, LocalChange, Outbox, OUTBOX_TABLE};
use crate::remote::RemoteStore;
use crate::scheduler::{DrainReport, Scheduler};
use crate::stats::{SharedStats, SyncStats};
use crate::status::{load_last_synced_at, Subscription, SyncState, SyncStatePublisher};
use fieldsync_protocol::{Mutation, OpId, PendingOperation, RemoteChange, SanitizationReport};
use fieldsync_store::LocalStore;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Builder for [`SyncManager`].
pub struct SyncManagerBuilder {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    authorizer: Arc<dyn Authorizer>,
    online: bool,
}

impl SyncManagerBuilder {
    /// Sets the configuration.
    #[must_use]
    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the clock used for timestamps and backoff.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the authorizer consulted before every remote write.
    #[must_use]
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    /// Sets the connectivity reported before the first transition.
    #[must_use]
    pub fn initially_online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    /// Builds the manager, restoring queue depth and the last sync time
    /// from the store.
    pub fn build(self) -> SyncResult<SyncManager> {
        let last_synced_at = load_last_synced_at(self.store.as_ref())?;
        let depth = self.store.count(OUTBOX_TABLE)?;

        let publisher = Arc::new(SyncStatePublisher::new(self.online, depth, last_synced_at));
        let connectivity = Connectivity::new(self.online);
        let stats: SharedStats = Arc::new(RwLock::new(SyncStats::default()));
        let wake = Arc::new(Notify::new());

        let outbox = Arc::new(Outbox::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            self.config.retry.clone(),
            Arc::clone(&publisher),
            connectivity.clone(),
            Arc::clone(&wake),
        ));
        let dispatcher = Dispatcher::new(
            Arc::clone(&self.remote),
            self.authorizer,
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
        );
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&outbox),
            dispatcher,
            Arc::clone(&publisher),
            connectivity.clone(),
            self.clock,
            Arc::clone(&self.store),
            Arc::clone(&stats),
            self.config.drain_batch_size,
            Arc::clone(&wake),
        ));
        let listener = Arc::new(ChangeListener::new(
            Arc::clone(&self.store),
            Arc::clone(&publisher),
            Arc::clone(&stats),
        ));
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            device_id = %self.config.device_id,
            queued = depth,
            online = self.online,
            "sync manager created"
        );

        Ok(SyncManager {
            config: self.config,
            remote: self.remote,
            outbox,
            scheduler,
            listener,
            publisher,
            connectivity,
            stats,
            wake,
            shutdown_tx,
            tasks: Mutex::new(None),
        })
    }
}

/// Coordinates offline-first sync for one device.
///
/// The manager owns:
/// - the outbox, where mutations are queued durably
/// - a background worker that drains the outbox when online
/// - one listener per replicated collection, merging remote changes
///
/// # Example
///
/// ```rust,no_run
/// use fieldsync_engine::{MemoryRemote, SyncManager};
/// use fieldsync_protocol::{Mutation, Value};
/// use fieldsync_store::MemoryStore;
/// use std::sync::Arc;
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let manager = SyncManager::builder(Arc::new(MemoryStore::new()), Arc::new(MemoryRemote::new()))
///     .build()?;
/// manager.start()?;
/// manager.enqueue(Mutation::Custom { payload: Value::object().with("note", "hi") })?;
/// manager.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct SyncManager {
    config: SyncConfig,
    remote: Arc<dyn RemoteStore>,
    outbox: Arc<Outbox>,
    scheduler: Arc<Scheduler>,
    listener: Arc<ChangeListener>,
    publisher: Arc<SyncStatePublisher>,
    connectivity: Connectivity,
    stats: SharedStats,
    wake: Arc<Notify>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Option<Vec<JoinHandle<()>>>>,
}

impl SyncManager {
    /// Starts building a manager over a local and a remote store.
    pub fn builder(store: Arc<dyn LocalStore>, remote: Arc<dyn RemoteStore>) -> SyncManagerBuilder {
        SyncManagerBuilder {
            store,
            remote,
            config: SyncConfig::default(),
            clock: Arc::new(SystemClock),
            authorizer: Arc::new(StaticAuthorizer::allow()),
            online: true,
        }
    }

    /// Spawns the worker and the collection listeners.
    ///
    /// Must be called from within a Tokio runtime. Calling it again is a
    /// no-op.
    pub fn start(&self) -> SyncResult<()> {
        self.ensure_running()?;
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            return Ok(());
        }

        let mut handles = Vec::with_capacity(self.config.collections.len() + 1);
        for collection in &self.config.collections {
            let handle = Arc::clone(&self.listener).spawn(
                self.remote.as_ref(),
                collection,
                self.shutdown_tx.subscribe(),
            )?;
            handles.push(handle);
        }
        handles.push(tokio::spawn(
            Arc::clone(&self.scheduler).run(self.shutdown_tx.subscribe()),
        ));
        *tasks = Some(handles);

        info!(collections = self.config.collections.len(), "sync started");
        Ok(())
    }

    /// Stops the background tasks and waits for them to finish.
    ///
    /// Queued operations stay in the store.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let handles = self.tasks.lock().take().unwrap_or_default();
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "sync task ended abnormally");
            }
        }
        info!("sync stopped");
    }

    /// Queues a mutation.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the first invalid field; nothing is
    /// queued in that case.
    pub fn enqueue(&self, mutation: Mutation) -> SyncResult<Enqueued> {
        self.ensure_running()?;
        self.outbox.enqueue(mutation)
    }

    /// Writes `changes` locally and queues `mutation` in one transaction.
    pub fn enqueue_with_local(
        &self,
        mutation: Mutation,
        changes: Vec<LocalChange>,
    ) -> SyncResult<Enqueued> {
        self.ensure_running()?;
        self.outbox.enqueue_with_local(mutation, changes)
    }

    /// Replaces the payload of a pending (usually parked) operation.
    pub fn amend(&self, op_id: &OpId, mutation: Mutation) -> SyncResult<SanitizationReport> {
        self.ensure_running()?;
        self.outbox.amend(op_id, mutation)
    }

    /// Drops a pending operation. Returns false if it did not exist.
    pub fn discard(&self, op_id: &OpId) -> SyncResult<bool> {
        self.outbox.discard(op_id)
    }

    /// Every pending operation, in due order.
    pub fn pending(&self) -> SyncResult<Vec<PendingOperation>> {
        self.outbox.list()
    }

    /// Current sync state.
    pub fn state(&self) -> SyncState {
        self.publisher.state()
    }

    /// Registers a state listener; see [`SyncStatePublisher::subscribe`].
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncState) + Send + Sync + 'static,
    {
        self.publisher.subscribe(listener)
    }

    /// Registers a callback for every remote change written locally.
    pub fn on_merge<F>(&self, observer: F)
    where
        F: Fn(&str, &RemoteChange) + Send + Sync + 'static,
    {
        self.listener.on_merge(observer);
    }

    /// Reports the platform's network state.
    pub fn set_online(&self, online: bool) {
        self.publisher.set_online(online);
        self.connectivity.set_online(online);
    }

    /// Returns true if the network is reported up.
    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Asks the worker for a drain pass now.
    pub fn sync_now(&self) {
        self.wake.notify_one();
    }

    /// Runs a drain pass on the calling task.
    pub async fn drain_now(&self) -> SyncResult<DrainReport> {
        self.ensure_running()?;
        self.scheduler.drain_pass().await
    }

    /// The outbox.
    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// The change listener, for merging batches delivered some other way.
    pub fn listener(&self) -> &ChangeListener {
        &self.listener
    }

    /// Current statistics.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// The configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn ensure_running(&self) -> SyncResult<()> {
        if *self.shutdown_tx.borrow() {
            return Err(SyncError::Shutdown);
        }
        Ok(())
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("device_id", &self.config.device_id)
            .field("state", &self.publisher.state())
            .finish_non_exhaustive()
    }
}
