//! # fieldsync engine
//!
//! Offline-first reconciliation between a local store and a shared remote
//! document store.
//!
//! This crate provides:
//! - [`Outbox`]: durable, FIFO queue of sanitized mutations
//! - [`Scheduler`]: a single worker that drains due operations and retries
//!   failures with capped exponential backoff
//! - [`Dispatcher`]: one atomic remote write per operation, uploads first
//! - [`ChangeListener`]: last-write-wins merge of remote change streams
//! - [`SyncStatePublisher`]: the observable sync status
//! - [`SyncManager`]: wires it all together
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐ enqueue ┌────────┐ due ops ┌───────────┐ write ┌──────────────┐
//! │ domain code│────────▶│ Outbox │────────▶│ Scheduler │──────▶│ RemoteStore  │
//! └────────────┘         └────────┘         └───────────┘       └──────┬───────┘
//!        ▲                    │ (same LocalStore)                       │ changes
//!        │              ┌─────▼──────┐       merge (LWW)  ┌─────────────▼──┐
//!        └──────────────│ LocalStore │◀───────────────────│ ChangeListener │
//!                       └────────────┘                    └────────────────┘
//! ```
//!
//! ## Failure classes
//!
//! - validation: the operation is parked until amended or discarded
//! - transient: retried with backoff; the drain pass stops, and later
//!   operations on the same document wait until it succeeds
//! - structural (authorization, fatal transport): surfaced in
//!   [`SyncState::last_error`] and retried on the same schedule

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod clock;
mod config;
mod connectivity;
mod dispatch;
mod error;
mod listener;
mod manager;
mod outbox;
mod remote;
mod scheduler;
mod stats;
mod status;

pub use auth::{Authorizer, StaticAuthorizer};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{RetryConfig, SyncConfig};
pub use connectivity::Connectivity;
pub use dispatch::{media_status, Dispatcher};
pub use error::{SyncError, SyncResult};
pub use listener::{ChangeListener, MergeSummary};
pub use manager::{SyncManager, SyncManagerBuilder};
pub use outbox::{Enqueued, LocalChange, Outbox, OUTBOX_TABLE};
pub use remote::{Blob, MemoryRemote, RemoteStore};
pub use scheduler::{DrainReport, Scheduler};
pub use stats::SyncStats;
pub use status::{
    load_last_synced_at, save_last_synced_at, Subscription, SyncState, SyncStatePublisher,
    SyncStatus, SYNC_META_TABLE,
};
