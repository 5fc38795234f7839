//! # fieldsync store
//!
//! The local durable store the sync engine runs against.
//!
//! This crate provides the on-device document store: named tables of
//! [`Value`](fieldsync_protocol::Value) documents keyed by string.
//! The engine only relies on:
//!
//! - get/put/delete by key
//! - a scan ordered by a numeric field, with an optional upper bound
//! - atomic multi-table transactions; a reader never observes half of one
//!
//! ## Available stores
//!
//! - [`MemoryStore`] - For tests and ephemeral clients
//! - [`FileStore`] - Persistent, one snapshot file per directory, guarded by
//!   an advisory `LOCK` file
//!
//! ## Example
//!
//! ```rust
//! use fieldsync_protocol::Value;
//! use fieldsync_store::{LocalStore, LocalStoreExt, MemoryStore, StoreError};
//!
//! let store = MemoryStore::new();
//! store
//!     .transaction(|txn| {
//!         txn.put("jobs", "1", Value::object().with("id", 1));
//!         txn.put("outbox", "op-1", Value::object().with("nextAttemptAt", 5));
//!         Ok::<_, StoreError>(())
//!     })
//!     .unwrap();
//! assert_eq!(store.count("jobs").unwrap(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod file;
mod memory;
mod store;
mod transaction;

pub use error::{StoreError, StoreResult};
pub use file::FileStore;
pub use memory::MemoryStore;
pub use store::{LocalStore, LocalStoreExt, Record};
pub use transaction::Transaction;
