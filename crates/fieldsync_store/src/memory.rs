//! In-memory store for testing.

use crate::error::StoreResult;
use crate::store::{LocalStore, Record};
use crate::transaction::{Tables, Transaction};
use fieldsync_protocol::Value;
use parking_lot::RwLock;

/// An in-memory store.
///
/// Suitable for unit tests, integration tests and clients that do not need
/// their outbox to survive a restart.
///
/// # Thread Safety
///
/// The write lock is held for the whole transaction body, so transactions
/// are serialized and readers never see a partial commit.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, table: &str, key: &str) -> StoreResult<Option<Value>> {
        Ok(self.tables.read().get(table, key).cloned())
    }

    fn scan(&self, table: &str) -> StoreResult<Vec<Record>> {
        Ok(self.tables.read().scan(table))
    }

    fn scan_ordered(
        &self,
        table: &str,
        field: &str,
        upper: Option<f64>,
    ) -> StoreResult<Vec<Record>> {
        Ok(self.tables.read().scan_ordered(table, field, upper))
    }

    fn count(&self, table: &str) -> StoreResult<usize> {
        Ok(self.tables.read().count(table))
    }

    fn transact(&self, body: &mut dyn FnMut(&mut Transaction<'_>) -> bool) -> StoreResult<()> {
        self.tables.write().run(body, |_| Ok(()))
    }
}
