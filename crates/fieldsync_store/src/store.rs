//! Local store trait definition.

use crate::error::{StoreError, StoreResult};
use crate::transaction::Transaction;
use fieldsync_protocol::Value;

/// A stored document and its key.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Document key within its table.
    pub key: String,
    /// Document contents.
    pub doc: Value,
}

impl Record {
    /// Creates a record.
    pub fn new(key: impl Into<String>, doc: Value) -> Self {
        Self {
            key: key.into(),
            doc,
        }
    }
}

/// A transactional on-device document store.
///
/// Stores hold named tables of documents keyed by string. Entity tables and
/// the outbox live side by side so one transaction can cover both.
///
/// # Invariants
///
/// - A transaction's writes become visible all at once, or not at all
/// - `scan_ordered` returns records ascending by the numeric field, ties
///   broken by key
/// - Stores must be `Send + Sync`; the engine shares one between the
///   scheduler worker, the change listeners and the caller
///
/// # Implementors
///
/// - [`crate::MemoryStore`] - For testing
/// - [`crate::FileStore`] - For persistent storage
pub trait LocalStore: Send + Sync {
    /// Reads a document.
    fn get(&self, table: &str, key: &str) -> StoreResult<Option<Value>>;

    /// Returns every record of `table`, ordered by key.
    fn scan(&self, table: &str) -> StoreResult<Vec<Record>>;

    /// Returns the records of `table` whose numeric `field` is at most
    /// `upper` (or all records with a numeric `field` when `upper` is
    /// `None`), ascending by that field.
    fn scan_ordered(&self, table: &str, field: &str, upper: Option<f64>)
        -> StoreResult<Vec<Record>>;

    /// Number of records in `table`.
    fn count(&self, table: &str) -> StoreResult<usize>;

    /// Runs `body` as one atomic transaction.
    ///
    /// The writes are committed only if `body` returns true. Prefer
    /// [`LocalStoreExt::transaction`], which carries a result out of the body.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit cannot be made durable; nothing is
    /// applied in that case.
    fn transact(&self, body: &mut dyn FnMut(&mut Transaction<'_>) -> bool) -> StoreResult<()>;

    /// Writes a single document.
    fn put(&self, table: &str, key: &str, doc: Value) -> StoreResult<()> {
        let mut doc = Some(doc);
        self.transact(&mut |txn: &mut Transaction<'_>| {
            if let Some(doc) = doc.take() {
                txn.put(table, key, doc);
            }
            true
        })
    }

    /// Deletes a single document.
    fn delete(&self, table: &str, key: &str) -> StoreResult<()> {
        self.transact(&mut |txn: &mut Transaction<'_>| {
            txn.delete(table, key);
            true
        })
    }
}

/// Closure-style transactions for any [`LocalStore`].
pub trait LocalStoreExt: LocalStore {
    /// Runs `f` as one atomic transaction and returns its result.
    ///
    /// If `f` returns an error nothing is written and the error is returned.
    ///
    /// # Example
    ///
    /// ```rust
    /// use fieldsync_protocol::Value;
    /// use fieldsync_store::{LocalStoreExt, MemoryStore, StoreError};
    ///
    /// let store = MemoryStore::new();
    /// let stored = store.transaction(|txn| {
    ///     txn.put("users", "u1", Value::object().with("name", "Ana"));
    ///     Ok::<_, StoreError>(txn.len())
    /// });
    /// assert_eq!(stored.unwrap(), 1);
    /// ```
    fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut f = Some(f);
        let mut outcome = None;
        self.transact(&mut |txn: &mut Transaction<'_>| {
            let Some(f) = f.take() else {
                return false;
            };
            let result = f(txn);
            let commit = result.is_ok();
            outcome = Some(result);
            commit
        })?;
        outcome.unwrap_or(Err(E::from(StoreError::Aborted)))
    }
}

impl<S: LocalStore + ?Sized> LocalStoreExt for S {}
