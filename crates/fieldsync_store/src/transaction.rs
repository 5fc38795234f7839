//! Table contents and write transactions shared by every store.

use crate::error::StoreResult;
use crate::store::Record;
use fieldsync_protocol::Value;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

type Key = (String, String);

/// All tables of a store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub(crate) struct Tables {
    tables: BTreeMap<String, BTreeMap<String, Value>>,
}

/// Previous contents of every key a commit touched.
pub(crate) struct Undo(Vec<(Key, Option<Value>)>);

impl Tables {
    pub(crate) fn get(&self, table: &str, key: &str) -> Option<&Value> {
        self.tables.get(table)?.get(key)
    }

    pub(crate) fn count(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, BTreeMap::len)
    }

    pub(crate) fn scan(&self, table: &str) -> Vec<Record> {
        self.tables
            .get(table)
            .into_iter()
            .flatten()
            .map(|(key, doc)| Record::new(key.clone(), doc.clone()))
            .collect()
    }

    /// Records with a numeric `field` at most `upper`, ascending by `field`
    /// then key. Records without a numeric `field` are skipped.
    pub(crate) fn scan_ordered(&self, table: &str, field: &str, upper: Option<f64>) -> Vec<Record> {
        let mut hits: Vec<(f64, Record)> = self
            .tables
            .get(table)
            .into_iter()
            .flatten()
            .filter_map(|(key, doc)| {
                let n = doc.get(field)?.as_f64()?;
                match upper {
                    Some(upper) if n > upper => None,
                    _ => Some((n, Record::new(key.clone(), doc.clone()))),
                }
            })
            .collect();

        hits.sort_by(|(a, ra), (b, rb)| {
            a.partial_cmp(b)
                .unwrap_or(Ordering::Equal)
                .then_with(|| ra.key.cmp(&rb.key))
        });
        hits.into_iter().map(|(_, record)| record).collect()
    }

    pub(crate) fn apply(&mut self, writes: BTreeMap<Key, Option<Value>>) -> Undo {
        let mut undo = Vec::with_capacity(writes.len());
        for ((table, key), value) in writes {
            let rows = self.tables.entry(table.clone()).or_default();
            let previous = match value {
                Some(value) => rows.insert(key.clone(), value),
                None => rows.remove(&key),
            };
            undo.push(((table, key), previous));
        }
        self.tables.retain(|_, rows| !rows.is_empty());
        Undo(undo)
    }

    pub(crate) fn undo(&mut self, undo: Undo) {
        for ((table, key), previous) in undo.0.into_iter().rev() {
            let rows = self.tables.entry(table).or_default();
            match previous {
                Some(value) => {
                    rows.insert(key, value);
                }
                None => {
                    rows.remove(&key);
                }
            }
        }
        self.tables.retain(|_, rows| !rows.is_empty());
    }

    /// Runs `body` against a fresh transaction and applies its writes if it
    /// returns true. `persist` runs after the writes are applied; if it fails
    /// they are rolled back.
    pub(crate) fn run(
        &mut self,
        body: &mut dyn FnMut(&mut Transaction<'_>) -> bool,
        persist: impl FnOnce(&Tables) -> StoreResult<()>,
    ) -> StoreResult<()> {
        let mut txn = Transaction::new(self);
        if !body(&mut txn) || txn.writes.is_empty() {
            return Ok(());
        }
        let writes = txn.writes;

        let undo = self.apply(writes);
        if let Err(err) = persist(self) {
            self.undo(undo);
            return Err(err);
        }
        Ok(())
    }
}

/// A write transaction.
///
/// Reads see the transaction's own writes. Nothing is visible to other
/// readers until the transaction body returns successfully, and then all of
/// it becomes visible at once.
pub struct Transaction<'a> {
    base: &'a Tables,
    writes: BTreeMap<Key, Option<Value>>,
}

impl<'a> Transaction<'a> {
    fn new(base: &'a Tables) -> Self {
        Self {
            base,
            writes: BTreeMap::new(),
        }
    }

    /// Reads a document, including writes made earlier in this transaction.
    pub fn get(&self, table: &str, key: &str) -> Option<Value> {
        match self.writes.get(&(table.to_string(), key.to_string())) {
            Some(pending) => pending.clone(),
            None => self.base.get(table, key).cloned(),
        }
    }

    /// Writes a document.
    pub fn put(&mut self, table: &str, key: &str, doc: Value) {
        self.writes
            .insert((table.to_string(), key.to_string()), Some(doc));
    }

    /// Deletes a document. Deleting a missing key is not an error.
    pub fn delete(&mut self, table: &str, key: &str) {
        self.writes.insert((table.to_string(), key.to_string()), None);
    }

    /// Number of writes buffered so far.
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Returns true if nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}
