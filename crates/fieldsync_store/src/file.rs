//! File-backed persistent store.
//!
//! Directory layout:
//!
//! ```text
//! <store_path>/
//! ├─ LOCK              # Advisory lock, one process per directory
//! ├─ snapshot.cbor     # Every table, CBOR encoded
//! └─ snapshot.tmp      # Only present while a commit is in flight
//! ```

use crate::error::{StoreError, StoreResult};
use crate::store::{LocalStore, Record};
use crate::transaction::{Tables, Transaction};
use fieldsync_protocol::Value;
use fs2::FileExt;
use parking_lot::RwLock;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const LOCK_FILE: &str = "LOCK";
const SNAPSHOT_FILE: &str = "snapshot.cbor";
const SNAPSHOT_TEMP: &str = "snapshot.tmp";

/// A store persisted to a directory.
///
/// Every commit rewrites the snapshot with the write-then-rename pattern, so
/// a crash leaves either the previous or the new snapshot on disk, never a
/// mix. The outbox of a field client is small, which keeps full rewrites
/// cheap.
///
/// # Example
///
/// ```no_run
/// use fieldsync_protocol::Value;
/// use fieldsync_store::{FileStore, LocalStore};
/// use std::path::Path;
///
/// let store = FileStore::open(Path::new("client_data")).unwrap();
/// store.put("jobs", "1", Value::object().with("id", 1)).unwrap();
/// ```
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    tables: RwLock<Tables>,
    _lock_file: File,
}

impl FileStore {
    /// Opens or creates a store directory.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Another process holds the directory (`Locked`)
    /// - The snapshot cannot be decoded (`Corrupted`)
    /// - I/O errors occur
    pub fn open(path: &Path) -> StoreResult<Self> {
        fs::create_dir_all(path)?;
        if !path.is_dir() {
            return Err(StoreError::corrupted(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked);
        }

        let tables = load_snapshot(&path.join(SNAPSHOT_FILE))?;
        debug!(path = %path.display(), "opened file store");

        Ok(Self {
            path: path.to_path_buf(),
            tables: RwLock::new(tables),
            _lock_file: lock_file,
        })
    }

    /// Returns the store directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save_snapshot(&self, tables: &Tables) -> StoreResult<()> {
        let mut data = Vec::new();
        ciborium::into_writer(tables, &mut data).map_err(|e| StoreError::Codec(e.to_string()))?;

        let temp_path = self.path.join(SNAPSHOT_TEMP);
        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, self.path.join(SNAPSHOT_FILE))?;
        self.sync_directory()?;
        debug!(bytes = data.len(), "snapshot written");
        Ok(())
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> StoreResult<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> StoreResult<()> {
        Ok(())
    }
}

fn load_snapshot(path: &Path) -> StoreResult<Tables> {
    if !path.exists() {
        return Ok(Tables::default());
    }
    let file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(Tables::default());
    }
    ciborium::from_reader(BufReader::new(file))
        .map_err(|e| StoreError::corrupted(format!("{}: {e}", path.display())))
}

impl LocalStore for FileStore {
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
        let mut tables = self.tables.write();
        tables.run(body, |committed| self.save_snapshot(committed))
    }
}
