//! CLI command implementations.

pub mod amend;
pub mod discard;
pub mod outbox;
pub mod sanitize;
pub mod status;

use fieldsync_engine::{
    load_last_synced_at, Connectivity, Outbox, RetryConfig, SyncStatePublisher, SystemClock,
    OUTBOX_TABLE,
};
use fieldsync_protocol::{Mutation, Value};
use fieldsync_store::{FileStore, LocalStore};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Notify;

/// Opens the store at `path` and an offline outbox over it.
///
/// Nothing is sent anywhere; the outbox only edits the local queue.
pub fn open_outbox(path: &Path) -> Result<(Arc<FileStore>, Outbox), Box<dyn std::error::Error>> {
    if !path.is_dir() {
        return Err(format!("No store found at {}", path.display()).into());
    }
    let store = Arc::new(FileStore::open(path)?);
    let publisher = Arc::new(SyncStatePublisher::new(
        false,
        store.count(OUTBOX_TABLE)?,
        load_last_synced_at(store.as_ref())?,
    ));
    let outbox = Outbox::new(
        store.clone(),
        Arc::new(SystemClock),
        RetryConfig::default(),
        publisher,
        Connectivity::new(false),
        Arc::new(Notify::new()),
    );
    Ok((store, outbox))
}

/// Reads a `{"type": ..., "payload": ...}` mutation from a JSON file.
pub fn read_mutation(file: &Path) -> Result<Mutation, Box<dyn std::error::Error>> {
    let text = fs::read_to_string(file)?;
    let value: Value = serde_json::from_str(&text)?;
    Ok(Mutation::from_value(&value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_protocol::OpId;

    #[test]
    fn open_outbox_rejects_missing_store() {
        let dir = tempfile::tempdir().unwrap();
        assert!(open_outbox(&dir.path().join("nope")).is_err());
    }

    #[test]
    fn mutation_files_round_into_the_outbox() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("job.json");
        fs::write(
            &file,
            r#"{"type": "job.update", "payload": {"job": {"id": "12", "scope": " Gutters "}}}"#,
        )
        .unwrap();

        let store_dir = dir.path().join("store");
        fs::create_dir(&store_dir).unwrap();
        let (_store, outbox) = open_outbox(&store_dir).unwrap();
        let queued = outbox.enqueue(read_mutation(&file).unwrap()).unwrap();
        assert_eq!(queued.report.string_corrections.len(), 1);

        assert!(outbox.discard(&queued.op_id).unwrap());
        assert!(!outbox.discard(&OpId::new("missing")).unwrap());
    }
}
