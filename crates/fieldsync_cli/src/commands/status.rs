//! Status command implementation.

use super::open_outbox;
use fieldsync_engine::{load_last_synced_at, media_status};
use fieldsync_protocol::{collections, MediaStatus};
use fieldsync_store::LocalStore;
use serde::Serialize;
use std::path::Path;

/// Store status summary.
#[derive(Debug, Default, Serialize)]
pub struct StatusReport {
    /// Store path.
    pub path: String,
    /// Pending operations, parked ones included.
    pub queued: usize,
    /// Operations waiting for amend or discard.
    pub parked: usize,
    /// Operations that have failed at least once.
    pub retrying: usize,
    /// Earliest retry time (ms) of an operation that is not parked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<i64>,
    /// Time (ms) of the last successful remote write.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<i64>,
    /// Local media records by upload status.
    pub media: MediaCounts,
}

/// Local media records by upload status.
#[derive(Debug, Default, Serialize)]
pub struct MediaCounts {
    /// Not uploaded yet.
    pub pending: usize,
    /// Upload in flight.
    pub uploading: usize,
    /// Uploaded and referenced remotely.
    pub synced: usize,
    /// Last upload failed.
    pub error: usize,
}

/// Runs the status command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let (store, outbox) = open_outbox(path)?;
    let pending = outbox.list()?;

    let mut report = StatusReport {
        path: path.display().to_string(),
        queued: pending.len(),
        parked: pending.iter().filter(|op| op.is_parked()).count(),
        retrying: pending.iter().filter(|op| op.attempt > 0).count(),
        next_attempt_at: outbox.next_due_at()?,
        last_synced_at: load_last_synced_at(store.as_ref())?,
        ..StatusReport::default()
    };

    for record in store.scan(collections::MEDIA)? {
        match media_status(&record.doc).unwrap_or(MediaStatus::Pending) {
            MediaStatus::Pending => report.media.pending += 1,
            MediaStatus::Uploading => report.media.uploading += 1,
            MediaStatus::Synced => report.media.synced += 1,
            MediaStatus::Error => report.media.error += 1,
        }
    }

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_text_output(&report),
    }
    Ok(())
}

fn print_text_output(report: &StatusReport) {
    println!("Store: {}", report.path);
    println!();
    println!("Outbox:");
    println!("  Queued:          {}", report.queued);
    println!("  Parked:          {}", report.parked);
    println!("  Retrying:        {}", report.retrying);
    match report.next_attempt_at {
        Some(at) => println!("  Next attempt at: {at}"),
        None => println!("  Next attempt at: -"),
    }
    println!();
    match report.last_synced_at {
        Some(at) => println!("Last synced at: {at}"),
        None => println!("Last synced at: never"),
    }
    println!();
    println!("Media:");
    println!("  Pending:   {}", report.media.pending);
    println!("  Uploading: {}", report.media.uploading);
    println!("  Synced:    {}", report.media.synced);
    println!("  Error:     {}", report.media.error);
}
