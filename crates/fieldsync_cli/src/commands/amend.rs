//! Amend command implementation.

use super::{open_outbox, read_mutation};
use fieldsync_protocol::OpId;
use std::path::Path;
use tracing::info;

/// Runs the amend command.
pub fn run(path: &Path, op_id: &str, file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let mutation = read_mutation(file)?;
    let (_store, outbox) = open_outbox(path)?;
    let op_id = OpId::new(op_id);

    let report = outbox.amend(&op_id, mutation)?;
    info!(op_id = %op_id, corrections = report.len(), "operation amended");
    println!("Amended {op_id}; it will be retried on the next drain pass");
    Ok(())
}
