//! Discard command implementation.

use super::open_outbox;
use fieldsync_protocol::OpId;
use std::path::Path;

/// Runs the discard command.
pub fn run(path: &Path, op_id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let (_store, outbox) = open_outbox(path)?;
    let op_id = OpId::new(op_id);

    if outbox.discard(&op_id)? {
        println!("Discarded {op_id}");
        Ok(())
    } else {
        Err(format!("No pending operation {op_id}").into())
    }
}
