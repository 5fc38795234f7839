//! Outbox listing command implementation.

use super::open_outbox;
use fieldsync_protocol::PendingOperation;
use std::path::Path;

/// Runs the outbox command.
pub fn run(
    path: &Path,
    parked_only: bool,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let (_store, outbox) = open_outbox(path)?;
    let ops: Vec<PendingOperation> = outbox
        .list()?
        .into_iter()
        .filter(|op| !parked_only || op.is_parked())
        .take(limit.unwrap_or(usize::MAX))
        .collect();

    match format {
        "json" => {
            let values: Vec<_> = ops.iter().map(PendingOperation::to_value).collect();
            println!("{}", serde_json::to_string_pretty(&values)?);
        }
        _ => print_text_output(&ops),
    }
    Ok(())
}

fn print_text_output(ops: &[PendingOperation]) {
    if ops.is_empty() {
        println!("Outbox is empty");
        return;
    }
    println!(
        "{:<38} {:<14} {:>7} {:>15}  {}",
        "ID", "TYPE", "ATTEMPT", "NEXT ATTEMPT", "LAST ERROR"
    );
    for op in ops {
        let marker = if op.is_parked() { " [parked]" } else { "" };
        println!(
            "{:<38} {:<14} {:>7} {:>15}  {}{}",
            op.id,
            op.mutation.kind(),
            op.attempt,
            op.next_attempt_at,
            op.last_error.as_deref().unwrap_or("-"),
            marker
        );
    }
    println!();
    println!("{} operation(s)", ops.len());
}
