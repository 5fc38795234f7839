//! Sanitize command implementation.

use super::read_mutation;
use std::path::Path;

/// Runs the sanitize command.
///
/// Prints the transmittable mutation and the corrections made. Fails with
/// the first invalid field, exactly as an enqueue would.
pub fn run(file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let mutation = read_mutation(file)?;
    let (clean, report) = mutation.sanitize()?;

    println!("{}", serde_json::to_string_pretty(&clean.to_value())?);
    if report.is_clean() {
        eprintln!("No corrections needed");
        return Ok(());
    }

    eprintln!("Corrections: {}", report.summary());
    for path in &report.removed_paths {
        eprintln!("  removed   {path}");
    }
    for path in &report.numeric_corrections {
        eprintln!("  nulled    {path}");
    }
    for path in &report.string_corrections {
        eprintln!("  trimmed   {path}");
    }
    Ok(())
}
