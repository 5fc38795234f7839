//! fieldsync CLI
//!
//! Command-line tools for inspecting and repairing a client's local store.
//!
//! # Commands
//!
//! - `status` - Queue depth, parked operations and last sync time
//! - `outbox` - List pending operations
//! - `sanitize` - Show what the sanitizer does to a mutation file
//! - `amend` - Replace the payload of a pending operation
//! - `discard` - Drop a pending operation

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// fieldsync command-line store tools.
#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the client store directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display queue depth and sync bookkeeping
    Status {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List pending operations in due order
    Outbox {
        /// Only show parked operations
        #[arg(long)]
        parked: bool,

        /// Maximum number of operations to show
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Sanitize a mutation file (`{"type": ..., "payload": ...}`) and print the result
    Sanitize {
        /// JSON file holding the mutation
        file: PathBuf,
    },

    /// Replace the payload of a pending operation and make it due now
    Amend {
        /// Operation id
        op_id: String,

        /// JSON file holding the new mutation
        file: PathBuf,
    },

    /// Drop a pending operation without applying it
    Discard {
        /// Operation id
        op_id: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Status { format } => {
            let path = cli.path.ok_or("Store path required for status")?;
            commands::status::run(&path, &format)?;
        }
        Commands::Outbox {
            parked,
            limit,
            format,
        } => {
            let path = cli.path.ok_or("Store path required for outbox")?;
            commands::outbox::run(&path, parked, limit, &format)?;
        }
        Commands::Sanitize { file } => {
            commands::sanitize::run(&file)?;
        }
        Commands::Amend { op_id, file } => {
            let path = cli.path.ok_or("Store path required for amend")?;
            commands::amend::run(&path, &op_id, &file)?;
        }
        Commands::Discard { op_id } => {
            let path = cli.path.ok_or("Store path required for discard")?;
            commands::discard::run(&path, &op_id)?;
        }
        Commands::Version => {
            println!("fieldsync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
