//! objdb CLI
//!
//! Maintenance tools for objdb data files.
//!
//! # Commands
//!
//! - `verify` - Check a data file without modifying it
//! - `dump` - Print transactions, records and references
//! - `stats` - Object, transaction and byte counts per class
//! - `refs` - Report dangling references in current revisions
//! - `pack` - Drop old history and unreachable objects

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use objdb_core::Tid;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// objdb command-line maintenance tools.
#[derive(Parser)]
#[command(name = "objdb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the data file
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Output format for reporting commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human-readable text
    Text,
    /// Pretty-printed JSON
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Check file structure, back-pointers and the index
    Verify {
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Dump transactions and their records
    Dump {
        /// First TID to include (hex or decimal)
        #[arg(long)]
        start: Option<Tid>,

        /// Last TID to include (hex or decimal)
        #[arg(long)]
        stop: Option<Tid>,

        /// Maximum number of transactions to print
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Display object, transaction and size statistics
    Stats {
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Report references to objects that have no current revision
    Refs {
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Pack the data file
    Pack {
        /// Pack up to this TID (hex or decimal)
        #[arg(long, conflicts_with = "days")]
        tid: Option<Tid>,

        /// Keep this many days of history
        #[arg(long)]
        days: Option<f64>,

        /// Keep unreachable objects
        #[arg(long)]
        no_gc: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Verify { format } => {
            let path = cli.path.ok_or("Data file path required for verify")?;
            commands::verify::run(&path, format)?;
        }
        Commands::Dump {
            start,
            stop,
            limit,
            format,
        } => {
            let path = cli.path.ok_or("Data file path required for dump")?;
            commands::dump::run(&path, start, stop, limit, format)?;
        }
        Commands::Stats { format } => {
            let path = cli.path.ok_or("Data file path required for stats")?;
            commands::stats::run(&path, format)?;
        }
        Commands::Refs { format } => {
            let path = cli.path.ok_or("Data file path required for refs")?;
            commands::refs::run(&path, format)?;
        }
        Commands::Pack { tid, days, no_gc } => {
            let path = cli.path.ok_or("Data file path required for pack")?;
            commands::pack::run(&path, tid, days, !no_gc)?;
        }
        Commands::Version => {
            println!("objdb CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Data file format {}", String::from_utf8_lossy(objdb_core::filestorage::MAGIC));
        }
    }

    Ok(())
}
