//! Verify command implementation.

use crate::Format;
use objdb_core::{verify_file, VerifyReport};
use std::path::Path;
use tracing::{info, warn};

/// Runs the verify command.
pub fn run(path: &Path, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No data file at {}", path.display()).into());
    }
    let report = verify_file(path)?;
    info!(
        transactions = report.transactions,
        records = report.records,
        warnings = report.warnings.len(),
        "verified data file"
    );
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        Format::Text => print_report(path, &report),
    }
    if report.is_ok() {
        Ok(())
    } else {
        warn!(errors = report.errors.len(), "data file failed verification");
        Err("Verification failed".into())
    }
}

fn print_report(path: &Path, report: &VerifyReport) {
    println!("Verifying {}", path.display());
    println!();
    println!("  Transactions: {}", report.transactions);
    println!("  Records:      {}", report.records);
    println!("  Objects:      {}", report.objects);
    println!("  Last TID:     {}", report.last_tid);
    println!("  Size:         {} bytes", report.size);

    if !report.warnings.is_empty() {
        println!();
        println!("  Warnings:");
        for warning in &report.warnings {
            println!("    - {warning}");
        }
    }
    if !report.errors.is_empty() {
        println!();
        println!("  Errors:");
        for error in &report.errors {
            println!("    - {error}");
        }
    }

    println!();
    if report.is_ok() {
        println!("✓ Verification passed");
    } else {
        println!("✗ Verification failed ({} errors)", report.errors.len());
    }
}
