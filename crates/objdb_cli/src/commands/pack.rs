//! Pack command implementation.

use objdb_core::serialize::references;
use objdb_core::{tid_before_now, FileStorage, PackResult, ReferencesFn, Storage, StorageConfig, Tid};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Packs the file at `path` and returns the outcome.
pub fn pack_file(
    path: &Path,
    cutoff: Tid,
    gc: bool,
) -> Result<PackResult, Box<dyn std::error::Error>> {
    let storage = FileStorage::open(StorageConfig::new(path).pack_gc(gc))?;
    info!(path = %path.display(), %cutoff, gc, "packing data file");
    let result = storage.pack(cutoff, &references as &ReferencesFn)?;
    storage.close()?;
    info!(
        reclaimed = result.bytes_before.saturating_sub(result.bytes_after),
        objects_removed = result.objects_removed,
        "pack complete"
    );
    Ok(result)
}

/// Runs the pack command.
pub fn run(
    path: &Path,
    tid: Option<Tid>,
    days: Option<f64>,
    gc: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No data file at {}", path.display()).into());
    }
    let cutoff = match (tid, days) {
        (Some(tid), _) => tid,
        (None, Some(days)) if days.is_finite() && days >= 0.0 => {
            tid_before_now(Duration::from_secs_f64(days * 86_400.0))
        }
        (None, Some(days)) => return Err(format!("Invalid number of days: {days}").into()),
        (None, None) => Tid::MAX,
    };

    println!("Packing {}", path.display());
    if !gc {
        println!("(garbage collection disabled)");
    }
    let result = pack_file(path, cutoff, gc)?;

    println!();
    println!("  Cutoff:          {}", result.cutoff);
    println!(
        "  Transactions:    {} -> {}",
        result.transactions_before, result.transactions_after
    );
    println!(
        "  Records:         {} -> {}",
        result.records_before, result.records_after
    );
    println!("  Objects removed: {}", result.objects_removed);
    println!(
        "  Size:            {} -> {} bytes",
        result.bytes_before, result.bytes_after
    );
    println!();
    println!("✓ Pack complete");
    Ok(())
}
