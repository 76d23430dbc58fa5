//! Stats command implementation.

use super::{open_read_only, scan};
use crate::Format;
use objdb_core::serialize::decode_class;
use objdb_core::{FileStorage, Storage};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Data file statistics.
#[derive(Debug, Serialize)]
pub struct Stats {
    /// Data file path.
    pub path: String,
    /// File size in bytes.
    pub size: u64,
    /// Committed transactions.
    pub transactions: usize,
    /// Data records, all revisions.
    pub records: usize,
    /// Objects with a current revision.
    pub objects: usize,
    /// Latest TID.
    pub last_tid: String,
    /// Current revisions grouped by class.
    pub classes: Vec<ClassStats>,
}

/// Statistics for one class.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ClassStats {
    /// `module/name`, or `<undecodable>`.
    pub class: String,
    /// Objects of this class.
    pub objects: usize,
    /// Payload bytes of their current revisions.
    pub bytes: usize,
}

/// Gathers statistics for an open storage.
pub fn collect(storage: &FileStorage, path: &Path) -> Result<Stats, Box<dyn std::error::Error>> {
    let scan = scan(storage)?;
    let mut classes: BTreeMap<String, (usize, usize)> = BTreeMap::new();
    for data in scan.current.values() {
        let class = decode_class(data).map_or_else(|_| "<undecodable>".to_string(), |c| c.to_string());
        let entry = classes.entry(class).or_insert((0, 0));
        entry.0 += 1;
        entry.1 += data.len();
    }
    Ok(Stats {
        path: path.display().to_string(),
        size: storage.size(),
        transactions: scan.transactions,
        records: scan.records,
        objects: scan.current.len(),
        last_tid: storage.last_tid().to_string(),
        classes: classes
            .into_iter()
            .map(|(class, (objects, bytes))| ClassStats {
                class,
                objects,
                bytes,
            })
            .collect(),
    })
}

/// Runs the stats command.
pub fn run(path: &Path, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let storage = open_read_only(path)?;
    let stats = collect(&storage, path)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
        Format::Text => {
            println!("Data file: {}", stats.path);
            println!();
            println!("  Size:         {} bytes", stats.size);
            println!("  Transactions: {}", stats.transactions);
            println!("  Records:      {}", stats.records);
            println!("  Objects:      {}", stats.objects);
            println!("  Last TID:     {}", stats.last_tid);
            if !stats.classes.is_empty() {
                println!();
                println!("  {:<48} {:>8} {:>12}", "Class", "Objects", "Bytes");
                for class in &stats.classes {
                    println!("  {:<48} {:>8} {:>12}", class.class, class.objects, class.bytes);
                }
            }
        }
    }
    Ok(())
}
