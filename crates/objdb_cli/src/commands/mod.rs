//! CLI command implementations.

pub mod dump;
pub mod pack;
pub mod refs;
pub mod stats;
pub mod verify;

use objdb_core::{FileStorage, Oid};
use std::collections::BTreeMap;
use std::path::Path;

/// Opens a data file for inspection.
fn open_read_only(path: &Path) -> Result<FileStorage, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No data file at {}", path.display()).into());
    }
    Ok(FileStorage::open_read_only(path)?)
}

/// Log totals plus the payload of every object's current revision.
struct Scan {
    transactions: usize,
    records: usize,
    current: BTreeMap<Oid, Vec<u8>>,
}

fn scan(storage: &FileStorage) -> Result<Scan, Box<dyn std::error::Error>> {
    let mut scan = Scan {
        transactions: 0,
        records: 0,
        current: BTreeMap::new(),
    };
    for txn in storage.transactions(None, None) {
        let txn = txn?;
        scan.transactions += 1;
        scan.records += txn.records.len();
        for record in txn.records {
            match record.data {
                Some(data) => {
                    scan.current.insert(record.oid, data);
                }
                None => {
                    scan.current.remove(&record.oid);
                }
            }
        }
    }
    Ok(scan)
}
