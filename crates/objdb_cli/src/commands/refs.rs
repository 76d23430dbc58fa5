//! Refs command implementation.

use super::{open_read_only, scan};
use crate::Format;
use objdb_core::serialize::references;
use objdb_core::FileStorage;
use serde::Serialize;
use std::path::Path;

/// A reference whose target has no current revision.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct DanglingRef {
    /// Referencing object.
    pub from: String,
    /// Missing target.
    pub to: String,
}

/// Result of a reference check.
#[derive(Debug, Default, Serialize)]
pub struct RefsReport {
    /// Objects checked.
    pub objects: usize,
    /// References followed.
    pub references: usize,
    /// Dangling references.
    pub dangling: Vec<DanglingRef>,
    /// Objects whose payload could not be scanned.
    pub unreadable: Vec<String>,
}

/// Checks every current revision for references to missing objects.
pub fn collect(storage: &FileStorage) -> Result<RefsReport, Box<dyn std::error::Error>> {
    let scan = scan(storage)?;
    let mut report = RefsReport {
        objects: scan.current.len(),
        ..RefsReport::default()
    };
    for (oid, data) in &scan.current {
        let Ok(targets) = references(data) else {
            report.unreadable.push(oid.to_string());
            continue;
        };
        report.references += targets.len();
        for target in targets {
            if !scan.current.contains_key(&target) {
                report.dangling.push(DanglingRef {
                    from: oid.to_string(),
                    to: target.to_string(),
                });
            }
        }
    }
    Ok(report)
}

/// Runs the refs command.
pub fn run(path: &Path, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let storage = open_read_only(path)?;
    let report = collect(&storage)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        Format::Text => {
            println!(
                "Checked {} references in {} objects",
                report.references, report.objects
            );
            for oid in &report.unreadable {
                println!("  unreadable payload: {oid}");
            }
            for dangling in &report.dangling {
                println!("  {} -> {} (missing)", dangling.from, dangling.to);
            }
            if report.dangling.is_empty() && report.unreadable.is_empty() {
                println!("✓ No dangling references");
            }
        }
    }
    if report.dangling.is_empty() {
        Ok(())
    } else {
        Err(format!("{} dangling references", report.dangling.len()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objdb_codec::{PersistentRef, Value};
    use objdb_core::serialize::{encode_record, ClassInfo};
    use objdb_core::{Oid, Storage, Tid, TransactionMeta};

    #[test]
    fn finds_missing_targets() {
        let storage = FileStorage::open_in_memory().unwrap();
        let state = Value::Array(vec![
            PersistentRef::Bare(Oid::from_u64(1).to_bytes()).to_value(),
            PersistentRef::Bare(Oid::from_u64(9).to_bytes()).to_value(),
        ]);
        let txn = TransactionMeta::new();
        storage.tpc_begin(&txn).unwrap();
        storage
            .store(Oid::ROOT, Tid::ZERO, encode_record(&ClassInfo::persistent_mapping(), &state), &txn)
            .unwrap();
        storage
            .store(Oid::from_u64(1), Tid::ZERO, encode_record(&ClassInfo::new("app", "Leaf"), &Value::Null), &txn)
            .unwrap();
        let tid = storage.tpc_vote(&txn).unwrap().unwrap();
        storage.tpc_finish(&txn, tid, None).unwrap();

        let report = collect(&storage).unwrap();
        assert_eq!(report.objects, 2);
        assert_eq!(report.references, 2);
        assert_eq!(
            report.dangling,
            vec![DanglingRef {
                from: Oid::ROOT.to_string(),
                to: Oid::from_u64(9).to_string(),
            }]
        );
    }
}
