//! Dump command implementation.

use super::open_read_only;
use crate::Format;
use objdb_core::serialize::{decode_class, references};
use objdb_core::{FileStorage, Tid, TransactionRecord};
use serde::Serialize;
use std::path::Path;
use tracing::info;

/// One dumped transaction.
#[derive(Debug, Serialize)]
pub struct DumpedTransaction {
    /// Transaction TID.
    pub tid: String,
    /// Status byte as a character.
    pub status: char,
    /// Offset of the header.
    pub position: u64,
    /// Committing user.
    pub user: String,
    /// Description.
    pub description: String,
    /// Records in log order.
    pub records: Vec<DumpedRecord>,
}

/// One dumped data record.
#[derive(Debug, Serialize)]
pub struct DumpedRecord {
    /// Object id.
    pub oid: String,
    /// Offset of the record.
    pub position: u64,
    /// Payload size; `None` for an undone creation.
    pub size: Option<usize>,
    /// Class of the payload, if it decodes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    /// Strong references.
    pub references: Vec<String>,
    /// Transaction holding the bytes, for back-pointers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_txn: Option<String>,
}

impl DumpedTransaction {
    fn from_record(txn: &TransactionRecord) -> Self {
        let records = txn
            .records
            .iter()
            .map(|record| {
                let data = record.data.as_deref();
                DumpedRecord {
                    oid: record.oid.to_string(),
                    position: record.position,
                    size: data.map(<[u8]>::len),
                    class: data.and_then(|d| decode_class(d).ok()).map(|c| c.to_string()),
                    references: data
                        .and_then(|d| references(d).ok())
                        .unwrap_or_default()
                        .iter()
                        .map(ToString::to_string)
                        .collect(),
                    data_txn: record.data_txn.map(|t| t.to_string()),
                }
            })
            .collect();
        Self {
            tid: txn.tid.to_string(),
            status: txn.status.as_byte() as char,
            position: txn.position,
            user: txn.user_lossy(),
            description: txn.description_lossy(),
            records,
        }
    }
}

/// Collects transactions in `[start, stop]`, at most `limit` of them.
pub fn collect(
    storage: &FileStorage,
    start: Option<Tid>,
    stop: Option<Tid>,
    limit: Option<usize>,
) -> Result<Vec<DumpedTransaction>, Box<dyn std::error::Error>> {
    let mut out = Vec::new();
    for txn in storage.transactions(start, stop) {
        if limit.is_some_and(|limit| out.len() >= limit) {
            break;
        }
        out.push(DumpedTransaction::from_record(&txn?));
    }
    Ok(out)
}

/// Runs the dump command.
pub fn run(
    path: &Path,
    start: Option<Tid>,
    stop: Option<Tid>,
    limit: Option<usize>,
    format: Format,
) -> Result<(), Box<dyn std::error::Error>> {
    let storage = open_read_only(path)?;
    let transactions = collect(&storage, start, stop, limit)?;
    info!(transactions = transactions.len(), "dumping transactions");
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&transactions)?),
        Format::Text => {
            for txn in &transactions {
                println!(
                    "{} [{}] @{} user={:?} description={:?}",
                    txn.tid, txn.status, txn.position, txn.user, txn.description
                );
                for record in &txn.records {
                    let size = record
                        .size
                        .map_or_else(|| "undone creation".to_string(), |s| format!("{s} bytes"));
                    print!("  {} @{} {}", record.oid, record.position, size);
                    if let Some(class) = &record.class {
                        print!(" {class}");
                    }
                    if let Some(data_txn) = &record.data_txn {
                        print!(" (data from {data_txn})");
                    }
                    println!();
                    if !record.references.is_empty() {
                        println!("    -> {}", record.references.join(", "));
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use objdb_codec::{PersistentRef, Value};
    use objdb_core::serialize::{encode_record, ClassInfo};
    use objdb_core::{Oid, Storage, StorageConfig, TransactionMeta};
    use tempfile::TempDir;

    #[test]
    fn dump_reports_classes_and_references() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.fs");
        {
            let storage = FileStorage::open(StorageConfig::new(&path).create(true)).unwrap();
            let txn = TransactionMeta::new().user("alice").description("setup");
            let child = Oid::from_u64(1);
            let root_state = Value::map(vec![(
                Value::text("child"),
                PersistentRef::Bare(child.to_bytes()).to_value(),
            )]);
            storage.tpc_begin(&txn).unwrap();
            storage
                .store(Oid::ROOT, Tid::ZERO, encode_record(&ClassInfo::persistent_mapping(), &root_state), &txn)
                .unwrap();
            storage
                .store(child, Tid::ZERO, encode_record(&ClassInfo::new("app", "Leaf"), &Value::Null), &txn)
                .unwrap();
            let tid = storage.tpc_vote(&txn).unwrap().unwrap();
            storage.tpc_finish(&txn, tid, None).unwrap();
            storage.close().unwrap();
        }

        let storage = FileStorage::open_read_only(&path).unwrap();
        let dumped = collect(&storage, None, None, None).unwrap();
        assert_eq!(dumped.len(), 1);
        assert_eq!(dumped[0].user, "alice");
        assert_eq!(dumped[0].status, ' ');
        let root = &dumped[0].records[0];
        assert_eq!(root.class.as_deref(), Some("persistent.mapping/PersistentMapping"));
        assert_eq!(root.references, vec![Oid::from_u64(1).to_string()]);
        assert_eq!(dumped[0].records[1].class.as_deref(), Some("app/Leaf"));

        assert!(collect(&storage, None, None, Some(0)).unwrap().is_empty());
    }
}
