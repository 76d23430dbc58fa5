//! Offline consistency checking.

use super::format::{
    be_u64, DataHeader, TxnHeader, TxnStatus, DATA_HEADER_LEN, FIRST_TXN_POS, MAGIC,
    TRAILER_LEN, TXN_HEADER_LEN,
};
use super::index::FsIndex;
use super::reader::LogReader;
use super::storage::FileStorage;
use crate::error::CoreResult;
use crate::serialize::references;
use crate::types::{Oid, Tid};
use objdb_storage::{FileBackend, StorageBackend};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// What [`FileStorage::verify`] found.
///
/// Errors are violations of the log format; warnings are conditions a
/// healthy log can legitimately be in (an incomplete tail that recovery
/// would remove, a reference to an object that was garbage collected).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    /// Committed transactions scanned.
    pub transactions: usize,
    /// Records scanned.
    pub records: usize,
    /// Objects with a live current revision.
    pub objects: usize,
    /// TID of the last transaction.
    pub last_tid: Tid,
    /// Bytes covered by committed transactions.
    pub size: u64,
    /// Format violations.
    pub errors: Vec<String>,
    /// Non-fatal findings.
    pub warnings: Vec<String>,
}

impl VerifyReport {
    /// True if no errors were found.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

impl FileStorage {
    /// Checks the committed part of the log and the in-memory index.
    pub fn verify(&self) -> CoreResult<VerifyReport> {
        self.ensure_open()?;
        let state = self.state.read();
        Ok(verify_log(&*state.backend, state.end, Some(&state.index)))
    }
}

/// Checks a data file without opening it as a storage.
///
/// The file is opened read-only and no lock is taken, so this is safe to
/// run against a file another process is writing to.
pub fn verify_file(path: &Path) -> CoreResult<VerifyReport> {
    let backend = FileBackend::open_read_only(path)?;
    let size = backend.size()?;
    Ok(verify_log(&backend, size, None))
}

fn verify_log(backend: &dyn StorageBackend, size: u64, index: Option<&FsIndex>) -> VerifyReport {
    let mut report = VerifyReport::default();
    let reader = LogReader::new(backend);
    match reader.read(0, FIRST_TXN_POS.min(size)) {
        Ok(magic) if magic == MAGIC => {}
        _ => {
            report.errors.push("file does not start with FS21 magic".to_string());
            return report;
        }
    }

    let mut current: BTreeMap<Oid, u64> = BTreeMap::new();
    let mut pos = FIRST_TXN_POS;
    while pos < size {
        if size - pos < TXN_HEADER_LEN {
            report.warnings.push(format!("partial transaction header at {pos}"));
            break;
        }
        let header = match reader.txn_header(pos) {
            Ok(header) => header,
            Err(e) => {
                report.errors.push(e.to_string());
                break;
            }
        };
        let next = match header.next_pos(pos) {
            Ok(next) => next,
            Err(e) => {
                report.errors.push(e.to_string());
                break;
            }
        };
        if next > size {
            report
                .warnings
                .push(format!("incomplete transaction at {pos} runs past end of file"));
            break;
        }
        if header.status == TxnStatus::Checkpoint {
            if next == size {
                report.warnings.push(format!("uncommitted transaction at {pos}"));
            } else {
                report
                    .errors
                    .push(format!("uncommitted transaction at {pos} is followed by more data"));
            }
            break;
        }
        match reader.read(next - TRAILER_LEN, TRAILER_LEN) {
            Ok(trailer) if be_u64(&trailer) == header.length => {}
            Ok(trailer) => report.errors.push(format!(
                "transaction at {pos} has trailing length {} but header length {}",
                be_u64(&trailer),
                header.length
            )),
            Err(e) => report.errors.push(e.to_string()),
        }
        if header.tid <= report.last_tid {
            report.errors.push(format!(
                "transaction {} at {pos} is not after {}",
                header.tid, report.last_tid
            ));
        }
        check_records(&reader, pos, &header, &mut current, &mut report);

        report.last_tid = report.last_tid.max(header.tid);
        report.transactions += 1;
        pos = next;
    }
    report.size = pos;

    if let Some(index) = index {
        let expected: Vec<(Oid, u64)> = current.iter().map(|(oid, pos)| (*oid, *pos)).collect();
        let actual: Vec<(Oid, u64)> = index.iter().collect();
        if expected != actual {
            report.errors.push(format!(
                "index has {} entries but the log has {} objects, or they point elsewhere",
                actual.len(),
                expected.len()
            ));
        }
    }
    check_references(&reader, &current, &mut report);
    report
}

fn check_records(
    reader: &LogReader<'_>,
    pos: u64,
    header: &TxnHeader,
    current: &mut BTreeMap<Oid, u64>,
    report: &mut VerifyReport,
) {
    let mut rpos = header.records_start(pos);
    let end = header.records_end(pos);
    while rpos < end {
        if end - rpos < DATA_HEADER_LEN {
            report.errors.push(format!("truncated record header at {rpos}"));
            return;
        }
        let record = match reader.data_header(rpos) {
            Ok(record) => record,
            Err(e) => {
                report.errors.push(e.to_string());
                return;
            }
        };
        let next = rpos + record.record_len();
        if next > end {
            report
                .errors
                .push(format!("record at {rpos} overruns transaction at {pos}"));
            return;
        }
        if record.tid != header.tid || record.txn_pos != pos {
            report
                .errors
                .push(format!("record at {rpos} does not belong to transaction at {pos}"));
        }
        let previous = current.get(&record.oid).copied().unwrap_or(0);
        if record.prev != previous {
            report.errors.push(format!(
                "record at {rpos} for {} has prev {} but the previous revision is at {previous}",
                record.oid, record.prev
            ));
        }
        if record.is_back_pointer() {
            check_back_pointer(reader, rpos, &record, report);
        }
        current.insert(record.oid, rpos);
        report.records += 1;
        rpos = next;
    }
}

fn check_back_pointer(reader: &LogReader<'_>, rpos: u64, record: &DataHeader, report: &mut VerifyReport) {
    let target = match reader.back_pointer(rpos) {
        Ok(target) => target,
        Err(e) => {
            report.errors.push(e.to_string());
            return;
        }
    };
    if target == 0 {
        return;
    }
    if target >= rpos {
        report
            .errors
            .push(format!("back-pointer at {rpos} does not point backwards"));
        return;
    }
    match reader.data_header(target) {
        Ok(carrier) if carrier.oid == record.oid && carrier.tid < record.tid => {}
        Ok(carrier) => report.errors.push(format!(
            "back-pointer at {rpos} for {} leads to {} at {}",
            record.oid, carrier.oid, carrier.tid
        )),
        Err(e) => report.errors.push(format!("back-pointer at {rpos}: {e}")),
    }
}

fn check_references(reader: &LogReader<'_>, current: &BTreeMap<Oid, u64>, report: &mut VerifyReport) {
    let mut live = BTreeMap::new();
    for (oid, pos) in current {
        let data = reader
            .data_header(*pos)
            .and_then(|header| reader.record_data(*pos, &header));
        match data {
            Ok(Some(data)) => {
                live.insert(*oid, data);
            }
            Ok(None) => {}
            Err(e) => report.errors.push(format!("cannot load {oid}: {e}")),
        }
    }
    report.objects = live.len();

    for (oid, data) in &live {
        match references(data) {
            Ok(targets) => {
                for target in targets {
                    if !live.contains_key(&target) {
                        report
                            .warnings
                            .push(format!("{oid} references missing object {target}"));
                    }
                }
            }
            Err(e) => report
                .warnings
                .push(format!("cannot scan references of {oid}: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::serialize::{encode_record, ClassInfo};
    use crate::storage::{Storage, TransactionMeta};
    use crate::filestorage::format::STATUS_OFFSET;
    use objdb_codec::{PersistentRef, Value};
    use objdb_storage::InMemoryBackend;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::tempdir;

    fn payload(refs: &[u64]) -> Vec<u8> {
        let state = Value::Array(
            refs.iter()
                .map(|oid| PersistentRef::Bare(Oid::from_u64(*oid).to_bytes()).to_value())
                .collect(),
        );
        encode_record(&ClassInfo::new("tests", "Node"), &state)
    }

    fn commit(storage: &FileStorage, writes: &[(u64, Vec<u8>)]) -> Tid {
        let txn = TransactionMeta::new();
        storage.tpc_begin(&txn).unwrap();
        for (oid, data) in writes {
            let oid = Oid::from_u64(*oid);
            let expected = storage.load(oid).map(|(_, tid)| tid).unwrap_or(Tid::ZERO);
            storage.store(oid, expected, data.clone(), &txn).unwrap();
        }
        let proposed = storage.tpc_vote(&txn).unwrap().unwrap();
        storage.tpc_finish(&txn, proposed, None).unwrap()
    }

    #[test]
    fn healthy_log_verifies() {
        let storage = FileStorage::open_in_memory().unwrap();
        commit(&storage, &[(0, payload(&[1])), (1, payload(&[]))]);
        let last = commit(&storage, &[(1, payload(&[0]))]);
        let report = storage.verify().unwrap();
        assert!(report.is_ok(), "{:?}", report.errors);
        assert!(report.warnings.is_empty());
        assert_eq!(report.transactions, 2);
        assert_eq!(report.records, 3);
        assert_eq!(report.objects, 2);
        assert_eq!(report.last_tid, last);
    }

    #[test]
    fn dangling_references_are_warnings() {
        let storage = FileStorage::open_in_memory().unwrap();
        commit(&storage, &[(0, payload(&[9]))]);
        let report = storage.verify().unwrap();
        assert!(report.is_ok());
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("missing"));
    }

    #[test]
    fn detects_broken_prev_pointer() {
        let storage = FileStorage::open_in_memory().unwrap();
        commit(&storage, &[(1, payload(&[]))]);
        let t2 = commit(&storage, &[(1, payload(&[]))]);
        let size = storage.size();
        let bytes = {
            let state = storage.state.read();
            let mut bytes = state.backend.read_at(0, size as usize).unwrap();
            let (pos, _) = state.reader().find_txn(t2, size).unwrap().unwrap();
            let header = state.reader().txn_header(pos).unwrap();
            // Zero the prev pointer of the second revision.
            let prev = (header.records_start(pos) + 16) as usize;
            bytes[prev..prev + 8].copy_from_slice(&[0; 8]);
            bytes
        };
        let backend = InMemoryBackend::with_data(bytes);
        let report = verify_log(&backend, size, None);
        assert!(!report.is_ok());
        assert!(report.errors[0].contains("prev"));
    }

    #[test]
    fn detects_bad_magic() {
        let backend = InMemoryBackend::with_data(b"ZZZZ".to_vec());
        let report = verify_log(&backend, 4, None);
        assert_eq!(report.errors.len(), 1);
    }

    #[test]
    fn verifies_files_with_incomplete_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Data.fs");
        {
            let storage = FileStorage::open(StorageConfig::new(&path).create(true)).unwrap();
            commit(&storage, &[(0, payload(&[]))]);
            commit(&storage, &[(0, payload(&[]))]);
        }
        let report = verify_file(&path).unwrap();
        assert!(report.is_ok());
        assert_eq!(report.transactions, 2);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0u8; 10]).unwrap();
        drop(file);
        let report = verify_file(&path).unwrap();
        assert!(report.is_ok());
        assert_eq!(report.transactions, 2);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn uncommitted_block_in_the_middle_is_an_error() {
        let storage = FileStorage::open_in_memory().unwrap();
        let t1 = commit(&storage, &[(0, payload(&[]))]);
        commit(&storage, &[(0, payload(&[]))]);
        let size = storage.size();
        let bytes = {
            let state = storage.state.read();
            let mut bytes = state.backend.read_at(0, size as usize).unwrap();
            let (pos, _) = state.reader().find_txn(t1, size).unwrap().unwrap();
            bytes[(pos + STATUS_OFFSET) as usize] = TxnStatus::Checkpoint.as_byte();
            bytes
        };
        let report = verify_log(&InMemoryBackend::with_data(bytes), size, None);
        assert!(!report.is_ok());
    }
}
