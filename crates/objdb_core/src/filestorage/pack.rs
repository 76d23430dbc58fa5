//! Pack and garbage collection.
//!
//! Pack rewrites the log into a sibling file keeping, for every object,
//! the revision current at the cutoff and every later revision. With
//! `pack_gc` on, objects not reachable from the root (or from anything
//! written after the cutoff) are dropped as well.
//!
//! Commits keep running while the bulk of the log is copied. Once the copy
//! is done, pack takes the commit slot, replays whatever was committed in
//! the meantime and swaps the files.

use super::files::{index_path, old_path, pack_path, sync_parent_dir};
use super::format::{
    BlockBuilder, DataHeader, TxnHeader, TxnStatus, DATA_HEADER_LEN, FIRST_TXN_POS, MAGIC,
};
use super::reader::LogReader;
use super::recovery::scan;
use super::storage::FileStorage;
use crate::error::{CoreError, CoreResult};
use crate::storage::ReferencesFn;
use crate::types::{Oid, Tid};
use objdb_storage::{FileBackend, InMemoryBackend, StorageBackend};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Summary of a pack run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PackResult {
    /// Effective cutoff (never later than the last committed TID).
    pub cutoff: Tid,
    /// Transactions in the log before packing.
    pub transactions_before: usize,
    /// Transactions written to the packed log.
    pub transactions_after: usize,
    /// Records before packing.
    pub records_before: usize,
    /// Records after packing.
    pub records_after: usize,
    /// Objects that no longer have any record.
    pub objects_removed: usize,
    /// Log size before packing.
    pub bytes_before: u64,
    /// Log size after packing.
    pub bytes_after: u64,
}

#[derive(Debug, Clone)]
struct LaidRecord {
    pos: u64,
    header: DataHeader,
    back_pointer: Option<u64>,
}

#[derive(Debug)]
struct LaidTxn {
    pos: u64,
    header: TxnHeader,
    records: Vec<LaidRecord>,
}

fn read_txn(reader: &LogReader<'_>, pos: u64) -> CoreResult<LaidTxn> {
    let header = reader.txn_header(pos)?;
    let mut records = Vec::new();
    for (rpos, record) in reader.records(pos, &header)? {
        let back_pointer = if record.is_back_pointer() {
            Some(reader.back_pointer(rpos)?)
        } else {
            None
        };
        records.push(LaidRecord {
            pos: rpos,
            header: record,
            back_pointer,
        });
    }
    Ok(LaidTxn {
        pos,
        header,
        records,
    })
}

/// Tracks where old records landed in the packed log.
#[derive(Debug, Default)]
struct Relocator {
    relocated: HashMap<u64, u64>,
    last_new: HashMap<Oid, u64>,
}

impl Relocator {
    /// Copies the kept records of `txn` into `out`. Returns how many were written.
    fn copy(
        &mut self,
        reader: &LogReader<'_>,
        txn: &LaidTxn,
        kept: &[&LaidRecord],
        status: TxnStatus,
        out: &mut dyn StorageBackend,
    ) -> CoreResult<usize> {
        let (user, description, extension) = reader.txn_meta(txn.pos, &txn.header)?;
        let pos = out.size()?;
        let mut block =
            BlockBuilder::new(pos, txn.header.tid, status, &user, &description, &extension)?;
        let mut moved = Vec::with_capacity(kept.len());
        for record in kept {
            let oid = record.header.oid;
            let prev = self.last_new.get(&oid).copied().unwrap_or(0);
            let new_pos = match record.back_pointer {
                None => {
                    let data = reader.record_data(record.pos, &record.header)?.unwrap_or_default();
                    block.push_data(oid, prev, &data)
                }
                Some(0) => block.push_back_pointer(oid, prev, 0),
                Some(_) => match reader.carrier(record.pos, &record.header)? {
                    Some((carrier, carrier_header)) => match self.relocated.get(&carrier) {
                        Some(&target) => block.push_back_pointer(oid, prev, target),
                        None => {
                            let data =
                                reader.read(carrier + DATA_HEADER_LEN, carrier_header.data_len)?;
                            block.push_data(oid, prev, &data)
                        }
                    },
                    None => block.push_back_pointer(oid, prev, 0),
                },
            };
            moved.push((record.pos, oid, new_pos));
        }
        let count = block.record_count();
        let (bytes, _) = block.finish();
        out.append(&bytes)?;
        for (old, oid, new_pos) in moved {
            self.relocated.insert(old, new_pos);
            self.last_new.insert(oid, new_pos);
        }
        Ok(count)
    }
}

impl FileStorage {
    /// Packs the log. See the module docs.
    ///
    /// A transaction running in the calling thread must not hold the commit
    /// slot, or the final phase waits forever.
    pub(crate) fn pack_log(&self, cutoff: Tid, references: &ReferencesFn) -> CoreResult<PackResult> {
        let _packing = self
            .pack_lock
            .try_lock()
            .ok_or_else(|| CoreError::storage("a pack is already in progress"))?;

        let (end, last_tid) = {
            let state = self.state.read();
            (state.end, state.last_tid)
        };
        let cutoff = cutoff.min(last_tid);
        if end == FIRST_TXN_POS {
            return Ok(PackResult {
                cutoff,
                bytes_before: end,
                bytes_after: end,
                ..PackResult::default()
            });
        }
        info!(storage = %self.name, %cutoff, "pack started");

        let mut out: Box<dyn StorageBackend> = match &self.path {
            Some(path) => {
                let target = pack_path(path);
                if target.exists() {
                    fs::remove_file(&target)?;
                }
                Box::new(FileBackend::open(&target)?)
            }
            None => Box::new(InMemoryBackend::new()),
        };

        let result = self.pack_into(out.as_mut(), cutoff, end, references);
        match result {
            Ok(result) => {
                drop(out);
                self.after_pack(&result)?;
                Ok(result)
            }
            Err(e) => {
                drop(out);
                if let Some(path) = &self.path {
                    if let Err(remove_error) = fs::remove_file(pack_path(path)) {
                        warn!(error = %remove_error, "failed to remove pack file");
                    }
                }
                warn!(storage = %self.name, error = %e, "pack failed; log left unchanged");
                Err(e)
            }
        }
    }

    fn pack_into(
        &self,
        out: &mut dyn StorageBackend,
        cutoff: Tid,
        end: u64,
        references: &ReferencesFn,
    ) -> CoreResult<PackResult> {
        let mut txns = Vec::new();
        let mut pos = FIRST_TXN_POS;
        while pos < end {
            let state = self.state.read();
            let txn = read_txn(&state.reader(), pos)?;
            pos = txn.header.next_pos(pos)?;
            txns.push(txn);
        }

        // Newest revision at or before the cutoff, and everything after it.
        let mut at_cutoff: HashMap<Oid, &LaidRecord> = HashMap::new();
        let mut later: HashMap<Oid, Vec<&LaidRecord>> = HashMap::new();
        for txn in &txns {
            for record in &txn.records {
                if txn.header.tid <= cutoff {
                    at_cutoff.insert(record.header.oid, record);
                } else {
                    later.entry(record.header.oid).or_default().push(record);
                }
            }
        }
        let objects_before = at_cutoff.keys().chain(later.keys()).collect::<HashSet<_>>().len();

        let mut candidates: HashMap<Oid, Vec<&LaidRecord>> = HashMap::new();
        for (oid, record) in &at_cutoff {
            if record.back_pointer != Some(0) {
                candidates.entry(*oid).or_default().push(*record);
            }
        }
        for (oid, records) in &later {
            candidates.entry(*oid).or_default().extend(records.iter().copied());
        }

        let keep_oids: HashSet<Oid> = if self.config.pack_gc {
            self.reachable(&candidates, later.keys().copied(), references)?
        } else {
            candidates.keys().copied().collect()
        };
        let kept_positions: HashSet<u64> = keep_oids
            .iter()
            .filter_map(|oid| candidates.get(oid))
            .flatten()
            .map(|record| record.pos)
            .collect();

        out.append(MAGIC)?;
        let mut relocator = Relocator::default();
        let mut result = PackResult {
            cutoff,
            transactions_before: txns.len(),
            ..PackResult::default()
        };
        for txn in &txns {
            result.records_before += txn.records.len();
            let kept: Vec<&LaidRecord> = txn
                .records
                .iter()
                .filter(|record| kept_positions.contains(&record.pos))
                .collect();
            let packed = txn.header.tid <= cutoff;
            if packed && kept.is_empty() {
                continue;
            }
            let status = if packed {
                TxnStatus::Packed
            } else {
                txn.header.status
            };
            let state = self.state.read();
            result.records_after += relocator.copy(&state.reader(), txn, &kept, status, out)?;
            result.transactions_after += 1;
        }
        result.objects_removed = objects_before.saturating_sub(keep_oids.len());

        // Final phase: no commit may be in flight while the tail is replayed
        // and the files are swapped.
        let mut slot = self.slot.lock();
        while slot.pending.is_some() {
            self.slot_released.wait(&mut slot);
        }
        let mut state = self.state.write();
        let mut tail_pos = end;
        while tail_pos < state.end {
            let reader = state.reader();
            let txn = read_txn(&reader, tail_pos)?;
            let kept: Vec<&LaidRecord> = txn.records.iter().collect();
            result.records_before += kept.len();
            result.records_after += relocator.copy(&reader, &txn, &kept, txn.header.status, out)?;
            result.transactions_before += 1;
            result.transactions_after += 1;
            tail_pos = txn.header.next_pos(tail_pos)?;
        }
        result.bytes_before = state.end;
        out.flush()?;
        out.sync()?;

        if let Some(path) = &self.path {
            swap_files(path)?;
            match FileBackend::open(path) {
                Ok(backend) => state.backend = Box::new(backend),
                Err(e) => {
                    let fatal = CoreError::storage_system(format!(
                        "failed to reopen {} after pack: {e}",
                        path.display()
                    ));
                    self.mark_inoperable(&fatal);
                    return Err(fatal);
                }
            }
        } else {
            let size = out.size()?;
            let bytes = out.read_at(0, usize::try_from(size).unwrap_or(usize::MAX))?;
            state.backend = Box::new(InMemoryBackend::with_data(bytes));
        }

        let size = state.backend.size()?;
        let rebuilt = scan(&*state.backend, size, None)?;
        state.index = rebuilt.index;
        state.end = rebuilt.end;
        state.last_tid = state.last_tid.max(rebuilt.last_tid);
        state.max_oid = state.max_oid.max(rebuilt.max_oid);
        state.generation += 1;
        result.bytes_after = state.end;
        drop(state);
        drop(slot);
        Ok(result)
    }

    /// Objects reachable from the root and from `extra_roots`.
    fn reachable(
        &self,
        candidates: &HashMap<Oid, Vec<&LaidRecord>>,
        extra_roots: impl Iterator<Item = Oid>,
        references: &ReferencesFn,
    ) -> CoreResult<HashSet<Oid>> {
        let mut seen: HashSet<Oid> = HashSet::new();
        let mut stack: Vec<Oid> = std::iter::once(Oid::ROOT).chain(extra_roots).collect();
        while let Some(oid) = stack.pop() {
            if !seen.insert(oid) {
                continue;
            }
            let Some(records) = candidates.get(&oid) else {
                continue;
            };
            for record in records {
                let data = {
                    let state = self.state.read();
                    state.reader().record_data(record.pos, &record.header)?
                };
                let Some(data) = data else {
                    continue;
                };
                for target in references(&data)? {
                    if !seen.contains(&target) {
                        stack.push(target);
                    }
                }
            }
        }
        seen.retain(|oid| candidates.contains_key(oid));
        Ok(seen)
    }

    fn after_pack(&self, result: &PackResult) -> CoreResult<()> {
        info!(
            storage = %self.name,
            cutoff = %result.cutoff,
            transactions = result.transactions_after,
            records_removed = result.records_before - result.records_after,
            objects_removed = result.objects_removed,
            bytes_before = result.bytes_before,
            bytes_after = result.bytes_after,
            "pack finished"
        );
        if let Some(path) = &self.path {
            if self.config.save_index {
                self.save_index()?;
            } else {
                let sidecar = index_path(path);
                if sidecar.exists() {
                    fs::remove_file(sidecar)?;
                }
            }
        }
        if result.objects_removed > 0 {
            self.notify_cache_invalidation();
        }
        Ok(())
    }
}

/// Moves the current file to `.old` and the pack output into place.
fn swap_files(path: &Path) -> CoreResult<()> {
    let old = old_path(path);
    if old.exists() {
        fs::remove_file(&old)?;
    }
    if fs::hard_link(path, &old).is_err() {
        fs::copy(path, &old)?;
    }
    fs::rename(pack_path(path), path)?;
    sync_parent_dir(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::storage::{Storage, TransactionMeta};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    /// Payloads are a tag byte followed by referenced OIDs, one byte each.
    fn refs(data: &[u8]) -> CoreResult<Vec<Oid>> {
        Ok(data[1..].iter().map(|b| Oid::from_u64(u64::from(*b))).collect())
    }

    fn commit(storage: &FileStorage, writes: &[(u64, &[u8])]) -> Tid {
        let txn = TransactionMeta::new();
        storage.tpc_begin(&txn).unwrap();
        for (oid, data) in writes {
            let oid = Oid::from_u64(*oid);
            let expected = storage.load(oid).map(|(_, tid)| tid).unwrap_or(Tid::ZERO);
            storage.store(oid, expected, data.to_vec(), &txn).unwrap();
        }
        let proposed = storage.tpc_vote(&txn).unwrap().unwrap();
        storage.tpc_finish(&txn, proposed, None).unwrap()
    }

    fn undo(storage: &FileStorage, tid: Tid) -> Tid {
        let txn = TransactionMeta::new();
        storage.tpc_begin(&txn).unwrap();
        storage.undo(tid, &txn).unwrap();
        let proposed = storage.tpc_vote(&txn).unwrap().unwrap();
        storage.tpc_finish(&txn, proposed, None).unwrap()
    }

    #[test]
    fn drops_superseded_revisions() {
        let storage = FileStorage::open_in_memory().unwrap();
        commit(&storage, &[(0, b"r\x01"), (1, b"a")]);
        commit(&storage, &[(1, b"b")]);
        let last = commit(&storage, &[(1, b"c")]);
        let before = storage.size();

        let result = storage.pack(last, &refs).unwrap();
        assert_eq!(result.cutoff, last);
        assert_eq!(result.records_before, 4);
        assert_eq!(result.records_after, 2);
        assert_eq!(result.objects_removed, 0);
        assert!(result.bytes_after < before);
        assert_eq!(storage.size(), result.bytes_after);

        assert_eq!(storage.load(Oid::from_u64(1)).unwrap(), (b"c".to_vec(), last));
        assert_eq!(storage.history(Oid::from_u64(1), 10).unwrap().len(), 1);
        assert_eq!(storage.last_tid(), last);
        let statuses: Vec<TxnStatus> = storage
            .transactions(None, None)
            .map(|r| r.unwrap().status)
            .collect();
        assert!(statuses.iter().all(|s| *s == TxnStatus::Packed));
    }

    #[test]
    fn keeps_revisions_after_cutoff() {
        let storage = FileStorage::open_in_memory().unwrap();
        commit(&storage, &[(0, b"r\x01"), (1, b"a")]);
        let t2 = commit(&storage, &[(1, b"b")]);
        let t3 = commit(&storage, &[(1, b"c")]);

        storage.pack(t2, &refs).unwrap();
        let history = storage.history(Oid::from_u64(1), 10).unwrap();
        assert_eq!(
            history.iter().map(|h| h.tid).collect::<Vec<_>>(),
            vec![t3, t2]
        );
        assert_eq!(storage.load_serial(Oid::from_u64(1), t2).unwrap(), b"b".to_vec());
        let record = storage.transactions(Some(t3), None).next().unwrap().unwrap();
        assert_eq!(record.status, TxnStatus::Committed);
    }

    #[test]
    fn collects_unreachable_objects() {
        let storage = FileStorage::open_in_memory().unwrap();
        commit(&storage, &[(0, b"r\x01"), (1, b"a\x02"), (2, b"b\x03"), (3, b"c")]);
        let last = commit(&storage, &[(0, b"r")]);

        let result = storage.pack(last, &refs).unwrap();
        assert_eq!(result.objects_removed, 3);
        for oid in 1..=3 {
            assert!(matches!(
                storage.load(Oid::from_u64(oid)),
                Err(CoreError::PosKey { .. })
            ));
        }
        assert_eq!(storage.len(), 1);
        assert_eq!(storage.transactions(None, None).count(), 1);
        // OIDs are never reused.
        assert_eq!(storage.new_oid().unwrap(), Oid::from_u64(4));
    }

    #[test]
    fn gc_can_be_disabled() {
        let storage = FileStorage::open(StorageConfig::in_memory().pack_gc(false)).unwrap();
        commit(&storage, &[(0, b"r"), (1, b"a")]);
        let last = commit(&storage, &[(0, b"r2")]);
        let result = storage.pack(last, &refs).unwrap();
        assert_eq!(result.objects_removed, 0);
        assert_eq!(storage.load(Oid::from_u64(1)).unwrap().0, b"a".to_vec());
    }

    #[test]
    fn objects_written_after_cutoff_are_roots() {
        let storage = FileStorage::open_in_memory().unwrap();
        let t1 = commit(&storage, &[(0, b"r"), (1, b"a\x02"), (2, b"b")]);
        commit(&storage, &[(1, b"a2\x02")]);
        let result = storage.pack(t1, &refs).unwrap();
        assert_eq!(result.objects_removed, 0);
        assert_eq!(storage.load(Oid::from_u64(2)).unwrap().0, b"b".to_vec());
    }

    #[test]
    fn relocates_or_inlines_back_pointers() {
        let storage = FileStorage::open_in_memory().unwrap();
        let t1 = commit(&storage, &[(0, b"r\x01"), (1, b"A")]);
        let t2 = commit(&storage, &[(1, b"B")]);
        let t3 = undo(&storage, t2);

        // t1's record survives, so the undo stays a back-pointer to it.
        storage.pack(t1, &refs).unwrap();
        let record = storage.transactions(Some(t3), None).next().unwrap().unwrap();
        assert_eq!(record.records[0].data_txn, Some(t1));
        assert_eq!(storage.load(Oid::from_u64(1)).unwrap(), (b"A".to_vec(), t3));

        // Now t1's record goes away and the bytes are inlined.
        storage.pack(t3, &refs).unwrap();
        let record = storage.transactions(Some(t3), None).next().unwrap().unwrap();
        assert_eq!(record.records[0].data_txn, None);
        assert_eq!(storage.load(Oid::from_u64(1)).unwrap(), (b"A".to_vec(), t3));
    }

    #[test]
    fn undone_creation_disappears() {
        let storage = FileStorage::open_in_memory().unwrap();
        commit(&storage, &[(0, b"r")]);
        let t2 = commit(&storage, &[(1, b"a")]);
        let t3 = undo(&storage, t2);
        let result = storage.pack(t3, &refs).unwrap();
        assert_eq!(result.objects_removed, 1);
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn replays_commits_made_during_pack() {
        let storage = std::sync::Arc::new(FileStorage::open_in_memory().unwrap());
        commit(&storage, &[(0, b"r\x01"), (1, b"a")]);
        let cutoff = commit(&storage, &[(1, b"b")]);

        let committed = std::sync::Arc::new(AtomicBool::new(false));
        let during = {
            let storage = std::sync::Arc::clone(&storage);
            let committed = std::sync::Arc::clone(&committed);
            move |data: &[u8]| {
                if !committed.swap(true, Ordering::SeqCst) {
                    commit(&storage, &[(1, b"late"), (2, b"new")]);
                }
                refs(data)
            }
        };
        let result = storage.pack(cutoff, &during).unwrap();
        assert!(committed.load(Ordering::SeqCst));
        assert_eq!(result.transactions_after, 3);
        assert_eq!(storage.load(Oid::from_u64(1)).unwrap().0, b"late".to_vec());
        assert_eq!(storage.load(Oid::from_u64(2)).unwrap().0, b"new".to_vec());
        assert_eq!(storage.history(Oid::from_u64(1), 10).unwrap().len(), 2);
    }

    #[test]
    fn pack_ends_running_iterations() {
        let storage = FileStorage::open_in_memory().unwrap();
        commit(&storage, &[(0, b"r")]);
        let last = commit(&storage, &[(0, b"r2")]);
        let mut iter = storage.transactions(None, None);
        assert!(iter.next().unwrap().is_ok());
        storage.pack(last, &refs).unwrap();
        assert!(iter.next().unwrap().is_err());
        assert!(iter.next().is_none());
    }

    #[test]
    fn packs_files_and_keeps_old_copy() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Data.fs");
        let config = StorageConfig::new(&path).create(true);
        let last = {
            let storage = FileStorage::open(config.clone()).unwrap();
            commit(&storage, &[(0, b"r\x01"), (1, b"a")]);
            let last = commit(&storage, &[(1, b"b")]);
            storage.pack(last, &refs).unwrap();
            assert!(old_path(&path).exists());
            assert!(!pack_path(&path).exists());
            // The storage keeps working on the new file.
            commit(&storage, &[(1, b"c")]);
            last
        };

        let storage = FileStorage::open(config).unwrap();
        assert_eq!(storage.load(Oid::from_u64(1)).unwrap().0, b"c".to_vec());
        let tids: Vec<Tid> = storage.transactions(None, None).map(|r| r.unwrap().tid).collect();
        assert_eq!(tids.len(), 3);
        assert_eq!(tids[1], last);
    }

    #[test]
    fn empty_log_is_a_no_op() {
        let storage = FileStorage::open_in_memory().unwrap();
        let result = storage.pack(Tid::MAX, &refs).unwrap();
        assert_eq!(result.cutoff, Tid::ZERO);
        assert_eq!(result.transactions_after, 0);
    }
}
