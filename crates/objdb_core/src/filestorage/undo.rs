//! Transactional undo and per-object history.

use super::storage::{FileStorage, Staged};
use super::format::FIRST_TXN_POS;
use crate::error::{CoreError, CoreResult};
use crate::storage::{HistoryEntry, TransactionMeta, UndoInfo};
use crate::types::{Oid, Tid};
use objdb_codec::{from_cbor, Value};
use tracing::debug;

impl FileStorage {
    /// Stages back-pointers that restore every object written by `tid` to
    /// its previous revision.
    ///
    /// Fails with [`CoreError::Undo`] if the transaction is unknown, was
    /// already undone or packed, or if any of its objects has been changed
    /// since (or is already staged in this transaction).
    pub(crate) fn undo_transaction(&self, tid: Tid, txn: &TransactionMeta) -> CoreResult<Vec<Oid>> {
        let mut slot = self.slot.lock();
        let pending = Self::owned_unvoted(&mut slot, txn)?;

        let mut staged = Vec::new();
        {
            let state = self.state.read();
            let reader = state.reader();
            let Some((pos, header)) = reader.find_txn(tid, state.end)? else {
                return Err(CoreError::undo(format!("transaction {tid} not found")));
            };
            if !header.status.is_undoable() {
                return Err(CoreError::undo(format!(
                    "transaction {tid} has status {:?} and cannot be undone",
                    header.status
                )));
            }
            for (_, record) in reader.records(pos, &header)? {
                let oid = record.oid;
                if state.current_tid(oid)? != Some(tid) {
                    return Err(CoreError::undo(format!(
                        "{oid} was modified after transaction {tid}"
                    )));
                }
                if pending.staged.contains_key(&oid) {
                    return Err(CoreError::undo(format!(
                        "{oid} is already modified in this transaction"
                    )));
                }
                let target = if record.prev == 0 {
                    0
                } else {
                    let prev = reader.data_header(record.prev)?;
                    reader
                        .carrier(record.prev, &prev)?
                        .map_or(0, |(carrier, _)| carrier)
                };
                staged.push((oid, target));
            }
        }

        let oids: Vec<Oid> = staged.iter().map(|(oid, _)| *oid).collect();
        for (oid, target) in staged {
            pending.stage(oid, Staged::BackPointer(target));
        }
        debug!(%tid, objects = oids.len(), "staged undo");
        Ok(oids)
    }

    /// Undoable transactions, newest first, sliced to `[first, last)`.
    pub(crate) fn undoable_transactions(&self, first: usize, last: usize) -> CoreResult<Vec<UndoInfo>> {
        let state = self.state.read();
        let reader = state.reader();
        let mut found = Vec::new();
        let mut index = 0;
        let mut pos = state.end;
        while pos > FIRST_TXN_POS && index < last {
            let start = reader.previous_txn(pos)?;
            let header = reader.txn_header(start)?;
            if header.status.is_undoable() {
                if index >= first {
                    let (user, description, extension) = reader.txn_meta(start, &header)?;
                    let extension = if extension.is_empty() {
                        Value::empty_map()
                    } else {
                        from_cbor(&extension)?
                    };
                    found.push(UndoInfo {
                        tid: header.tid,
                        user: String::from_utf8_lossy(&user).into_owned(),
                        description: String::from_utf8_lossy(&description).into_owned(),
                        extension,
                    });
                }
                index += 1;
            }
            pos = start;
        }
        Ok(found)
    }

    /// Up to `size` revisions of `oid`, newest first.
    pub(crate) fn revisions(&self, oid: Oid, size: usize) -> CoreResult<Vec<HistoryEntry>> {
        let state = self.state.read();
        let reader = state.reader();
        let mut pos = state.index.get(oid).ok_or_else(|| CoreError::pos_key(oid))?;
        let mut entries = Vec::new();
        while pos != 0 && entries.len() < size {
            let record = reader.data_header(pos)?;
            let txn = reader.txn_header(record.txn_pos)?;
            let (user, description, _) = reader.txn_meta(record.txn_pos, &txn)?;
            let size = match reader.carrier(pos, &record)? {
                Some((_, carrier)) => usize::try_from(carrier.data_len).unwrap_or(usize::MAX),
                None => 0,
            };
            entries.push(HistoryEntry {
                tid: record.tid,
                user: String::from_utf8_lossy(&user).into_owned(),
                description: String::from_utf8_lossy(&description).into_owned(),
                size,
            });
            pos = record.prev;
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use crate::error::CoreError;
    use crate::filestorage::{FileStorage, TxnStatus};
    use crate::storage::{Storage, TransactionMeta};
    use crate::types::{Oid, Tid};

    fn commit(storage: &FileStorage, user: &str, writes: &[(u64, Tid, &[u8])]) -> Tid {
        let txn = TransactionMeta::new().user(user).description(format!("by {user}"));
        storage.tpc_begin(&txn).unwrap();
        for (oid, expected, data) in writes {
            storage
                .store(Oid::from_u64(*oid), *expected, data.to_vec(), &txn)
                .unwrap();
        }
        let proposed = storage.tpc_vote(&txn).unwrap().unwrap();
        storage.tpc_finish(&txn, proposed, None).unwrap()
    }

    fn undo(storage: &FileStorage, tid: Tid) -> Result<(Vec<Oid>, Tid), CoreError> {
        let txn = TransactionMeta::new();
        storage.tpc_begin(&txn)?;
        let oids = match storage.undo(tid, &txn) {
            Ok(oids) => oids,
            Err(e) => {
                storage.tpc_abort(&txn)?;
                return Err(e);
            }
        };
        let proposed = storage.tpc_vote(&txn)?.unwrap_or_default();
        Ok((oids, storage.tpc_finish(&txn, proposed, None)?))
    }

    #[test]
    fn undo_restores_previous_revision() {
        let storage = FileStorage::open_in_memory().unwrap();
        let t1 = commit(&storage, "a", &[(1, Tid::ZERO, b"A")]);
        let t2 = commit(&storage, "b", &[(1, t1, b"B")]);

        let (oids, t3) = undo(&storage, t2).unwrap();
        assert_eq!(oids, vec![Oid::from_u64(1)]);
        assert_eq!(storage.load(Oid::from_u64(1)).unwrap(), (b"A".to_vec(), t3));
        assert_eq!(storage.load_serial(Oid::from_u64(1), t3).unwrap(), b"A".to_vec());

        let record = storage
            .transactions(Some(t3), None)
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(record.records[0].data_txn, Some(t1));
    }

    #[test]
    fn undo_of_creation_hides_object() {
        let storage = FileStorage::open_in_memory().unwrap();
        let t1 = commit(&storage, "a", &[(1, Tid::ZERO, b"A")]);
        let (_, t2) = undo(&storage, t1).unwrap();
        assert!(matches!(
            storage.load(Oid::from_u64(1)),
            Err(CoreError::PosKey { .. })
        ));
        assert_eq!(storage.load_before(Oid::from_u64(1), t2.next()).unwrap(), None);
        let history = storage.history(Oid::from_u64(1), 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].size, 0);
        assert_eq!(history[1].size, 1);
    }

    #[test]
    fn undo_refuses_modified_objects() {
        let storage = FileStorage::open_in_memory().unwrap();
        let t1 = commit(&storage, "a", &[(1, Tid::ZERO, b"A")]);
        commit(&storage, "b", &[(1, t1, b"B")]);
        assert!(matches!(undo(&storage, t1), Err(CoreError::Undo { .. })));
        assert!(matches!(
            undo(&storage, Tid::from_u64(5)),
            Err(CoreError::Undo { .. })
        ));
    }

    #[test]
    fn undo_twice_in_one_transaction_fails() {
        let storage = FileStorage::open_in_memory().unwrap();
        let t1 = commit(&storage, "a", &[(1, Tid::ZERO, b"A")]);
        let t2 = commit(&storage, "b", &[(1, t1, b"B")]);
        let txn = TransactionMeta::new();
        storage.tpc_begin(&txn).unwrap();
        storage.undo(t2, &txn).unwrap();
        assert!(matches!(storage.undo(t2, &txn), Err(CoreError::Undo { .. })));
        storage.tpc_abort(&txn).unwrap();
    }

    #[test]
    fn undo_log_lists_newest_first() {
        let storage = FileStorage::open_in_memory().unwrap();
        let t1 = commit(&storage, "one", &[(1, Tid::ZERO, b"A")]);
        let t2 = commit(&storage, "two", &[(2, Tid::ZERO, b"B")]);
        let t3 = commit(&storage, "three", &[(3, Tid::ZERO, b"C")]);

        let log = storage.undo_log(0, 10).unwrap();
        assert_eq!(log.iter().map(|u| u.tid).collect::<Vec<_>>(), vec![t3, t2, t1]);
        assert_eq!(log[0].user, "three");
        assert_eq!(log[0].description, "by three");

        let page = storage.undo_log(1, 2).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].tid, t2);
    }

    #[test]
    fn history_walks_revisions() {
        let storage = FileStorage::open_in_memory().unwrap();
        let t1 = commit(&storage, "a", &[(1, Tid::ZERO, b"A")]);
        let t2 = commit(&storage, "b", &[(1, t1, b"BB")]);
        let t3 = commit(&storage, "c", &[(1, t2, b"CCC")]);

        let history = storage.history(Oid::from_u64(1), 2).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].tid, t3);
        assert_eq!(history[0].size, 3);
        assert_eq!(history[1].user, "b");
        assert!(matches!(
            storage.history(Oid::from_u64(9), 5),
            Err(CoreError::PosKey { .. })
        ));
    }

    #[test]
    fn undone_transactions_stay_undoable_themselves() {
        let storage = FileStorage::open_in_memory().unwrap();
        let t1 = commit(&storage, "a", &[(1, Tid::ZERO, b"A")]);
        let t2 = commit(&storage, "b", &[(1, t1, b"B")]);
        let (_, t3) = undo(&storage, t2).unwrap();
        // Undoing the undo brings B back.
        let (_, t4) = undo(&storage, t3).unwrap();
        assert_eq!(storage.load(Oid::from_u64(1)).unwrap(), (b"B".to_vec(), t4));
        let status = storage
            .transactions(Some(t2), Some(t2))
            .next()
            .unwrap()
            .unwrap()
            .status;
        assert_eq!(status, TxnStatus::Committed);
    }
}
