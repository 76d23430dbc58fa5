//! Forward iteration over committed transactions.

use super::storage::FileStorage;
use crate::error::{CoreError, CoreResult};
use crate::storage::TransactionRecord;
use crate::types::Tid;

use super::format::FIRST_TXN_POS;

/// Iterator returned by [`FileStorage::transactions`].
///
/// Each step takes the log's read lock for the duration of one transaction,
/// so commits proceed while an iteration is in progress. Transactions
/// committed after the iterator was created are included. A pack that
/// rewrites the file ends the iteration with an error.
pub struct TransactionIterator<'a> {
    storage: &'a FileStorage,
    pos: u64,
    generation: u64,
    start: Option<Tid>,
    stop: Option<Tid>,
    done: bool,
}

impl<'a> TransactionIterator<'a> {
    pub(crate) fn new(storage: &'a FileStorage, start: Option<Tid>, stop: Option<Tid>) -> Self {
        let generation = storage.state.read().generation;
        Self {
            storage,
            pos: FIRST_TXN_POS,
            generation,
            start,
            stop,
            done: false,
        }
    }

    fn step(&mut self) -> CoreResult<Option<TransactionRecord>> {
        loop {
            let state = self.storage.state.read();
            if state.generation != self.generation {
                return Err(CoreError::storage("storage was packed during iteration"));
            }
            if self.pos >= state.end {
                return Ok(None);
            }
            let reader = state.reader();
            let header = reader.txn_header(self.pos)?;
            let pos = self.pos;
            self.pos = header.next_pos(pos)?;

            if self.stop.is_some_and(|stop| header.tid > stop) {
                return Ok(None);
            }
            if self.start.is_some_and(|start| header.tid < start) {
                continue;
            }
            return reader.transaction(pos, &header).map(Some);
        }
    }
}

impl Iterator for TransactionIterator<'_> {
    type Item = CoreResult<TransactionRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl std::fmt::Debug for TransactionIterator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionIterator")
            .field("pos", &self.pos)
            .field("start", &self.start)
            .field("stop", &self.stop)
            .field("done", &self.done)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::filestorage::{FileStorage, TxnStatus};
    use crate::storage::{Storage, TransactionMeta};
    use crate::types::{Oid, Tid};

    fn commit_one(storage: &FileStorage, oid: u64, user: &str) -> Tid {
        let txn = TransactionMeta::new().user(user).description("test");
        storage.tpc_begin(&txn).unwrap();
        storage
            .store(Oid::from_u64(oid), Tid::ZERO, vec![oid as u8; 3], &txn)
            .unwrap();
        let proposed = storage.tpc_vote(&txn).unwrap().unwrap();
        storage.tpc_finish(&txn, proposed, None).unwrap()
    }

    #[test]
    fn yields_transactions_in_order() {
        let storage = FileStorage::open_in_memory().unwrap();
        let tids: Vec<Tid> = (1..=3).map(|n| commit_one(&storage, n, "bob")).collect();

        let records: Vec<_> = storage.transactions(None, None).map(Result::unwrap).collect();
        assert_eq!(records.iter().map(|r| r.tid).collect::<Vec<_>>(), tids);
        assert_eq!(records[0].user_lossy(), "bob");
        assert_eq!(records[0].status, TxnStatus::Committed);
        assert_eq!(records[1].records[0].oid, Oid::from_u64(2));
        assert_eq!(records[1].records[0].data, Some(vec![2, 2, 2]));
    }

    #[test]
    fn bounds_are_inclusive() {
        let storage = FileStorage::open_in_memory().unwrap();
        let tids: Vec<Tid> = (1..=4).map(|n| commit_one(&storage, n, "")).collect();

        let middle: Vec<Tid> = storage
            .transactions(Some(tids[1]), Some(tids[2]))
            .map(|r| r.unwrap().tid)
            .collect();
        assert_eq!(middle, &tids[1..3]);

        let tail = storage.iterator(Some(tids[3]), None).unwrap().count();
        assert_eq!(tail, 1);
    }

    #[test]
    fn sees_later_commits() {
        let storage = FileStorage::open_in_memory().unwrap();
        commit_one(&storage, 1, "");
        let mut iter = storage.transactions(None, None);
        assert!(iter.next().is_some());
        commit_one(&storage, 2, "");
        assert!(iter.next().is_some());
        assert!(iter.next().is_none());
    }
}
