//! Model-checking helpers.
//!
//! [`ModelHarness`] drives a file storage with [`StorageOperation`]s while
//! tracking every committed revision in memory, then checks the storage's
//! `load`, `load_before` and iterator against the model.

use crate::fixtures::{commit_many, TestStorage};
use crate::generators::StorageOperation;
use objdb_core::{CoreResult, LoadedRevision, Oid, Storage, Tid, TransactionMeta};
use std::collections::BTreeMap;

/// A storage plus the revisions it is expected to hold.
pub struct ModelHarness {
    /// The storage under test.
    pub fixture: TestStorage,
    revisions: BTreeMap<Oid, Vec<(Tid, Vec<u8>)>>,
    commits: Vec<Tid>,
}

impl ModelHarness {
    /// Creates a harness over an empty storage.
    pub fn new() -> Self {
        Self {
            fixture: TestStorage::new(),
            revisions: BTreeMap::new(),
            commits: Vec::new(),
        }
    }

    /// The storage under test.
    pub fn storage(&self) -> &dyn Storage {
        &*self.fixture.storage
    }

    fn serial(&self, oid: Oid) -> Tid {
        self.revisions
            .get(&oid)
            .and_then(|revisions| revisions.last())
            .map_or(Tid::ZERO, |(tid, _)| *tid)
    }

    /// Applies one operation, recording what it commits.
    pub fn apply(&mut self, op: &StorageOperation) -> CoreResult<()> {
        match op {
            StorageOperation::Commit { writes } => {
                let batch = writes
                    .iter()
                    .map(|(oid, data)| (*oid, self.serial(*oid), data.clone()))
                    .collect();
                let tid = commit_many(self.storage(), batch)?;
                for (oid, data) in writes {
                    self.revisions.entry(*oid).or_default().push((tid, data.clone()));
                }
                self.commits.push(tid);
            }
            StorageOperation::Abort { writes } => {
                let storage = self.storage();
                let txn = TransactionMeta::new();
                storage.tpc_begin(&txn)?;
                for (oid, data) in writes {
                    storage.store(*oid, self.serial(*oid), data.clone(), &txn)?;
                }
                storage.tpc_vote(&txn)?;
                storage.tpc_abort(&txn)?;
            }
        }
        Ok(())
    }

    /// TIDs of committed transactions, oldest first.
    pub fn commits(&self) -> &[Tid] {
        &self.commits
    }

    /// Closes and reopens the storage file.
    pub fn reopen(&mut self) -> CoreResult<()> {
        self.fixture.reopen()
    }

    /// Asserts that every object's current revision matches the model.
    pub fn verify_current(&self) {
        for (oid, revisions) in &self.revisions {
            let Some((tid, data)) = revisions.last() else {
                continue;
            };
            let loaded = self.storage().load(*oid).expect("Failed to load object");
            assert_eq!(loaded, (data.clone(), *tid), "current revision of {oid}");
        }
        assert_eq!(self.storage().len(), self.revisions.len());
        assert_eq!(
            self.storage().last_tid(),
            self.commits.last().copied().unwrap_or(Tid::ZERO)
        );
    }

    /// Asserts that `load_before` returns each revision with its validity
    /// interval.
    pub fn verify_history(&self) {
        let storage = self.storage();
        for (oid, revisions) in &self.revisions {
            let first = revisions[0].0;
            assert_eq!(
                storage.load_before(*oid, first).expect("load_before failed"),
                None,
                "{oid} before its creation"
            );
            for (i, (tid, data)) in revisions.iter().enumerate() {
                let end_tid = revisions.get(i + 1).map(|(next, _)| *next);
                let probe = end_tid.unwrap_or_else(|| storage.last_tid().next());
                let loaded = storage
                    .load_before(*oid, probe)
                    .expect("load_before failed")
                    .expect("revision missing");
                assert_eq!(
                    loaded,
                    LoadedRevision {
                        data: data.clone(),
                        tid: *tid,
                        end_tid,
                    },
                    "{oid} before {probe}"
                );
            }
        }
    }

    /// Asserts that the iterator yields exactly the committed transactions.
    pub fn verify_iterator(&self) {
        let tids: Vec<Tid> = self
            .storage()
            .iterator(None, None)
            .expect("Failed to iterate")
            .map(|txn| txn.expect("Failed to read transaction").tid)
            .collect();
        assert_eq!(tids, self.commits);
    }
}

impl Default for ModelHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generators::{operation_sequence_strategy, PropTestConfig};
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(PropTestConfig::on_disk().to_proptest_config())]

        #[test]
        fn storage_matches_model(ops in operation_sequence_strategy(4, 1, 12)) {
            let mut harness = ModelHarness::new();
            for op in &ops {
                harness.apply(op).unwrap();
            }
            harness.verify_current();
            harness.verify_history();
            harness.verify_iterator();

            harness.reopen().unwrap();
            harness.verify_current();
            harness.verify_history();
        }
    }

    #[test]
    fn aborted_writes_leave_no_trace() {
        let mut harness = ModelHarness::new();
        let mut writes = BTreeMap::new();
        writes.insert(Oid::from_u64(1), b"gone".to_vec());
        harness.apply(&StorageOperation::Abort { writes }).unwrap();
        assert!(harness.storage().load(Oid::from_u64(1)).is_err());
        assert_eq!(harness.storage().last_tid(), Tid::ZERO);
        harness.verify_iterator();
    }
}
