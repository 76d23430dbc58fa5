//! Crash simulation for data files.
//!
//! An interrupted commit leaves one of three shapes at the end of the log:
//! a block cut off mid-write, a complete block whose status byte still says
//! "in progress", or trailing garbage. These helpers produce each shape on a
//! closed data file so recovery can be checked on reopen.
//!
//! ## Usage
//!
//! ```rust
//! use objdb_testkit::prelude::*;
//!
//! let mut fixture = TestStorage::new();
//! let oid = fixture.new_oid().unwrap();
//! let first = commit_one(&*fixture.storage, oid, Tid::ZERO, b"A".to_vec()).unwrap();
//! commit_one(&*fixture.storage, oid, first, b"B".to_vec()).unwrap();
//!
//! fixture.storage.close().unwrap();
//! simulate_crash(fixture.path(), CrashPoint::TornTail(16)).unwrap();
//! fixture.reopen().unwrap();
//! assert_eq!(fixture.last_tid(), first);
//! ```

use objdb_core::filestorage::{FIRST_TXN_POS, STATUS_OFFSET, TRAILER_LEN, TXN_HEADER_LEN};
use objdb_core::TxnStatus;
use objdb_storage::{FileBackend, StorageBackend, StorageResult};
use std::path::Path;

/// The shape an interrupted write leaves behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    /// The last `n` bytes never reached the disk.
    TornTail(u64),
    /// The last transaction was written but never flipped to committed.
    Unfinished,
    /// `n` bytes of garbage follow the last transaction.
    Garbage(usize),
}

/// Damages the data file at `path` as described by `point`.
///
/// The storage must be closed first.
pub fn simulate_crash(path: &Path, point: CrashPoint) -> StorageResult<()> {
    let mut backend = FileBackend::open(path)?;
    match point {
        CrashPoint::TornTail(n) => {
            let size = backend.size()?;
            backend.truncate(size.saturating_sub(n).max(FIRST_TXN_POS))?;
        }
        CrashPoint::Unfinished => {
            if let Some(pos) = last_txn_pos(&backend)? {
                backend.write_at(pos + STATUS_OFFSET, &[TxnStatus::Checkpoint.as_byte()])?;
            }
        }
        CrashPoint::Garbage(n) => {
            backend.append(&vec![0xAB; n])?;
        }
    }
    backend.sync()
}

/// Position of the last transaction header, found through the redundant
/// length that closes every block.
pub fn last_txn_pos(backend: &dyn StorageBackend) -> StorageResult<Option<u64>> {
    let size = backend.size()?;
    if size < FIRST_TXN_POS + TXN_HEADER_LEN + TRAILER_LEN {
        return Ok(None);
    }
    let trailer = backend.read_at(size - TRAILER_LEN, TRAILER_LEN as usize)?;
    let mut length = [0u8; 8];
    length.copy_from_slice(&trailer);
    let length = u64::from_be_bytes(length);
    Ok(size
        .checked_sub(length.saturating_add(TRAILER_LEN))
        .filter(|pos| *pos >= FIRST_TXN_POS))
}

/// Size of the data file in bytes.
pub fn file_len(path: &Path) -> StorageResult<u64> {
    FileBackend::open_read_only(path)?.size()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{commit_one, TestStorage};
    use objdb_core::{Oid, Storage, Tid};

    fn two_commits() -> (TestStorage, Oid, Tid, Tid) {
        let fixture = TestStorage::new();
        let oid = fixture.new_oid().unwrap();
        let first = commit_one(&*fixture.storage, oid, Tid::ZERO, b"A".to_vec()).unwrap();
        let second = commit_one(&*fixture.storage, oid, first, b"B".to_vec()).unwrap();
        fixture.storage.close().unwrap();
        (fixture, oid, first, second)
    }

    #[test]
    fn finds_last_header() {
        let (fixture, _, _, second) = two_commits();
        let backend = FileBackend::open_read_only(fixture.path()).unwrap();
        let pos = last_txn_pos(&backend).unwrap().unwrap();
        let header = backend.read_at(pos, 8).unwrap();
        assert_eq!(header, second.to_bytes().to_vec());
    }

    #[test]
    fn unfinished_commit_is_rolled_back() {
        let (mut fixture, oid, first, _) = two_commits();
        simulate_crash(fixture.path(), CrashPoint::Unfinished).unwrap();
        fixture.reopen().unwrap();
        assert_eq!(fixture.load(oid).unwrap(), (b"A".to_vec(), first));
    }

    #[test]
    fn garbage_tail_is_dropped() {
        let (mut fixture, oid, _, second) = two_commits();
        let before = file_len(fixture.path()).unwrap();
        simulate_crash(fixture.path(), CrashPoint::Garbage(5)).unwrap();
        fixture.reopen().unwrap();
        assert_eq!(fixture.load(oid).unwrap(), (b"B".to_vec(), second));
        assert_eq!(fixture.size(), before);
    }
}
