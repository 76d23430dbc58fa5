//! Index reconstruction and crash recovery.
//!
//! Opening a log scans it forward from the magic (or from the position
//! recorded in a valid index sidecar), rebuilding the OID index. A trailing
//! transaction that was never committed, or that was cut short by a crash,
//! is truncated away on writable opens and ignored on read-only ones.
//! Damage anywhere else is a [`CoreError::StorageSystem`].

use super::format::{
    be_u64, DataHeader, TxnHeader, TxnStatus, DATA_HEADER_LEN, FIRST_TXN_POS, MAGIC,
    TRAILER_LEN, TXN_HEADER_LEN,
};
use super::index::{FsIndex, IndexSnapshot};
use super::reader::LogReader;
use crate::error::{CoreError, CoreResult};
use crate::types::{Oid, Tid};
use objdb_storage::StorageBackend;
use tracing::{debug, warn};

/// What a scan found.
#[derive(Debug)]
pub(crate) struct Recovered {
    pub(crate) index: FsIndex,
    pub(crate) last_tid: Tid,
    pub(crate) max_oid: Oid,
    /// End of the last committed transaction.
    pub(crate) end: u64,
    /// Transactions scanned (not counting any covered by the sidecar).
    pub(crate) transactions: usize,
    /// Bytes past `end` that did not form a committed transaction.
    pub(crate) discarded: u64,
}

/// Brings a backend to a consistent state and rebuilds its index.
pub(crate) fn recover(
    backend: &mut dyn StorageBackend,
    sidecar: Option<IndexSnapshot>,
    read_only: bool,
) -> CoreResult<Recovered> {
    let size = backend.size()?;
    if size == 0 {
        if read_only {
            return Err(CoreError::storage_system("data file is empty"));
        }
        backend.append(MAGIC)?;
        backend.sync()?;
        return Ok(Recovered {
            index: FsIndex::new(),
            last_tid: Tid::ZERO,
            max_oid: Oid::ROOT,
            end: FIRST_TXN_POS,
            transactions: 0,
            discarded: 0,
        });
    }

    let recovered = scan(&*backend, size, sidecar)?;
    if recovered.discarded > 0 {
        if read_only {
            warn!(
                end = recovered.end,
                bytes = recovered.discarded,
                "ignoring incomplete transaction at end of read-only log"
            );
        } else {
            warn!(
                end = recovered.end,
                bytes = recovered.discarded,
                "truncating incomplete transaction at end of log"
            );
            backend.truncate(recovered.end)?;
            backend.sync()?;
        }
    }
    Ok(recovered)
}

/// Scans without modifying the backend.
pub(crate) fn scan(
    backend: &dyn StorageBackend,
    size: u64,
    sidecar: Option<IndexSnapshot>,
) -> CoreResult<Recovered> {
    let reader = LogReader::new(backend);
    if size < FIRST_TXN_POS || reader.read(0, FIRST_TXN_POS)? != MAGIC {
        return Err(CoreError::storage_system("data file does not start with FS21 magic"));
    }

    let start = sidecar.and_then(|snapshot| match validate_sidecar(&reader, size, &snapshot) {
        Ok(()) => Some(snapshot),
        Err(e) => {
            warn!(error = %e, "index sidecar rejected; rebuilding index");
            None
        }
    });
    let (mut index, mut last_tid, mut max_oid, mut pos) = match start {
        Some(snapshot) => {
            debug!(pos = snapshot.pos, objects = snapshot.index.len(), "loaded index sidecar");
            (snapshot.index, snapshot.last_tid, snapshot.max_oid, snapshot.pos)
        }
        None => (FsIndex::new(), Tid::ZERO, Oid::ROOT, FIRST_TXN_POS),
    };

    let mut transactions = 0;
    while pos < size {
        if size - pos < TXN_HEADER_LEN {
            break;
        }
        let header = TxnHeader::decode(&reader.read(pos, TXN_HEADER_LEN)?, pos)?;
        let next = header.next_pos(pos)?;
        if next > size {
            break;
        }
        if header.status == TxnStatus::Checkpoint {
            if next == size {
                break;
            }
            return Err(CoreError::storage_system(format!(
                "uncommitted transaction at {pos} is followed by more data"
            )));
        }
        let block = reader.read(pos, next - pos)?;
        let trailer = be_u64(&block[block.len() - TRAILER_LEN as usize..]);
        if trailer != header.length {
            if next == size {
                break;
            }
            return Err(CoreError::storage_system(format!(
                "trailing length {trailer} does not match header length {} at {pos}",
                header.length
            )));
        }
        if header.tid <= last_tid {
            return Err(CoreError::storage_system(format!(
                "transaction {} at {pos} is not after {last_tid}",
                header.tid
            )));
        }

        let mut rpos = header.records_start(pos);
        let records_end = header.records_end(pos);
        while rpos < records_end {
            let offset = (rpos - pos) as usize;
            if records_end - rpos < DATA_HEADER_LEN {
                return Err(CoreError::storage_system(format!(
                    "truncated record header at {rpos}"
                )));
            }
            let record = DataHeader::decode(&block[offset..], rpos)?;
            if record.tid != header.tid || record.txn_pos != pos {
                return Err(CoreError::storage_system(format!(
                    "record at {rpos} does not belong to transaction at {pos}"
                )));
            }
            if record.prev >= rpos {
                return Err(CoreError::storage_system(format!(
                    "record at {rpos} has a forward prev pointer"
                )));
            }
            let next_record = rpos + record.record_len();
            if next_record > records_end {
                return Err(CoreError::storage_system(format!(
                    "record at {rpos} overruns its transaction"
                )));
            }
            index.insert(record.oid, rpos);
            max_oid = max_oid.max(record.oid);
            rpos = next_record;
        }

        last_tid = header.tid;
        transactions += 1;
        pos = next;
    }

    Ok(Recovered {
        index,
        last_tid,
        max_oid,
        end: pos,
        transactions,
        discarded: size - pos,
    })
}

/// Accepts a sidecar only if the transaction it claims to end at is there.
fn validate_sidecar(reader: &LogReader<'_>, size: u64, snapshot: &IndexSnapshot) -> CoreResult<()> {
    if snapshot.pos > size || snapshot.pos < FIRST_TXN_POS {
        return Err(CoreError::storage(format!(
            "sidecar position {} is outside the log",
            snapshot.pos
        )));
    }
    if snapshot.pos == FIRST_TXN_POS {
        return if snapshot.last_tid.is_zero() {
            Ok(())
        } else {
            Err(CoreError::storage("sidecar claims a transaction in an empty log"))
        };
    }
    let start = reader.previous_txn(snapshot.pos)?;
    let header = reader.txn_header(start)?;
    if header.tid != snapshot.last_tid || header.next_pos(start)? != snapshot.pos {
        return Err(CoreError::storage(format!(
            "sidecar expects {} ending at {}",
            snapshot.last_tid, snapshot.pos
        )));
    }
    if header.status == TxnStatus::Checkpoint {
        return Err(CoreError::storage("sidecar ends at an uncommitted transaction"));
    }
    Ok(())
}
