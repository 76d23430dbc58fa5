//! Positioned reads over an FS21 log.

use super::format::{
    be_u64, DataHeader, TxnHeader, BACK_POINTER_LEN, DATA_HEADER_LEN, FIRST_TXN_POS,
    TRAILER_LEN, TXN_HEADER_LEN,
};
use crate::error::{CoreError, CoreResult};
use crate::storage::{DataRecord, TransactionRecord};
use crate::types::Tid;
use objdb_storage::StorageBackend;

/// Borrowed view of a log backend.
pub(crate) struct LogReader<'a> {
    backend: &'a dyn StorageBackend,
}

impl<'a> LogReader<'a> {
    pub(crate) fn new(backend: &'a dyn StorageBackend) -> Self {
        Self { backend }
    }

    pub(crate) fn read(&self, pos: u64, len: u64) -> CoreResult<Vec<u8>> {
        let len = usize::try_from(len)
            .map_err(|_| CoreError::storage_system(format!("read of {len} bytes at {pos}")))?;
        self.backend.read_at(pos, len).map_err(|e| {
            CoreError::storage_system(format!("log read at {pos} failed: {e}"))
        })
    }

    pub(crate) fn txn_header(&self, pos: u64) -> CoreResult<TxnHeader> {
        TxnHeader::decode(&self.read(pos, TXN_HEADER_LEN)?, pos)
    }

    pub(crate) fn data_header(&self, pos: u64) -> CoreResult<DataHeader> {
        DataHeader::decode(&self.read(pos, DATA_HEADER_LEN)?, pos)
    }

    /// Back-pointer stored after a `dlen == 0` record header.
    pub(crate) fn back_pointer(&self, pos: u64) -> CoreResult<u64> {
        Ok(be_u64(&self.read(pos + DATA_HEADER_LEN, BACK_POINTER_LEN)?))
    }

    /// Offset of the record that carries the bytes for the record at `pos`.
    ///
    /// Returns `None` for an undone creation. Back-pointers must point
    /// strictly backwards at a record of the same object.
    pub(crate) fn carrier(&self, pos: u64, header: &DataHeader) -> CoreResult<Option<(u64, DataHeader)>> {
        let mut pos = pos;
        let mut header = header.clone();
        while header.is_back_pointer() {
            let target = self.back_pointer(pos)?;
            if target == 0 {
                return Ok(None);
            }
            if target >= pos {
                return Err(CoreError::storage_system(format!(
                    "back-pointer at {pos} does not point backwards"
                )));
            }
            let next = self.data_header(target)?;
            if next.oid != header.oid {
                return Err(CoreError::storage_system(format!(
                    "back-pointer at {pos} leads to a record of {}",
                    next.oid
                )));
            }
            pos = target;
            header = next;
        }
        Ok(Some((pos, header)))
    }

    /// Payload of the record at `pos`, following back-pointers.
    pub(crate) fn record_data(&self, pos: u64, header: &DataHeader) -> CoreResult<Option<Vec<u8>>> {
        match self.carrier(pos, header)? {
            Some((carrier, carrier_header)) => Ok(Some(
                self.read(carrier + DATA_HEADER_LEN, carrier_header.data_len)?,
            )),
            None => Ok(None),
        }
    }

    /// User, description and extension bytes of the transaction at `pos`.
    pub(crate) fn txn_meta(&self, pos: u64, header: &TxnHeader) -> CoreResult<(Vec<u8>, Vec<u8>, Vec<u8>)> {
        let bytes = self.read(pos + TXN_HEADER_LEN, header.meta_len())?;
        let user_end = usize::from(header.user_len);
        let desc_end = user_end + usize::from(header.desc_len);
        Ok((
            bytes[..user_end].to_vec(),
            bytes[user_end..desc_end].to_vec(),
            bytes[desc_end..].to_vec(),
        ))
    }

    /// Offset of the transaction that ends at `end`, using its trailer.
    pub(crate) fn previous_txn(&self, end: u64) -> CoreResult<u64> {
        if end < FIRST_TXN_POS + TRAILER_LEN {
            return Err(CoreError::storage_system(format!(
                "no transaction ends at {end}"
            )));
        }
        let length = be_u64(&self.read(end - TRAILER_LEN, TRAILER_LEN)?);
        end.checked_sub(TRAILER_LEN + length)
            .filter(|pos| *pos >= FIRST_TXN_POS)
            .ok_or_else(|| {
                CoreError::storage_system(format!("bad trailing length {length} before {end}"))
            })
    }

    /// Locates a committed transaction by TID, scanning backwards from `end`.
    pub(crate) fn find_txn(&self, tid: Tid, end: u64) -> CoreResult<Option<(u64, TxnHeader)>> {
        let mut pos = end;
        while pos > FIRST_TXN_POS {
            let start = self.previous_txn(pos)?;
            let header = self.txn_header(start)?;
            if header.tid == tid {
                return Ok(Some((start, header)));
            }
            if header.tid < tid {
                break;
            }
            pos = start;
        }
        Ok(None)
    }

    /// Record headers of the transaction at `pos`, with their offsets.
    pub(crate) fn records(&self, pos: u64, header: &TxnHeader) -> CoreResult<Vec<(u64, DataHeader)>> {
        let mut records = Vec::new();
        let mut rpos = header.records_start(pos);
        let end = header.records_end(pos);
        while rpos < end {
            let record = self.data_header(rpos)?;
            if record.tid != header.tid || record.txn_pos != pos {
                return Err(CoreError::storage_system(format!(
                    "record at {rpos} does not belong to transaction at {pos}"
                )));
            }
            let next = rpos + record.record_len();
            if next > end {
                return Err(CoreError::storage_system(format!(
                    "record at {rpos} overruns its transaction"
                )));
            }
            records.push((rpos, record));
            rpos = next;
        }
        Ok(records)
    }

    /// Fully decodes the transaction at `pos`.
    pub(crate) fn transaction(&self, pos: u64, header: &TxnHeader) -> CoreResult<TransactionRecord> {
        let (user, description, extension) = self.txn_meta(pos, header)?;
        let mut records = Vec::new();
        for (rpos, record) in self.records(pos, header)? {
            let (data, data_txn) = if record.is_back_pointer() {
                match self.carrier(rpos, &record)? {
                    Some((carrier, carrier_header)) => (
                        Some(self.read(carrier + DATA_HEADER_LEN, carrier_header.data_len)?),
                        Some(carrier_header.tid),
                    ),
                    None => (None, None),
                }
            } else {
                (Some(self.read(rpos + DATA_HEADER_LEN, record.data_len)?), None)
            };
            records.push(DataRecord {
                oid: record.oid,
                tid: record.tid,
                data,
                data_txn,
                position: rpos,
            });
        }
        Ok(TransactionRecord {
            tid: header.tid,
            status: header.status,
            user,
            description,
            extension,
            position: pos,
            records,
        })
    }
}
