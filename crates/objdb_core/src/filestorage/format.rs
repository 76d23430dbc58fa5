//! FS21 on-disk format.
//!
//! ```text
//! file        := "FS21" txn*
//! txn         := tid:8 length:8 status:1 ulen:2 dlen:2 elen:2
//!                user:ulen desc:dlen ext:elen
//!                record*
//!                length:8
//! record      := oid:8 tid:8 prev:8 txn_pos:8 vlen:2 dlen:8 (data:dlen | bp:8)
//! ```
//!
//! `length` counts the transaction from its first header byte up to, but
//! not including, the trailing copy of itself. All integers are big-endian.
//! A record with `dlen == 0` carries a back-pointer to an older record of
//! the same object instead of data; a zero back-pointer marks an undone
//! object creation.

use crate::error::{CoreError, CoreResult};
use crate::types::{Oid, Tid};

/// File magic.
pub const MAGIC: &[u8; 4] = b"FS21";

/// Offset of the first transaction.
pub const FIRST_TXN_POS: u64 = MAGIC.len() as u64;

/// Size of a transaction header.
pub const TXN_HEADER_LEN: u64 = 23;

/// Size of a data record header.
pub const DATA_HEADER_LEN: u64 = 42;

/// Size of a back-pointer.
pub const BACK_POINTER_LEN: u64 = 8;

/// Size of the trailing transaction length.
pub const TRAILER_LEN: u64 = 8;

/// Offset of the status byte within a transaction header.
pub const STATUS_OFFSET: u64 = 16;

/// Offset of the TID within a data record header.
pub const RECORD_TID_OFFSET: u64 = 8;

/// Transaction status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnStatus {
    /// `' '`: committed.
    Committed,
    /// `'p'`: rewritten by pack; no longer undoable.
    Packed,
    /// `'u'`: marked undone (read for compatibility, never written).
    Undone,
    /// `'c'`: written but not yet committed.
    Checkpoint,
}

impl TxnStatus {
    /// Encodes the status byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Committed => b' ',
            Self::Packed => b'p',
            Self::Undone => b'u',
            Self::Checkpoint => b'c',
        }
    }

    /// Decodes a status byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b' ' => Some(Self::Committed),
            b'p' => Some(Self::Packed),
            b'u' => Some(Self::Undone),
            b'c' => Some(Self::Checkpoint),
            _ => None,
        }
    }

    /// True for transactions that may be undone.
    #[must_use]
    pub const fn is_undoable(self) -> bool {
        matches!(self, Self::Committed)
    }
}

/// A decoded transaction header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnHeader {
    /// Transaction id.
    pub tid: Tid,
    /// Length of the transaction excluding the trailer.
    pub length: u64,
    /// Status byte.
    pub status: TxnStatus,
    /// Length of the user field.
    pub user_len: u16,
    /// Length of the description field.
    pub desc_len: u16,
    /// Length of the extension field.
    pub ext_len: u16,
}

impl TxnHeader {
    /// Encodes the header.
    #[must_use]
    pub fn encode(&self) -> [u8; TXN_HEADER_LEN as usize] {
        let mut buf = [0u8; TXN_HEADER_LEN as usize];
        buf[0..8].copy_from_slice(self.tid.as_bytes());
        buf[8..16].copy_from_slice(&self.length.to_be_bytes());
        buf[16] = self.status.as_byte();
        buf[17..19].copy_from_slice(&self.user_len.to_be_bytes());
        buf[19..21].copy_from_slice(&self.desc_len.to_be_bytes());
        buf[21..23].copy_from_slice(&self.ext_len.to_be_bytes());
        buf
    }

    /// Decodes a header read at `pos`.
    pub fn decode(bytes: &[u8], pos: u64) -> CoreResult<Self> {
        if bytes.len() < TXN_HEADER_LEN as usize {
            return Err(CoreError::storage_system(format!(
                "short transaction header at {pos}"
            )));
        }
        let status = TxnStatus::from_byte(bytes[16]).ok_or_else(|| {
            CoreError::storage_system(format!(
                "invalid transaction status {:#04x} at {pos}",
                bytes[16]
            ))
        })?;
        let header = Self {
            tid: Tid::new(be_array(&bytes[0..8])),
            length: be_u64(&bytes[8..16]),
            status,
            user_len: be_u16(&bytes[17..19]),
            desc_len: be_u16(&bytes[19..21]),
            ext_len: be_u16(&bytes[21..23]),
        };
        if header.length < TXN_HEADER_LEN + header.meta_len() {
            return Err(CoreError::storage_system(format!(
                "transaction length {} too small at {pos}",
                header.length
            )));
        }
        Ok(header)
    }

    /// Combined length of the user, description and extension fields.
    #[must_use]
    pub fn meta_len(&self) -> u64 {
        u64::from(self.user_len) + u64::from(self.desc_len) + u64::from(self.ext_len)
    }

    /// Offset of the first record of the transaction at `pos`.
    #[must_use]
    pub fn records_start(&self, pos: u64) -> u64 {
        pos + TXN_HEADER_LEN + self.meta_len()
    }

    /// Offset just past the last record of the transaction at `pos`.
    #[must_use]
    pub fn records_end(&self, pos: u64) -> u64 {
        pos + self.length
    }

    /// Offset of the transaction that follows the one at `pos`.
    pub fn next_pos(&self, pos: u64) -> CoreResult<u64> {
        pos.checked_add(self.length)
            .and_then(|end| end.checked_add(TRAILER_LEN))
            .ok_or_else(|| {
                CoreError::storage_system(format!(
                    "transaction length {} at {pos} overflows the file offset",
                    self.length
                ))
            })
    }
}

/// A decoded data record header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataHeader {
    /// Object id.
    pub oid: Oid,
    /// Transaction id.
    pub tid: Tid,
    /// Offset of the previous record for this object, or 0.
    pub prev: u64,
    /// Offset of the enclosing transaction.
    pub txn_pos: u64,
    /// Payload length; 0 means a back-pointer follows.
    pub data_len: u64,
}

impl DataHeader {
    /// Encodes the header.
    #[must_use]
    pub fn encode(&self) -> [u8; DATA_HEADER_LEN as usize] {
        let mut buf = [0u8; DATA_HEADER_LEN as usize];
        buf[0..8].copy_from_slice(self.oid.as_bytes());
        buf[8..16].copy_from_slice(self.tid.as_bytes());
        buf[16..24].copy_from_slice(&self.prev.to_be_bytes());
        buf[24..32].copy_from_slice(&self.txn_pos.to_be_bytes());
        // bytes 32..34 hold the version length, always 0.
        buf[34..42].copy_from_slice(&self.data_len.to_be_bytes());
        buf
    }

    /// Decodes a header read at `pos`.
    pub fn decode(bytes: &[u8], pos: u64) -> CoreResult<Self> {
        if bytes.len() < DATA_HEADER_LEN as usize {
            return Err(CoreError::storage_system(format!(
                "short data record header at {pos}"
            )));
        }
        let version_len = be_u16(&bytes[32..34]);
        if version_len != 0 {
            return Err(CoreError::unsupported(format!(
                "record at {pos} uses a named version"
            )));
        }
        Ok(Self {
            oid: Oid::new(be_array(&bytes[0..8])),
            tid: Tid::new(be_array(&bytes[8..16])),
            prev: be_u64(&bytes[16..24]),
            txn_pos: be_u64(&bytes[24..32]),
            data_len: be_u64(&bytes[34..42]),
        })
    }

    /// True when the record stores a back-pointer instead of data.
    #[must_use]
    pub fn is_back_pointer(&self) -> bool {
        self.data_len == 0
    }

    /// Total size of the record on disk.
    #[must_use]
    pub fn record_len(&self) -> u64 {
        DATA_HEADER_LEN
            + if self.is_back_pointer() {
                BACK_POINTER_LEN
            } else {
                self.data_len
            }
    }
}

/// Assembles one transaction block in memory.
///
/// Record offsets are computed against the block's final position in the
/// file, so the block can be appended as-is.
#[derive(Debug)]
pub struct BlockBuilder {
    pos: u64,
    buf: Vec<u8>,
    tid: Tid,
    records: Vec<(Oid, u64)>,
}

impl BlockBuilder {
    /// Starts a block that will be written at `pos`.
    pub fn new(
        pos: u64,
        tid: Tid,
        status: TxnStatus,
        user: &[u8],
        description: &[u8],
        extension: &[u8],
    ) -> CoreResult<Self> {
        let field_len = |name: &str, bytes: &[u8]| {
            u16::try_from(bytes.len()).map_err(|_| {
                CoreError::storage_transaction(format!(
                    "transaction {name} is {} bytes; the limit is {}",
                    bytes.len(),
                    u16::MAX
                ))
            })
        };
        let header = TxnHeader {
            tid,
            length: 0,
            status,
            user_len: field_len("user", user)?,
            desc_len: field_len("description", description)?,
            ext_len: field_len("extension", extension)?,
        };
        let mut buf = Vec::with_capacity(TXN_HEADER_LEN as usize + user.len() + description.len());
        buf.extend_from_slice(&header.encode());
        buf.extend_from_slice(user);
        buf.extend_from_slice(description);
        buf.extend_from_slice(extension);
        Ok(Self {
            pos,
            buf,
            tid,
            records: Vec::new(),
        })
    }

    /// File offset the next record will land at.
    #[must_use]
    pub fn next_record_pos(&self) -> u64 {
        self.pos + self.buf.len() as u64
    }

    /// Appends a record carrying `data`. Returns the record offset.
    pub fn push_data(&mut self, oid: Oid, prev: u64, data: &[u8]) -> u64 {
        let rpos = self.next_record_pos();
        let header = DataHeader {
            oid,
            tid: self.tid,
            prev,
            txn_pos: self.pos,
            data_len: data.len() as u64,
        };
        self.buf.extend_from_slice(&header.encode());
        self.buf.extend_from_slice(data);
        self.records.push((oid, rpos));
        rpos
    }

    /// Appends a back-pointer record. Returns the record offset.
    pub fn push_back_pointer(&mut self, oid: Oid, prev: u64, back_pointer: u64) -> u64 {
        let rpos = self.next_record_pos();
        let header = DataHeader {
            oid,
            tid: self.tid,
            prev,
            txn_pos: self.pos,
            data_len: 0,
        };
        self.buf.extend_from_slice(&header.encode());
        self.buf.extend_from_slice(&back_pointer.to_be_bytes());
        self.records.push((oid, rpos));
        rpos
    }

    /// Number of records pushed so far.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Finalizes lengths and returns the block bytes and record offsets.
    #[must_use]
    pub fn finish(mut self) -> (Vec<u8>, Vec<(Oid, u64)>) {
        let length = self.buf.len() as u64;
        self.buf[8..16].copy_from_slice(&length.to_be_bytes());
        self.buf.extend_from_slice(&length.to_be_bytes());
        (self.buf, self.records)
    }
}

pub(crate) fn be_u64(bytes: &[u8]) -> u64 {
    u64::from_be_bytes(be_array(bytes))
}

fn be_u16(bytes: &[u8]) -> u16 {
    let mut buf = [0u8; 2];
    buf.copy_from_slice(&bytes[..2]);
    u16::from_be_bytes(buf)
}

fn be_array(bytes: &[u8]) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txn_header_roundtrip() {
        let header = TxnHeader {
            tid: Tid::from_u64(0x0102_0304_0506_0708),
            length: 100,
            status: TxnStatus::Packed,
            user_len: 3,
            desc_len: 4,
            ext_len: 0,
        };
        let bytes = header.encode();
        assert_eq!(bytes[16], b'p');
        assert_eq!(TxnHeader::decode(&bytes, 4).unwrap(), header);
    }

    #[test]
    fn rejects_bad_status() {
        let mut bytes = TxnHeader {
            tid: Tid::from_u64(1),
            length: 23,
            status: TxnStatus::Committed,
            user_len: 0,
            desc_len: 0,
            ext_len: 0,
        }
        .encode();
        bytes[16] = b'x';
        assert!(matches!(
            TxnHeader::decode(&bytes, 4),
            Err(CoreError::StorageSystem { .. })
        ));
    }

    #[test]
    fn rejects_named_versions() {
        let mut bytes = DataHeader {
            oid: Oid::from_u64(1),
            tid: Tid::from_u64(2),
            prev: 0,
            txn_pos: 4,
            data_len: 1,
        }
        .encode();
        bytes[33] = 1;
        assert!(matches!(
            DataHeader::decode(&bytes, 27),
            Err(CoreError::Unsupported { .. })
        ));
    }

    #[test]
    fn next_pos_rejects_overflow() {
        let header = TxnHeader {
            tid: Tid::from_u64(1),
            length: u64::MAX - TRAILER_LEN,
            status: TxnStatus::Committed,
            user_len: 0,
            desc_len: 0,
            ext_len: 0,
        };
        assert!(header.next_pos(0).is_ok());
        assert!(matches!(header.next_pos(4), Err(CoreError::StorageSystem { .. })));
    }

    #[test]
    fn block_layout() {
        let tid = Tid::from_u64(9);
        let mut block = BlockBuilder::new(4, tid, TxnStatus::Checkpoint, b"me", b"", b"").unwrap();
        let first = block.push_data(Oid::from_u64(1), 0, b"abc");
        let second = block.push_back_pointer(Oid::from_u64(2), 0, 0);
        let (bytes, records) = block.finish();

        assert_eq!(first, 4 + TXN_HEADER_LEN + 2);
        assert_eq!(second, first + DATA_HEADER_LEN + 3);
        assert_eq!(records, vec![(Oid::from_u64(1), first), (Oid::from_u64(2), second)]);

        let header = TxnHeader::decode(&bytes, 4).unwrap();
        assert_eq!(header.length + TRAILER_LEN, bytes.len() as u64);
        assert_eq!(header.next_pos(4).unwrap(), 4 + bytes.len() as u64);
        assert_eq!(be_u64(&bytes[bytes.len() - 8..]), header.length);

        let offset = (first - 4) as usize;
        let record = DataHeader::decode(&bytes[offset..], first).unwrap();
        assert_eq!(record.tid, tid);
        assert_eq!(record.txn_pos, 4);
        assert_eq!(record.record_len(), DATA_HEADER_LEN + 3);
    }

    #[test]
    fn oversized_user_is_rejected() {
        let user = vec![b'u'; 70_000];
        assert!(matches!(
            BlockBuilder::new(4, Tid::from_u64(1), TxnStatus::Checkpoint, &user, b"", b""),
            Err(CoreError::StorageTransaction { .. })
        ));
    }
}
