//! Append-only file storage.
//!
//! ## File layout
//!
//! ```text
//! "FS21"
//! transaction*
//!
//! transaction := tid:8 length:8 status:1 ulen:2 dlen:2 elen:2
//!                user description extension
//!                record*
//!                length:8
//! record      := oid:8 tid:8 prev:8 txn_pos:8 vlen:2 dlen:8
//!                (payload | back_pointer:8 when dlen == 0)
//! ```
//!
//! All integers are big-endian. `length` counts the transaction from its
//! first header byte up to (not including) the trailing copy of itself,
//! which lets the log be walked backwards.

mod files;
mod format;
mod index;
mod iterator;
mod pack;
mod reader;
mod recovery;
mod storage;
mod undo;
mod verify;

pub use files::{index_path, lock_path, old_path, pack_path};
pub use format::{
    TxnStatus, DATA_HEADER_LEN, FIRST_TXN_POS, MAGIC, STATUS_OFFSET, TRAILER_LEN, TXN_HEADER_LEN,
};
pub use index::{FsIndex, IndexSnapshot};
pub use iterator::TransactionIterator;
pub use pack::PackResult;
pub use storage::FileStorage;
pub use verify::{verify_file, VerifyReport};
