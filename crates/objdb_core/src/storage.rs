//! The storage interface.
//!
//! [`Storage`] is what connections, the database handle and any outer
//! transport layer talk to. [`crate::FileStorage`] is the implementation
//! shipped with the engine.

use crate::conflict::ConflictResolvers;
use crate::error::CoreResult;
use crate::filestorage::{PackResult, TxnStatus};
use crate::transaction::next_transaction_id;
use crate::types::{Oid, Tid};
use objdb_codec::{from_cbor, to_canonical_cbor, Value};
use std::sync::Weak;

/// Identity and metadata of the transaction driving a storage commit.
///
/// Storages recognise the transaction that owns their commit slot by `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionMeta {
    /// Unique transaction id within the process.
    pub id: u64,
    /// Who committed.
    pub user: String,
    /// Free-form description.
    pub description: String,
    /// Extension metadata, a CBOR map.
    pub extension: Value,
}

impl TransactionMeta {
    /// Creates metadata with a fresh transaction id.
    #[must_use]
    pub fn new() -> Self {
        Self::with_id(next_transaction_id())
    }

    pub(crate) fn with_id(id: u64) -> Self {
        Self {
            id,
            user: String::new(),
            description: String::new(),
            extension: Value::empty_map(),
        }
    }

    /// Sets the user.
    #[must_use]
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Serialized extension bytes; empty when the map is empty.
    pub(crate) fn extension_bytes(&self) -> Vec<u8> {
        match &self.extension {
            Value::Null => Vec::new(),
            Value::Map(pairs) if pairs.is_empty() => Vec::new(),
            other => to_canonical_cbor(other),
        }
    }
}

impl Default for TransactionMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// A revision returned by [`Storage::load_before`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedRevision {
    /// Payload bytes.
    pub data: Vec<u8>,
    /// TID of the revision.
    pub tid: Tid,
    /// TID of the next revision, or `None` if this one is current.
    pub end_tid: Option<Tid>,
}

/// Result of a successful [`Storage::store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// The payload was staged as given.
    Stored,
    /// A conflict was merged; the staged payload differs from the one given.
    Resolved,
}

/// One entry of [`Storage::history`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Revision TID.
    pub tid: Tid,
    /// Committing user.
    pub user: String,
    /// Transaction description.
    pub description: String,
    /// Payload size in bytes (0 for an undone creation).
    pub size: usize,
}

/// One entry of [`Storage::undo_log`].
#[derive(Debug, Clone, PartialEq)]
pub struct UndoInfo {
    /// TID of the undoable transaction; pass it to [`Storage::undo`].
    pub tid: Tid,
    /// Committing user.
    pub user: String,
    /// Transaction description.
    pub description: String,
    /// Decoded extension map (empty if none).
    pub extension: Value,
}

/// A committed transaction as yielded by [`Storage::iterator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    /// Transaction TID.
    pub tid: Tid,
    /// Status byte.
    pub status: TxnStatus,
    /// Raw user bytes.
    pub user: Vec<u8>,
    /// Raw description bytes.
    pub description: Vec<u8>,
    /// Raw extension bytes (canonical CBOR map, or empty).
    pub extension: Vec<u8>,
    /// Offset of the transaction header in the log.
    pub position: u64,
    /// Records in log order.
    pub records: Vec<DataRecord>,
}

impl TransactionRecord {
    /// User as text.
    #[must_use]
    pub fn user_lossy(&self) -> String {
        String::from_utf8_lossy(&self.user).into_owned()
    }

    /// Description as text.
    #[must_use]
    pub fn description_lossy(&self) -> String {
        String::from_utf8_lossy(&self.description).into_owned()
    }

    /// Decoded extension map.
    pub fn extension_value(&self) -> CoreResult<Value> {
        if self.extension.is_empty() {
            return Ok(Value::empty_map());
        }
        Ok(from_cbor(&self.extension)?)
    }
}

/// A data record inside a [`TransactionRecord`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRecord {
    /// Object written.
    pub oid: Oid,
    /// Transaction TID.
    pub tid: Tid,
    /// Payload, with back-pointers already followed. `None` marks an undone
    /// object creation.
    pub data: Option<Vec<u8>>,
    /// When the record is a back-pointer, the TID of the transaction whose
    /// record carries the bytes.
    pub data_txn: Option<Tid>,
    /// Offset of the record in the log.
    pub position: u64,
}

/// Receives commit notifications for commits that did not pass a callback
/// to `tpc_finish`.
pub trait StorageObserver: Send + Sync {
    /// Objects in `oids` changed in transaction `tid`.
    fn invalidate(&self, tid: Tid, oids: &[Oid]);

    /// Every cached object may be stale.
    fn invalidate_cache(&self) {}
}

/// Reference extraction used by pack.
pub type ReferencesFn = dyn Fn(&[u8]) -> CoreResult<Vec<Oid>> + Sync;

/// Iterator over committed transactions.
pub type TransactionStream<'a> = Box<dyn Iterator<Item = CoreResult<TransactionRecord>> + 'a>;

/// A transactional, multi-version object store.
///
/// Mutations happen inside a two-phase commit driven by the transaction
/// that owns the commit slot:
///
/// ```text
/// tpc_begin -> store* / undo* / check_current_serial* -> tpc_vote -> tpc_finish
///                                                  \-> tpc_abort (any time before finish)
/// ```
pub trait Storage: Send + Sync {
    /// Human-readable storage name.
    fn name(&self) -> &str;

    /// Key the coordinator sorts data managers by.
    fn sort_key(&self) -> String;

    /// True if mutations are rejected.
    fn is_read_only(&self) -> bool;

    /// TID of the latest committed transaction (zero if none).
    fn last_tid(&self) -> Tid;

    /// Number of objects with a current revision.
    fn len(&self) -> usize;

    /// True if no object has been stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Log size in bytes.
    fn size(&self) -> u64;

    /// Allocates a fresh OID.
    fn new_oid(&self) -> CoreResult<Oid>;

    /// Loads the current revision.
    fn load(&self, oid: Oid) -> CoreResult<(Vec<u8>, Tid)>;

    /// Loads the revision that was current strictly before `tid`.
    fn load_before(&self, oid: Oid, tid: Tid) -> CoreResult<Option<LoadedRevision>>;

    /// Loads the revision written by transaction `tid`.
    fn load_serial(&self, oid: Oid, tid: Tid) -> CoreResult<Vec<u8>>;

    /// Stages a new revision of `oid` based on revision `expected`.
    fn store(
        &self,
        oid: Oid,
        expected: Tid,
        data: Vec<u8>,
        txn: &TransactionMeta,
    ) -> CoreResult<StoreOutcome>;

    /// Requires `oid` to still be at revision `tid` when the transaction votes.
    fn check_current_serial(&self, oid: Oid, tid: Tid, txn: &TransactionMeta) -> CoreResult<()>;

    /// Claims the commit slot for `txn`. Idempotent for the owning transaction.
    fn tpc_begin(&self, txn: &TransactionMeta) -> CoreResult<()>;

    /// Writes the staged records durably and proposes a TID.
    fn tpc_vote(&self, txn: &TransactionMeta) -> CoreResult<Option<Tid>>;

    /// Commits at `tid` (or the proposal, if later) and releases the slot.
    ///
    /// `callback` runs with the final TID before the slot is released. When
    /// it is `None`, registered observers are notified instead.
    fn tpc_finish(
        &self,
        txn: &TransactionMeta,
        tid: Tid,
        callback: Option<&mut dyn FnMut(Tid)>,
    ) -> CoreResult<Tid>;

    /// Discards staged and voted work. Idempotent.
    fn tpc_abort(&self, txn: &TransactionMeta) -> CoreResult<()>;

    /// Stages the reversal of transaction `tid`, returning affected OIDs.
    fn undo(&self, tid: Tid, txn: &TransactionMeta) -> CoreResult<Vec<Oid>>;

    /// Undoable transactions, newest first, sliced to `[first, last)`.
    fn undo_log(&self, first: usize, last: usize) -> CoreResult<Vec<UndoInfo>>;

    /// Up to `size` revisions of `oid`, newest first.
    fn history(&self, oid: Oid, size: usize) -> CoreResult<Vec<HistoryEntry>>;

    /// Committed transactions with `start <= tid <= stop`, in order.
    fn iterator(&self, start: Option<Tid>, stop: Option<Tid>) -> CoreResult<TransactionStream<'_>>;

    /// Drops history before `cutoff` and, optionally, unreachable objects.
    fn pack(&self, cutoff: Tid, references: &ReferencesFn) -> CoreResult<PackResult>;

    /// Subscribes a database handle to commit notifications.
    fn register_db(&self, observer: Weak<dyn StorageObserver>);

    /// Resolvers consulted by `store` on conflict.
    fn conflict_resolvers(&self) -> &ConflictResolvers;

    /// Flushes state and releases the data file.
    fn close(&self) -> CoreResult<()>;
}
