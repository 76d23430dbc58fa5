//! The file storage.

use super::files::{index_path, pack_path, LockFile};
use super::format::{BlockBuilder, TxnStatus, RECORD_TID_OFFSET, STATUS_OFFSET};
use super::index::{FsIndex, IndexSnapshot};
use super::iterator::TransactionIterator;
use super::pack::PackResult;
use super::reader::LogReader;
use super::recovery::recover;
use crate::config::StorageConfig;
use crate::conflict::ConflictResolvers;
use crate::error::{CoreError, CoreResult};
use crate::storage::{
    HistoryEntry, LoadedRevision, ReferencesFn, Storage, StorageObserver, StoreOutcome,
    TransactionMeta, TransactionStream, UndoInfo,
};
use crate::timestamp::TidAllocator;
use crate::types::{Oid, Tid};
use objdb_storage::{FileBackend, InMemoryBackend, StorageBackend};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Mutable log state, guarded by the storage's read-write lock.
pub(crate) struct LogState {
    pub(crate) backend: Box<dyn StorageBackend>,
    pub(crate) index: FsIndex,
    pub(crate) last_tid: Tid,
    pub(crate) max_oid: Oid,
    /// End of the last committed transaction.
    pub(crate) end: u64,
    /// Bumped every time pack swaps the file.
    pub(crate) generation: u64,
}

impl LogState {
    pub(crate) fn reader(&self) -> LogReader<'_> {
        LogReader::new(&*self.backend)
    }

    /// TID of the newest revision of `oid`.
    pub(crate) fn current_tid(&self, oid: Oid) -> CoreResult<Option<Tid>> {
        match self.index.get(oid) {
            Some(pos) => Ok(Some(self.reader().data_header(pos)?.tid)),
            None => Ok(None),
        }
    }

    pub(crate) fn snapshot(&self) -> IndexSnapshot {
        IndexSnapshot {
            pos: self.end,
            last_tid: self.last_tid,
            max_oid: self.max_oid,
            index: self.index.clone(),
        }
    }
}

/// Body of a staged record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Staged {
    /// New payload bytes.
    Data(Vec<u8>),
    /// Back-pointer to an older record (0 undoes a creation).
    BackPointer(u64),
}

/// Block written at vote, awaiting finish.
#[derive(Debug)]
pub(crate) struct Voted {
    pub(crate) pos: u64,
    pub(crate) len: u64,
    pub(crate) tid: Tid,
    pub(crate) records: Vec<(Oid, u64)>,
}

/// Scratch state of the transaction owning the commit slot.
#[derive(Debug)]
pub(crate) struct PendingTxn {
    pub(crate) txn_id: u64,
    pub(crate) user: Vec<u8>,
    pub(crate) description: Vec<u8>,
    pub(crate) extension: Vec<u8>,
    /// Fixed TID and final status for restored transactions.
    pub(crate) restore: Option<(Tid, TxnStatus)>,
    pub(crate) records: Vec<(Oid, Staged)>,
    pub(crate) staged: HashMap<Oid, usize>,
    pub(crate) resolved: HashSet<Oid>,
    pub(crate) read_checks: Vec<(Oid, Tid)>,
    pub(crate) voted: Option<Voted>,
}

impl PendingTxn {
    fn new(txn: &TransactionMeta, restore: Option<(Tid, TxnStatus)>) -> Self {
        Self {
            txn_id: txn.id,
            user: txn.user.as_bytes().to_vec(),
            description: txn.description.as_bytes().to_vec(),
            extension: txn.extension_bytes(),
            restore,
            records: Vec::new(),
            staged: HashMap::new(),
            resolved: HashSet::new(),
            read_checks: Vec::new(),
            voted: None,
        }
    }

    /// Stages a record, replacing an earlier one for the same object.
    pub(crate) fn stage(&mut self, oid: Oid, body: Staged) {
        match self.staged.get(&oid) {
            Some(&slot) => self.records[slot].1 = body,
            None => {
                self.staged.insert(oid, self.records.len());
                self.records.push((oid, body));
            }
        }
    }
}

/// Commit slot: at most one transaction between `tpc_begin` and
/// `tpc_finish`/`tpc_abort`.
#[derive(Debug, Default)]
pub(crate) struct CommitSlot {
    pub(crate) pending: Option<PendingTxn>,
    /// Last finished transaction, so a second finish from the same
    /// transaction is a no-op.
    pub(crate) finished: Option<(u64, Tid)>,
}

/// Append-only FS21 storage.
///
/// Readers share the log lock; a committing transaction holds the commit
/// slot from `tpc_begin` until `tpc_finish` or `tpc_abort` and takes the
/// exclusive half of the log lock only while appending its block at vote
/// and while flipping its status byte at finish.
///
/// # Example
///
/// ```
/// use objdb_core::{FileStorage, Oid, Storage, Tid, TransactionMeta};
///
/// let storage = FileStorage::open_in_memory().unwrap();
/// let oid = storage.new_oid().unwrap();
/// let txn = TransactionMeta::new();
/// storage.tpc_begin(&txn).unwrap();
/// storage.store(oid, Tid::ZERO, b"hello".to_vec(), &txn).unwrap();
/// let proposed = storage.tpc_vote(&txn).unwrap().unwrap();
/// let tid = storage.tpc_finish(&txn, proposed, None).unwrap();
/// assert_eq!(storage.load(oid).unwrap(), (b"hello".to_vec(), tid));
/// ```
pub struct FileStorage {
    pub(crate) name: String,
    pub(crate) path: Option<PathBuf>,
    pub(crate) config: StorageConfig,
    pub(crate) state: RwLock<LogState>,
    pub(crate) slot: Mutex<CommitSlot>,
    pub(crate) slot_released: Condvar,
    pub(crate) tids: TidAllocator,
    pub(crate) observers: Mutex<Vec<Weak<dyn StorageObserver>>>,
    pub(crate) resolvers: ConflictResolvers,
    pub(crate) pack_lock: Mutex<()>,
    lock: Mutex<Option<LockFile>>,
    closed: AtomicBool,
    inoperable: AtomicBool,
}

impl FileStorage {
    /// Opens a storage as described by `config`.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Storage`] if the file is missing and `create` is off
    /// - [`CoreError::Locked`] if another process has it open for writing
    /// - [`CoreError::StorageSystem`] if the log is corrupted
    pub fn open(config: StorageConfig) -> CoreResult<Self> {
        let Some(path) = config.path.clone() else {
            let mut backend: Box<dyn StorageBackend> = Box::new(InMemoryBackend::new());
            let recovered = recover(backend.as_mut(), None, false)?;
            return Ok(Self::assemble("memory".to_string(), None, config, backend, recovered, None));
        };

        if !path.exists() {
            if !config.create || config.read_only {
                return Err(CoreError::storage(format!(
                    "data file {} does not exist",
                    path.display()
                )));
            }
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
        }

        let lock = if config.read_only {
            None
        } else {
            Some(LockFile::acquire(&path)?)
        };

        let stale_pack = pack_path(&path);
        if !config.read_only && stale_pack.exists() {
            warn!(path = %stale_pack.display(), "removing leftover pack file");
            fs::remove_file(&stale_pack)?;
        }

        let mut backend: Box<dyn StorageBackend> = if config.read_only {
            Box::new(FileBackend::open_read_only(&path)?)
        } else {
            Box::new(FileBackend::open(&path)?)
        };

        let sidecar = match IndexSnapshot::load(&index_path(&path)) {
            Ok(sidecar) => sidecar,
            Err(e) => {
                warn!(error = %e, "ignoring unreadable index sidecar");
                None
            }
        };
        let recovered = recover(backend.as_mut(), sidecar, config.read_only)?;
        info!(
            path = %path.display(),
            objects = recovered.index.len(),
            last_tid = %recovered.last_tid,
            scanned = recovered.transactions,
            read_only = config.read_only,
            "opened file storage"
        );
        let name = path.display().to_string();
        Ok(Self::assemble(name, Some(path), config, backend, recovered, lock))
    }

    /// Opens an empty storage that lives in memory.
    pub fn open_in_memory() -> CoreResult<Self> {
        Self::open(StorageConfig::in_memory())
    }

    /// Opens an existing data file read-only.
    pub fn open_read_only(path: impl AsRef<Path>) -> CoreResult<Self> {
        Self::open(StorageConfig::new(path.as_ref()).read_only(true))
    }

    fn assemble(
        name: String,
        path: Option<PathBuf>,
        config: StorageConfig,
        backend: Box<dyn StorageBackend>,
        recovered: super::recovery::Recovered,
        lock: Option<LockFile>,
    ) -> Self {
        let max_oid = recovered
            .index
            .max_oid()
            .map_or(recovered.max_oid, |oid| oid.max(recovered.max_oid));
        Self {
            name,
            path,
            config,
            state: RwLock::new(LogState {
                backend,
                index: recovered.index,
                last_tid: recovered.last_tid,
                max_oid,
                end: recovered.end,
                generation: 0,
            }),
            slot: Mutex::new(CommitSlot::default()),
            slot_released: Condvar::new(),
            tids: TidAllocator::new(recovered.last_tid),
            observers: Mutex::new(Vec::new()),
            resolvers: ConflictResolvers::new(),
            pack_lock: Mutex::new(()),
            lock: Mutex::new(lock),
            closed: AtomicBool::new(false),
            inoperable: AtomicBool::new(false),
        }
    }

    /// Data file path, `None` for in-memory storages.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Configuration the storage was opened with.
    #[must_use]
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub(crate) fn ensure_open(&self) -> CoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::Closed);
        }
        Ok(())
    }

    pub(crate) fn ensure_writable(&self) -> CoreResult<()> {
        self.ensure_open()?;
        if self.config.read_only {
            return Err(CoreError::ReadOnly);
        }
        if self.inoperable.load(Ordering::Acquire) {
            return Err(CoreError::storage_system(
                "storage is inoperable after a failed commit",
            ));
        }
        Ok(())
    }

    pub(crate) fn mark_inoperable(&self, cause: &CoreError) {
        self.inoperable.store(true, Ordering::Release);
        error!(storage = %self.name, error = %cause, "storage marked inoperable");
    }

    /// Returns the pending transaction owned by `txn`.
    pub(crate) fn owned<'s>(
        slot: &'s mut MutexGuard<'_, CommitSlot>,
        txn: &TransactionMeta,
    ) -> CoreResult<&'s mut PendingTxn> {
        match slot.pending.as_mut() {
            Some(pending) if pending.txn_id == txn.id => Ok(pending),
            Some(_) => Err(CoreError::storage_transaction(format!(
                "transaction {} does not own the commit lock",
                txn.id
            ))),
            None => Err(CoreError::storage_transaction(format!(
                "transaction {} has not called tpc_begin",
                txn.id
            ))),
        }
    }

    /// Like [`Self::owned`], but also rejects transactions that already voted.
    pub(crate) fn owned_unvoted<'s>(
        slot: &'s mut MutexGuard<'_, CommitSlot>,
        txn: &TransactionMeta,
    ) -> CoreResult<&'s mut PendingTxn> {
        let pending = Self::owned(slot, txn)?;
        if pending.voted.is_some() {
            return Err(CoreError::storage_transaction(
                "transaction has already voted",
            ));
        }
        Ok(pending)
    }

    /// Waits for the commit slot and claims it.
    fn begin(&self, txn: &TransactionMeta, restore: Option<(Tid, TxnStatus)>) -> CoreResult<()> {
        self.ensure_writable()?;
        let deadline = self.config.commit_lock_timeout.map(|t| Instant::now() + t);
        let mut slot = self.slot.lock();
        loop {
            let owner = slot.pending.as_ref().map(|p| p.txn_id);
            match owner {
                None => break,
                Some(id) if id == txn.id => return Ok(()),
                Some(_) => match deadline {
                    Some(deadline) => {
                        if self.slot_released.wait_until(&mut slot, deadline).timed_out()
                            && slot.pending.is_some()
                        {
                            return Err(CoreError::storage_transaction(
                                "timed out waiting for the commit lock",
                            ));
                        }
                    }
                    None => self.slot_released.wait(&mut slot),
                },
            }
        }
        slot.finished = None;
        slot.pending = Some(PendingTxn::new(txn, restore));
        debug!(txn = txn.id, "tpc_begin");
        Ok(())
    }

    /// Claims the commit slot to copy a transaction with a fixed TID and status.
    pub fn tpc_begin_restore(&self, txn: &TransactionMeta, tid: Tid, status: TxnStatus) -> CoreResult<()> {
        if status == TxnStatus::Checkpoint {
            return Err(CoreError::storage_transaction(
                "cannot restore an uncommitted transaction",
            ));
        }
        self.begin(txn, Some((tid, status)))
    }

    /// Stages a record copied from another storage.
    ///
    /// `data_txn` names the transaction whose record carries the bytes when
    /// the source record was a back-pointer; if that record exists here, a
    /// back-pointer is written, otherwise `data` is written inline. `data`
    /// and `data_txn` both `None` stage an undone creation.
    pub fn restore(
        &self,
        oid: Oid,
        data: Option<Vec<u8>>,
        data_txn: Option<Tid>,
        txn: &TransactionMeta,
    ) -> CoreResult<()> {
        self.ensure_writable()?;
        let mut slot = self.slot.lock();
        let pending = Self::owned_unvoted(&mut slot, txn)?;
        let body = {
            let state = self.state.read();
            let carrier = match data_txn {
                Some(tid) => find_revision(&state, oid, tid)?,
                None => None,
            };
            match (carrier, data) {
                (Some(pos), _) => Staged::BackPointer(pos),
                (None, Some(data)) => Staged::Data(data),
                (None, None) if data_txn.is_none() => Staged::BackPointer(0),
                (None, None) => {
                    return Err(CoreError::storage_transaction(format!(
                        "no record of {oid} from transaction {} to point at",
                        data_txn.unwrap_or_default()
                    )))
                }
            }
        };
        pending.stage(oid, body);
        Ok(())
    }

    /// Copies every transaction of `source` into this (empty or older) storage.
    ///
    /// TIDs, statuses, metadata and back-pointers are preserved, so copying
    /// a log into a fresh storage reproduces it byte for byte.
    pub fn copy_transactions_from(&self, source: &dyn Storage) -> CoreResult<usize> {
        let mut copied = 0;
        for record in source.iterator(None, None)? {
            let record = record?;
            let mut txn = TransactionMeta::new()
                .user(record.user_lossy())
                .description(record.description_lossy());
            txn.extension = record.extension_value()?;

            self.tpc_begin_restore(&txn, record.tid, record.status)?;
            let staged = record
                .records
                .iter()
                .try_for_each(|r| self.restore(r.oid, r.data.clone(), r.data_txn, &txn));
            let committed = staged
                .and_then(|()| self.tpc_vote(&txn))
                .and_then(|_| self.tpc_finish(&txn, record.tid, None));
            if let Err(e) = committed {
                if let Err(abort_error) = self.tpc_abort(&txn) {
                    warn!(error = %abort_error, "tpc_abort failed after copy error");
                }
                return Err(e);
            }
            copied += 1;
        }
        info!(transactions = copied, "copied transactions");
        Ok(copied)
    }

    /// Iterates committed transactions.
    #[must_use]
    pub fn transactions(&self, start: Option<Tid>, stop: Option<Tid>) -> TransactionIterator<'_> {
        TransactionIterator::new(self, start, stop)
    }

    fn try_resolve(&self, oid: Oid, expected: Tid, actual: Tid, data: &[u8]) -> CoreResult<Option<Vec<u8>>> {
        if self.resolvers.is_empty() || actual.is_zero() {
            return Ok(None);
        }
        let committed = self.load_serial(oid, actual)?;
        let ancestor = if expected.is_zero() {
            None
        } else {
            match self.load_serial(oid, expected) {
                Ok(ancestor) => Some(ancestor),
                Err(CoreError::PosKey { .. }) => return Ok(None),
                Err(e) => return Err(e),
            }
        };
        self.resolvers.resolve(oid, ancestor.as_deref(), &committed, data)
    }

    /// Writes the staged records as a `'c'` block at the end of the log.
    fn write_block(&self, pending: &PendingTxn) -> CoreResult<Voted> {
        let mut state = self.state.write();
        let tid = match pending.restore {
            Some((tid, _)) if tid <= state.last_tid => {
                return Err(CoreError::storage_transaction(format!(
                    "restored transaction {tid} is not after {}",
                    state.last_tid
                )))
            }
            Some((tid, _)) => tid,
            None => self.tids.new_tid().later_than(state.last_tid),
        };

        let pos = state.end;
        let size = state.backend.size()?;
        if size != pos {
            return Err(CoreError::storage_system(format!(
                "log size {size} does not match committed end {pos}"
            )));
        }

        let mut block = BlockBuilder::new(
            pos,
            tid,
            TxnStatus::Checkpoint,
            &pending.user,
            &pending.description,
            &pending.extension,
        )?;
        for (oid, body) in &pending.records {
            let prev = state.index.get(*oid).unwrap_or(0);
            match body {
                Staged::Data(data) => block.push_data(*oid, prev, data),
                Staged::BackPointer(bp) => block.push_back_pointer(*oid, prev, *bp),
            };
        }
        let (bytes, records) = block.finish();
        let len = bytes.len() as u64;

        if let Some(quota) = self.config.quota {
            if pos + len > quota {
                return Err(CoreError::QuotaExceeded {
                    size: pos + len,
                    quota,
                });
            }
        }

        let written = state
            .backend
            .append(&bytes)
            .and_then(|_| state.backend.flush())
            .and_then(|()| {
                if self.config.sync_on_commit {
                    state.backend.sync()
                } else {
                    Ok(())
                }
            });
        if let Err(e) = written {
            if let Err(truncate_error) = state.backend.truncate(pos) {
                warn!(error = %truncate_error, "failed to truncate after write error");
            }
            return Err(CoreError::storage(format!("failed to write transaction: {e}")));
        }
        Ok(Voted {
            pos,
            len,
            tid,
            records,
        })
    }

    /// Makes a voted block committed at `tid`.
    fn commit_block(&self, voted: &Voted, tid: Tid, status: TxnStatus) -> CoreResult<()> {
        let mut state = self.state.write();
        if tid != voted.tid {
            state.backend.write_at(voted.pos, tid.as_bytes())?;
            for (_, rpos) in &voted.records {
                state.backend.write_at(rpos + RECORD_TID_OFFSET, tid.as_bytes())?;
            }
            state.backend.flush()?;
            if self.config.sync_on_commit {
                state.backend.sync()?;
            }
        }
        state
            .backend
            .write_at(voted.pos + STATUS_OFFSET, &[status.as_byte()])?;
        state.backend.flush()?;
        if self.config.sync_on_commit {
            state.backend.sync()?;
        }

        for (oid, rpos) in &voted.records {
            state.index.insert(*oid, *rpos);
            if *oid > state.max_oid {
                state.max_oid = *oid;
            }
        }
        state.last_tid = tid;
        state.end = voted.pos + voted.len;
        self.tids.observe(tid);
        Ok(())
    }

    fn notify_observers(&self, tid: Tid, oids: &[Oid]) {
        let mut observers = self.observers.lock();
        observers.retain(|observer| match observer.upgrade() {
            Some(observer) => {
                observer.invalidate(tid, oids);
                true
            }
            None => false,
        });
    }

    pub(crate) fn notify_cache_invalidation(&self) {
        let mut observers = self.observers.lock();
        observers.retain(|observer| match observer.upgrade() {
            Some(observer) => {
                observer.invalidate_cache();
                true
            }
            None => false,
        });
    }

    pub(crate) fn save_index(&self) -> CoreResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if self.config.read_only || !self.config.save_index {
            return Ok(());
        }
        let snapshot = self.state.read().snapshot();
        snapshot.save(&index_path(path))?;
        info!(objects = snapshot.index.len(), pos = snapshot.pos, "saved index sidecar");
        Ok(())
    }
}

/// Offset of the data-carrying record of `oid` written by transaction `tid`.
pub(crate) fn find_revision(state: &LogState, oid: Oid, tid: Tid) -> CoreResult<Option<u64>> {
    let reader = state.reader();
    let mut pos = state.index.get(oid).unwrap_or(0);
    while pos != 0 {
        let header = reader.data_header(pos)?;
        if header.tid == tid {
            return Ok(reader.carrier(pos, &header)?.map(|(carrier, _)| carrier));
        }
        if header.tid < tid {
            break;
        }
        pos = header.prev;
    }
    Ok(None)
}

impl Storage for FileStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn sort_key(&self) -> String {
        self.name.clone()
    }

    fn is_read_only(&self) -> bool {
        self.config.read_only
    }

    fn last_tid(&self) -> Tid {
        self.state.read().last_tid
    }

    fn len(&self) -> usize {
        self.state.read().index.len()
    }

    fn size(&self) -> u64 {
        self.state.read().end
    }

    fn new_oid(&self) -> CoreResult<Oid> {
        self.ensure_writable()?;
        let mut state = self.state.write();
        state.max_oid = state.max_oid.next();
        Ok(state.max_oid)
    }

    fn load(&self, oid: Oid) -> CoreResult<(Vec<u8>, Tid)> {
        self.ensure_open()?;
        let state = self.state.read();
        let pos = state.index.get(oid).ok_or_else(|| CoreError::pos_key(oid))?;
        let reader = state.reader();
        let header = reader.data_header(pos)?;
        match reader.record_data(pos, &header)? {
            Some(data) => Ok((data, header.tid)),
            None => Err(CoreError::pos_key(oid)),
        }
    }

    fn load_before(&self, oid: Oid, tid: Tid) -> CoreResult<Option<LoadedRevision>> {
        self.ensure_open()?;
        let state = self.state.read();
        let Some(mut pos) = state.index.get(oid) else {
            return Ok(None);
        };
        let reader = state.reader();
        let mut end_tid = None;
        loop {
            let header = reader.data_header(pos)?;
            if header.tid < tid {
                return Ok(reader
                    .record_data(pos, &header)?
                    .map(|data| LoadedRevision {
                        data,
                        tid: header.tid,
                        end_tid,
                    }));
            }
            if header.prev == 0 {
                return Ok(None);
            }
            end_tid = Some(header.tid);
            pos = header.prev;
        }
    }

    fn load_serial(&self, oid: Oid, tid: Tid) -> CoreResult<Vec<u8>> {
        self.ensure_open()?;
        let state = self.state.read();
        let reader = state.reader();
        let mut pos = state.index.get(oid).unwrap_or(0);
        while pos != 0 {
            let header = reader.data_header(pos)?;
            if header.tid == tid {
                return reader.record_data(pos, &header)?.ok_or(CoreError::PosKey {
                    oid,
                    tid: Some(tid),
                });
            }
            if header.tid < tid {
                break;
            }
            pos = header.prev;
        }
        Err(CoreError::PosKey {
            oid,
            tid: Some(tid),
        })
    }

    fn store(
        &self,
        oid: Oid,
        expected: Tid,
        data: Vec<u8>,
        txn: &TransactionMeta,
    ) -> CoreResult<StoreOutcome> {
        self.ensure_writable()?;
        if data.is_empty() {
            return Err(CoreError::storage_transaction(format!(
                "empty payload for {oid}"
            )));
        }
        let mut slot = self.slot.lock();
        let pending = Self::owned_unvoted(&mut slot, txn)?;
        let actual = self.state.read().current_tid(oid)?.unwrap_or(Tid::ZERO);

        if actual == expected {
            pending.stage(oid, Staged::Data(data));
            return Ok(StoreOutcome::Stored);
        }
        let conflict = CoreError::Conflict {
            oid,
            expected,
            actual,
        };
        if pending.resolved.contains(&oid) {
            return Err(conflict);
        }
        match self.try_resolve(oid, expected, actual, &data)? {
            Some(merged) => {
                debug!(%oid, %expected, %actual, "stored resolved conflict");
                pending.resolved.insert(oid);
                pending.stage(oid, Staged::Data(merged));
                Ok(StoreOutcome::Resolved)
            }
            None => Err(conflict),
        }
    }

    fn check_current_serial(&self, oid: Oid, tid: Tid, txn: &TransactionMeta) -> CoreResult<()> {
        self.ensure_writable()?;
        let mut slot = self.slot.lock();
        Self::owned_unvoted(&mut slot, txn)?.read_checks.push((oid, tid));
        Ok(())
    }

    fn tpc_begin(&self, txn: &TransactionMeta) -> CoreResult<()> {
        self.begin(txn, None)
    }

    fn tpc_vote(&self, txn: &TransactionMeta) -> CoreResult<Option<Tid>> {
        self.ensure_writable()?;
        let mut slot = self.slot.lock();
        let pending = Self::owned(&mut slot, txn)?;
        if let Some(voted) = &pending.voted {
            return Ok(Some(voted.tid));
        }

        for (oid, tid) in &pending.read_checks {
            if pending.staged.contains_key(oid) {
                continue;
            }
            let actual = self.state.read().current_tid(*oid)?.unwrap_or(Tid::ZERO);
            if actual != *tid {
                return Err(CoreError::ReadConflict {
                    oid: *oid,
                    expected: *tid,
                    actual,
                });
            }
        }

        let voted = self.write_block(pending)?;
        debug!(
            txn = txn.id,
            tid = %voted.tid,
            records = voted.records.len(),
            bytes = voted.len,
            "tpc_vote"
        );
        let tid = voted.tid;
        pending.voted = Some(voted);
        Ok(Some(tid))
    }

    fn tpc_finish(
        &self,
        txn: &TransactionMeta,
        tid: Tid,
        callback: Option<&mut dyn FnMut(Tid)>,
    ) -> CoreResult<Tid> {
        self.ensure_open()?;
        let mut slot = self.slot.lock();
        match (&slot.pending, slot.finished) {
            (Some(pending), _) if pending.txn_id == txn.id => {}
            (_, Some((id, finished))) if id == txn.id => return Ok(finished),
            _ => {
                return Err(CoreError::storage_transaction(format!(
                    "transaction {} does not own the commit lock",
                    txn.id
                )))
            }
        }
        if slot.pending.as_ref().is_some_and(|p| p.voted.is_none()) {
            return Err(CoreError::storage_transaction(
                "tpc_finish called before tpc_vote",
            ));
        }
        let Some(pending) = slot.pending.take() else {
            return Err(CoreError::storage_transaction("no pending transaction"));
        };
        let Some(voted) = pending.voted.as_ref() else {
            return Err(CoreError::storage_transaction("no voted transaction"));
        };

        let (final_tid, status) = match pending.restore {
            Some((restored, status)) => (restored, status),
            None => (tid.max(voted.tid), TxnStatus::Committed),
        };
        if let Err(e) = self.commit_block(voted, final_tid, status) {
            let fatal = CoreError::storage_system(format!(
                "failed to finish transaction {final_tid}: {e}"
            ));
            self.mark_inoperable(&fatal);
            self.slot_released.notify_all();
            return Err(fatal);
        }

        let oids: Vec<Oid> = voted.records.iter().map(|(oid, _)| *oid).collect();
        match callback {
            Some(callback) => callback(final_tid),
            None => self.notify_observers(final_tid, &oids),
        }
        slot.finished = Some((txn.id, final_tid));
        self.slot_released.notify_all();
        debug!(txn = txn.id, tid = %final_tid, objects = oids.len(), "tpc_finish");
        Ok(final_tid)
    }

    fn tpc_abort(&self, txn: &TransactionMeta) -> CoreResult<()> {
        let mut slot = self.slot.lock();
        match &slot.pending {
            Some(pending) if pending.txn_id == txn.id => {}
            _ => return Ok(()),
        }
        let pending = slot.pending.take();
        self.slot_released.notify_all();
        if let Some(voted) = pending.and_then(|p| p.voted) {
            let mut state = self.state.write();
            state.backend.truncate(voted.pos)?;
            state.backend.flush()?;
        }
        debug!(txn = txn.id, "tpc_abort");
        Ok(())
    }

    fn undo(&self, tid: Tid, txn: &TransactionMeta) -> CoreResult<Vec<Oid>> {
        self.ensure_writable()?;
        self.undo_transaction(tid, txn)
    }

    fn undo_log(&self, first: usize, last: usize) -> CoreResult<Vec<UndoInfo>> {
        self.ensure_open()?;
        self.undoable_transactions(first, last)
    }

    fn history(&self, oid: Oid, size: usize) -> CoreResult<Vec<HistoryEntry>> {
        self.ensure_open()?;
        self.revisions(oid, size)
    }

    fn iterator(&self, start: Option<Tid>, stop: Option<Tid>) -> CoreResult<TransactionStream<'_>> {
        self.ensure_open()?;
        Ok(Box::new(self.transactions(start, stop)))
    }

    fn pack(&self, cutoff: Tid, references: &ReferencesFn) -> CoreResult<PackResult> {
        self.ensure_writable()?;
        self.pack_log(cutoff, references)
    }

    fn register_db(&self, observer: Weak<dyn StorageObserver>) {
        self.observers.lock().push(observer);
    }

    fn conflict_resolvers(&self) -> &ConflictResolvers {
        &self.resolvers
    }

    fn close(&self) -> CoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.slot.lock().pending.is_some() {
            warn!(storage = %self.name, "closing with a transaction in progress");
        }
        let saved = if self.inoperable.load(Ordering::Acquire) {
            Ok(())
        } else {
            self.save_index()
        };
        self.lock.lock().take();
        info!(storage = %self.name, "closed file storage");
        saved
    }
}

impl Drop for FileStorage {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(storage = %self.name, error = %e, "error closing storage");
        }
    }
}

impl std::fmt::Debug for FileStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("FileStorage")
            .field("name", &self.name)
            .field("objects", &state.index.len())
            .field("last_tid", &state.last_tid)
            .field("end", &state.end)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filestorage::format::MAGIC;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn commit(storage: &FileStorage, writes: &[(Oid, Tid, &[u8])]) -> CoreResult<Tid> {
        let txn = TransactionMeta::new();
        storage.tpc_begin(&txn)?;
        let result = writes
            .iter()
            .try_for_each(|(oid, expected, data)| {
                storage.store(*oid, *expected, data.to_vec(), &txn).map(|_| ())
            })
            .and_then(|()| storage.tpc_vote(&txn));
        match result {
            Ok(proposed) => storage.tpc_finish(&txn, proposed.unwrap_or_default(), None),
            Err(e) => {
                storage.tpc_abort(&txn)?;
                Err(e)
            }
        }
    }

    fn file_config(dir: &Path) -> StorageConfig {
        StorageConfig::new(dir.join("Data.fs")).create(true)
    }

    #[test]
    fn fresh_storage() {
        let storage = FileStorage::open_in_memory().unwrap();
        assert_eq!(storage.new_oid().unwrap(), Oid::from_u64(1));
        assert_eq!(storage.last_tid(), Tid::ZERO);
        assert!(matches!(
            storage.load(Oid::ROOT),
            Err(CoreError::PosKey { .. })
        ));
        assert_eq!(storage.size(), MAGIC.len() as u64);
    }

    #[test]
    fn new_oids_are_distinct() {
        let storage = FileStorage::open_in_memory().unwrap();
        let oids: HashSet<Oid> = (0..100).map(|_| storage.new_oid().unwrap()).collect();
        assert_eq!(oids.len(), 100);
    }

    #[test]
    fn store_and_load_revisions() {
        let storage = FileStorage::open_in_memory().unwrap();
        let oid = Oid::from_u64(1);
        let t1 = commit(&storage, &[(oid, Tid::ZERO, b"A")]).unwrap();
        let t2 = commit(&storage, &[(oid, t1, b"B")]).unwrap();
        assert!(t2 > t1);
        assert_eq!(storage.load(oid).unwrap(), (b"B".to_vec(), t2));
        assert_eq!(storage.last_tid(), t2);
        assert_eq!(
            storage.load_before(oid, t2).unwrap(),
            Some(LoadedRevision {
                data: b"A".to_vec(),
                tid: t1,
                end_tid: Some(t2)
            })
        );
        assert_eq!(
            storage.load_before(oid, t2.next()).unwrap().unwrap().end_tid,
            None
        );
        assert_eq!(storage.load_before(oid, t1).unwrap(), None);
        assert_eq!(storage.load_before(oid, Tid::ZERO).unwrap(), None);
        assert_eq!(storage.load_serial(oid, t1).unwrap(), b"A".to_vec());
        assert!(matches!(
            storage.load_serial(oid, t2.next()),
            Err(CoreError::PosKey { tid: Some(_), .. })
        ));
    }

    #[test]
    fn stale_serial_conflicts() {
        let storage = FileStorage::open_in_memory().unwrap();
        let oid = Oid::from_u64(1);
        let t1 = commit(&storage, &[(oid, Tid::ZERO, b"A")]).unwrap();
        commit(&storage, &[(oid, t1, b"B")]).unwrap();
        let err = commit(&storage, &[(oid, t1, b"C")]).unwrap_err();
        assert!(matches!(err, CoreError::Conflict { expected, .. } if expected == t1));
        assert!(err.is_transient());
        // The aborted commit left nothing behind.
        assert_eq!(storage.load(oid).unwrap().0, b"B".to_vec());
    }

    #[test]
    fn store_requires_tpc_begin() {
        let storage = FileStorage::open_in_memory().unwrap();
        let txn = TransactionMeta::new();
        assert!(matches!(
            storage.store(Oid::from_u64(1), Tid::ZERO, b"x".to_vec(), &txn),
            Err(CoreError::StorageTransaction { .. })
        ));
    }

    #[test]
    fn abort_after_vote_truncates() {
        let storage = FileStorage::open_in_memory().unwrap();
        let size = storage.size();
        let txn = TransactionMeta::new();
        storage.tpc_begin(&txn).unwrap();
        storage
            .store(Oid::from_u64(1), Tid::ZERO, b"x".to_vec(), &txn)
            .unwrap();
        storage.tpc_vote(&txn).unwrap();
        storage.tpc_abort(&txn).unwrap();
        assert_eq!(storage.state.read().backend.size().unwrap(), size);
        assert!(storage.load(Oid::from_u64(1)).is_err());
        // The slot is free again.
        commit(&storage, &[(Oid::from_u64(1), Tid::ZERO, b"y")]).unwrap();
    }

    #[test]
    fn finish_with_later_tid_patches_block() {
        let storage = FileStorage::open_in_memory().unwrap();
        let oid = Oid::from_u64(1);
        let txn = TransactionMeta::new();
        storage.tpc_begin(&txn).unwrap();
        storage.store(oid, Tid::ZERO, b"x".to_vec(), &txn).unwrap();
        let proposed = storage.tpc_vote(&txn).unwrap().unwrap();
        let later = Tid::from_u64(proposed.as_u64() + 1000);
        assert_eq!(storage.tpc_finish(&txn, later, None).unwrap(), later);
        assert_eq!(storage.load(oid).unwrap().1, later);
        // A second finish by the same transaction is a no-op.
        assert_eq!(storage.tpc_finish(&txn, later, None).unwrap(), later);
        let record = storage.transactions(None, None).next().unwrap().unwrap();
        assert_eq!(record.tid, later);
        assert_eq!(record.records[0].tid, later);
    }

    #[test]
    fn callback_replaces_observers() {
        struct Recorder(Mutex<Vec<(Tid, Vec<Oid>)>>);
        impl StorageObserver for Recorder {
            fn invalidate(&self, tid: Tid, oids: &[Oid]) {
                self.0.lock().push((tid, oids.to_vec()));
            }
        }
        let storage = FileStorage::open_in_memory().unwrap();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let weak = Arc::downgrade(&recorder);
        storage.register_db(weak);

        let t1 = commit(&storage, &[(Oid::from_u64(1), Tid::ZERO, b"x")]).unwrap();
        assert_eq!(recorder.0.lock().clone(), vec![(t1, vec![Oid::from_u64(1)])]);

        let txn = TransactionMeta::new();
        storage.tpc_begin(&txn).unwrap();
        storage
            .store(Oid::from_u64(2), Tid::ZERO, b"y".to_vec(), &txn)
            .unwrap();
        let proposed = storage.tpc_vote(&txn).unwrap().unwrap();
        let mut seen = None;
        storage
            .tpc_finish(&txn, proposed, Some(&mut |tid: Tid| seen = Some(tid)))
            .unwrap();
        assert_eq!(seen, Some(proposed));
        assert_eq!(recorder.0.lock().len(), 1);
    }

    #[test]
    fn read_current_detects_change() {
        let storage = FileStorage::open_in_memory().unwrap();
        let a = Oid::from_u64(1);
        let b = Oid::from_u64(2);
        let t1 = commit(&storage, &[(a, Tid::ZERO, b"a"), (b, Tid::ZERO, b"b")]).unwrap();
        commit(&storage, &[(a, t1, b"a2")]).unwrap();

        let txn = TransactionMeta::new();
        storage.tpc_begin(&txn).unwrap();
        storage.check_current_serial(a, t1, &txn).unwrap();
        storage.store(b, t1, b"b2".to_vec(), &txn).unwrap();
        assert!(matches!(
            storage.tpc_vote(&txn),
            Err(CoreError::ReadConflict { .. })
        ));
        storage.tpc_abort(&txn).unwrap();
    }

    #[test]
    fn quota_is_enforced() {
        let storage = FileStorage::open(StorageConfig::in_memory().quota(200)).unwrap();
        commit(&storage, &[(Oid::from_u64(1), Tid::ZERO, b"small")]).unwrap();
        let err = commit(&storage, &[(Oid::from_u64(2), Tid::ZERO, &[7u8; 256])]).unwrap_err();
        assert!(matches!(err, CoreError::QuotaExceeded { quota: 200, .. }));
    }

    #[test]
    fn read_only_rejects_mutation() {
        let dir = tempdir().unwrap();
        let config = file_config(dir.path());
        {
            let storage = FileStorage::open(config.clone()).unwrap();
            commit(&storage, &[(Oid::from_u64(1), Tid::ZERO, b"x")]).unwrap();
        }
        let storage = FileStorage::open(config.read_only(true)).unwrap();
        assert!(storage.is_read_only());
        assert!(matches!(storage.new_oid(), Err(CoreError::ReadOnly)));
        assert!(matches!(
            storage.tpc_begin(&TransactionMeta::new()),
            Err(CoreError::ReadOnly)
        ));
        assert_eq!(storage.load(Oid::from_u64(1)).unwrap().0, b"x".to_vec());
    }

    #[test]
    fn missing_file_without_create_fails() {
        let dir = tempdir().unwrap();
        let config = StorageConfig::new(dir.path().join("absent.fs"));
        assert!(matches!(
            FileStorage::open(config),
            Err(CoreError::Storage { .. })
        ));
    }

    #[test]
    fn reopen_uses_sidecar_and_keeps_oid_counter() {
        let dir = tempdir().unwrap();
        let config = file_config(dir.path());
        let (oid, tid) = {
            let storage = FileStorage::open(config.clone()).unwrap();
            let oid = storage.new_oid().unwrap();
            // Allocated but never stored.
            storage.new_oid().unwrap();
            let tid = commit(&storage, &[(oid, Tid::ZERO, b"v1")]).unwrap();
            storage.close().unwrap();
            (oid, tid)
        };
        assert!(index_path(&dir.path().join("Data.fs")).exists());

        let storage = FileStorage::open(config).unwrap();
        assert_eq!(storage.last_tid(), tid);
        assert_eq!(storage.load(oid).unwrap(), (b"v1".to_vec(), tid));
        assert_eq!(storage.new_oid().unwrap(), Oid::from_u64(3));
    }

    #[test]
    fn second_writer_is_locked_out() {
        let dir = tempdir().unwrap();
        let config = file_config(dir.path());
        let _first = FileStorage::open(config.clone()).unwrap();
        assert!(matches!(
            FileStorage::open(config.clone()),
            Err(CoreError::Locked { .. })
        ));
        // Readers do not take the lock.
        assert!(FileStorage::open(config.read_only(true)).is_ok());
    }

    #[test]
    fn closed_storage_rejects_calls() {
        let storage = FileStorage::open_in_memory().unwrap();
        storage.close().unwrap();
        assert!(matches!(storage.load(Oid::ROOT), Err(CoreError::Closed)));
        assert!(storage.close().is_ok());
    }

    #[test]
    fn concurrent_commits_serialize() {
        let storage = Arc::new(FileStorage::open_in_memory().unwrap());
        let handles: Vec<_> = (1..=8u64)
            .map(|n| {
                let storage = Arc::clone(&storage);
                std::thread::spawn(move || {
                    (0..10)
                        .map(|i| {
                            let oid = Oid::from_u64(n * 100 + i);
                            commit(&storage, &[(oid, Tid::ZERO, b"data")]).unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut tids: Vec<Tid> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        tids.sort();
        tids.dedup();
        assert_eq!(tids.len(), 80);
        assert_eq!(storage.len(), 80);
        let iterated: Vec<Tid> = storage
            .transactions(None, None)
            .map(|r| r.unwrap().tid)
            .collect();
        assert_eq!(iterated, tids);
    }

    #[test]
    fn restore_copies_byte_for_byte() {
        let source = FileStorage::open_in_memory().unwrap();
        let oid = Oid::from_u64(1);
        let t1 = commit(&source, &[(oid, Tid::ZERO, b"A")]).unwrap();
        let t2 = commit(&source, &[(oid, t1, b"B"), (Oid::from_u64(2), Tid::ZERO, b"C")]).unwrap();
        let undo = TransactionMeta::new();
        source.tpc_begin(&undo).unwrap();
        source.undo(t2, &undo).unwrap();
        let proposed = source.tpc_vote(&undo).unwrap().unwrap();
        source.tpc_finish(&undo, proposed, None).unwrap();

        let copy = FileStorage::open_in_memory().unwrap();
        assert_eq!(copy.copy_transactions_from(&source).unwrap(), 3);
        assert_eq!(copy.last_tid(), source.last_tid());
        let original = source.state.read().backend.read_at(0, source.size() as usize).unwrap();
        let copied = copy.state.read().backend.read_at(0, copy.size() as usize).unwrap();
        assert_eq!(original, copied);
    }
}
