//! The database handle.

use crate::cache::CacheDetail;
use crate::config::{DatabaseConfig, StorageConfig};
use crate::connection::{Connection, ConnectionInner};
use crate::conflict::ConflictInput;
use crate::error::{CoreError, CoreResult};
use crate::filestorage::{FileStorage, PackResult};
use crate::invalidation::InvalidationQueue;
use crate::serialize::{self, encode_record, ClassInfo};
use crate::storage::{ReferencesFn, Storage, StorageObserver, TransactionMeta, UndoInfo};
use crate::timestamp::{tid_before_now, tid_from_system_time, TimeStamp};
use crate::transaction::{DataManager, Transaction, TransactionManager};
use crate::types::{Oid, Tid};
use objdb_codec::Value;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

struct DbInner {
    storage: Arc<dyn Storage>,
    config: DatabaseConfig,
    queue: Arc<InvalidationQueue>,
    pool: Mutex<Vec<Arc<ConnectionInner>>>,
    connections: Mutex<Vec<Weak<ConnectionInner>>>,
    opened: AtomicUsize,
    closed: AtomicBool,
}

impl DbInner {
    fn release(&self, connection: Arc<ConnectionInner>) {
        connection.release();
        self.opened.fetch_sub(1, Ordering::AcqRel);
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut pool = self.pool.lock();
        if pool.len() < self.config.pool_size {
            pool.push(connection);
        }
    }
}

impl StorageObserver for DbInner {
    fn invalidate(&self, tid: Tid, oids: &[Oid]) {
        self.queue.push(tid, oids.iter().copied());
    }

    fn invalidate_cache(&self) {
        debug!("full cache invalidation");
        self.queue.invalidate_all(self.storage.last_tid());
        let mut connections = self.connections.lock();
        connections.retain(|connection| match connection.upgrade() {
            Some(connection) => {
                connection.request_full_invalidation();
                true
            }
            None => false,
        });
    }
}

/// Summary of the latest committed transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct LastTransaction {
    /// Its TID.
    pub tid: Tid,
    /// Commit time decoded from the TID.
    pub time: TimeStamp,
}

/// A database: a storage plus a pool of connections sharing its
/// invalidation queue.
///
/// # Example
///
/// ```
/// use objdb_core::{Database, DatabaseConfig, FileStorage, Value};
/// use std::sync::Arc;
///
/// let storage = Arc::new(FileStorage::open_in_memory().unwrap());
/// let db = Database::open(storage, DatabaseConfig::default()).unwrap();
/// let conn = db.connection().unwrap();
/// conn.root().unwrap().set("greeting", Value::text("hello")).unwrap();
/// conn.commit().unwrap();
/// ```
#[derive(Clone)]
pub struct Database {
    inner: Arc<DbInner>,
}

impl Database {
    /// Wraps `storage`, creating the root object if it is missing.
    pub fn open(storage: Arc<dyn Storage>, config: DatabaseConfig) -> CoreResult<Self> {
        ensure_root(storage.as_ref())?;
        let queue = Arc::new(InvalidationQueue::new(
            storage.last_tid(),
            config.invalidation_history,
        ));
        let inner = Arc::new(DbInner {
            storage: Arc::clone(&storage),
            config,
            queue,
            pool: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
            opened: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        let observer: Weak<dyn StorageObserver> = Arc::downgrade(&inner) as Weak<dyn StorageObserver>;
        storage.register_db(observer);
        info!(storage = storage.name(), last_tid = %storage.last_tid(), objects = storage.len(), "database opened");
        Ok(Self { inner })
    }

    /// Opens a [`FileStorage`] and wraps it.
    pub fn open_file(storage: StorageConfig, config: DatabaseConfig) -> CoreResult<Self> {
        let storage = Arc::new(FileStorage::open(storage)?);
        Self::open(storage, config)
    }

    /// The underlying storage.
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.inner.storage
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(CoreError::connection_state("database is closed"));
        }
        Ok(())
    }

    /// Opens a connection with its own transaction manager.
    pub fn connection(&self) -> CoreResult<Connection> {
        let mut manager = TransactionManager::new();
        if let Some(timeout) = self.inner.config.commit_timeout {
            manager = manager.with_commit_timeout(timeout);
        }
        self.connection_with_manager(Arc::new(manager))
    }

    /// Opens a connection that joins transactions of `manager`.
    pub fn connection_with_manager(&self, manager: Arc<TransactionManager>) -> CoreResult<Connection> {
        self.ensure_open()?;
        let pooled = self.inner.pool.lock().pop();
        let inner = match pooled {
            Some(inner) => inner,
            None => {
                let config = &self.inner.config;
                let inner = ConnectionInner::new(
                    Arc::clone(&self.inner.storage),
                    Arc::clone(&self.inner.queue),
                    Arc::clone(&manager),
                    config.cache_size,
                    config.cache_size_bytes,
                    config.cache_gc_interval,
                );
                let mut connections = self.inner.connections.lock();
                connections.retain(|c| c.strong_count() > 0);
                connections.push(Arc::downgrade(&inner));
                inner
            }
        };
        let opened = self.inner.opened.fetch_add(1, Ordering::AcqRel) + 1;
        if opened > self.inner.config.pool_size {
            warn!(
                opened,
                pool_size = self.inner.config.pool_size,
                "more connections open than the pool holds"
            );
        }
        inner.reopen(manager);
        let db = Arc::clone(&self.inner);
        Ok(Connection::new(
            inner,
            Box::new(move |connection| db.release(connection)),
        ))
    }

    /// Connections currently handed out.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.opened.load(Ordering::Acquire)
    }

    /// Idle connections in the pool.
    #[must_use]
    pub fn pool_len(&self) -> usize {
        self.inner.pool.lock().len()
    }

    /// Registers a conflict resolver for objects of `class`.
    pub fn register_conflict_resolver<F>(&self, class: ClassInfo, resolver: F)
    where
        F: Fn(&ConflictInput<'_>) -> Option<Value> + Send + Sync + 'static,
    {
        self.inner.storage.conflict_resolvers().register(class, resolver);
    }

    /// Packs the storage at `cutoff`, following references in object states.
    pub fn pack(&self, cutoff: Tid) -> CoreResult<PackResult> {
        self.ensure_open()?;
        let references: &ReferencesFn = &serialize::references;
        self.inner.storage.pack(cutoff, references)
    }

    /// Packs away history older than `days` days.
    pub fn pack_days(&self, days: f64) -> CoreResult<PackResult> {
        if !days.is_finite() || days < 0.0 {
            return Err(CoreError::unsupported(format!("cannot pack {days} days back")));
        }
        self.pack(tid_before_now(Duration::from_secs_f64(days * 86_400.0)))
    }

    /// Undoes transaction `tid` as part of `txn`.
    pub fn undo(&self, tid: Tid, txn: &Transaction) -> CoreResult<()> {
        self.ensure_open()?;
        let request = Arc::new(UndoRequest {
            storage: Arc::clone(&self.inner.storage),
            tid,
        });
        txn.join(request as Arc<dyn DataManager>)
    }

    /// Undoable transactions, newest first.
    pub fn undo_log(&self, first: usize, last: usize) -> CoreResult<Vec<UndoInfo>> {
        self.inner.storage.undo_log(first, last)
    }

    /// The latest committed transaction, if any.
    #[must_use]
    pub fn last_transaction(&self) -> Option<LastTransaction> {
        let tid = self.inner.storage.last_tid();
        (!tid.is_zero()).then(|| LastTransaction {
            tid,
            time: TimeStamp::from_tid(tid),
        })
    }

    /// Cache statistics of idle pooled connections.
    #[must_use]
    pub fn cache_detail(&self) -> Vec<CacheDetail> {
        self.inner
            .pool
            .lock()
            .iter()
            .map(|connection| connection.cache_detail())
            .collect()
    }

    /// Forces every connection to drop its cached state at its next
    /// transaction.
    pub fn invalidate_cache(&self) {
        self.inner.invalidate_cache();
    }

    /// Closes the pool and the storage.
    pub fn close(&self) -> CoreResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let open = self.connection_count();
        if open > 0 {
            warn!(open, "closing database with open connections");
        }
        self.inner.pool.lock().clear();
        self.inner.storage.close()
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("storage", &self.inner.storage.name())
            .field("connections", &self.connection_count())
            .field("pooled", &self.pool_len())
            .finish()
    }
}

/// Stores an empty root mapping if OID 0 has never been written.
fn ensure_root(storage: &dyn Storage) -> CoreResult<()> {
    match storage.load(Oid::ROOT) {
        Ok(_) => return Ok(()),
        Err(CoreError::PosKey { .. }) if !storage.is_read_only() => {}
        Err(CoreError::PosKey { .. }) => return Ok(()),
        Err(e) => return Err(e),
    }
    let meta = TransactionMeta::new().description("initial database creation");
    let data = encode_record(&ClassInfo::persistent_mapping(), &Value::empty_map());
    storage.tpc_begin(&meta)?;
    let written = storage
        .store(Oid::ROOT, Tid::ZERO, data, &meta)
        .and_then(|_| storage.tpc_vote(&meta))
        .and_then(|proposed| {
            let tid = proposed.unwrap_or_else(|| tid_from_system_time(SystemTime::now()));
            storage.tpc_finish(&meta, tid, None)
        });
    match written {
        Ok(tid) => {
            info!(%tid, "created root object");
            Ok(())
        }
        Err(e) => {
            if let Err(abort_error) = storage.tpc_abort(&meta) {
                warn!(error = %abort_error, "tpc_abort failed after root creation error");
            }
            Err(e)
        }
    }
}

/// Joins a transaction to undo one earlier transaction.
struct UndoRequest {
    storage: Arc<dyn Storage>,
    tid: Tid,
}

impl DataManager for UndoRequest {
    fn sort_key(&self) -> String {
        self.storage.sort_key()
    }

    fn abort(&self, _txn: &Transaction) -> CoreResult<()> {
        Ok(())
    }

    fn tpc_begin(&self, txn: &Transaction) -> CoreResult<()> {
        self.storage.tpc_begin(&txn.meta())
    }

    fn commit(&self, txn: &Transaction) -> CoreResult<()> {
        let oids = self.storage.undo(self.tid, &txn.meta())?;
        debug!(tid = %self.tid, objects = oids.len(), "staged undo");
        Ok(())
    }

    fn tpc_vote(&self, txn: &Transaction) -> CoreResult<Option<Tid>> {
        self.storage.tpc_vote(&txn.meta())
    }

    fn tpc_finish(&self, txn: &Transaction, tid: Tid) -> CoreResult<Tid> {
        self.storage.tpc_finish(&txn.meta(), tid, None)
    }

    fn tpc_abort(&self, txn: &Transaction) -> CoreResult<()> {
        self.storage.tpc_abort(&txn.meta())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectStatus;
    use objdb_codec::PersistentRef;
    use tempfile::TempDir;

    fn memory_db() -> Database {
        let storage = Arc::new(FileStorage::open_in_memory().unwrap());
        Database::open(storage, DatabaseConfig::default()).unwrap()
    }

    fn counter_class() -> ClassInfo {
        ClassInfo::new("tests", "Counter")
    }

    #[test]
    fn open_creates_root_once() {
        let db = memory_db();
        let first = db.storage().last_tid();
        assert!(!first.is_zero());
        let conn = db.connection().unwrap();
        let root = conn.root().unwrap();
        assert_eq!(root.class(), &ClassInfo::persistent_mapping());
        assert_eq!(root.state().unwrap(), Value::empty_map());
        drop(conn);

        let again = Database::open(Arc::clone(db.storage()), DatabaseConfig::default()).unwrap();
        assert_eq!(again.storage().last_tid(), first);
    }

    #[test]
    fn commit_and_reload_in_new_connection() {
        let db = memory_db();
        let conn = db.connection().unwrap();
        let counter = conn
            .new_object(counter_class(), Value::map(vec![(Value::text("n"), Value::Integer(1))]))
            .unwrap();
        let reference = conn.reference(&counter).unwrap();
        conn.root().unwrap().set("counter", reference).unwrap();
        let tid = conn.commit().unwrap();
        assert_eq!(counter.status(), ObjectStatus::Saved);
        assert_eq!(counter.serial(), tid);

        let other = db.connection().unwrap();
        let root = other.root().unwrap();
        let reference = root.get("counter").unwrap().unwrap();
        let loaded = other.resolve(&reference).unwrap();
        assert_eq!(loaded.status(), ObjectStatus::Ghost);
        assert_eq!(loaded.get("n").unwrap(), Some(Value::Integer(1)));
        assert_eq!(loaded.serial(), tid);
    }

    #[test]
    fn lazily_loaded_objects_count_in_cache() {
        let db = memory_db();
        let conn = db.connection().unwrap();
        let counter = conn
            .new_object(counter_class(), Value::map(vec![(Value::text("n"), Value::Integer(1))]))
            .unwrap();
        let reference = conn.reference(&counter).unwrap();
        conn.root().unwrap().set("counter", reference).unwrap();
        conn.commit().unwrap();

        let other = db.connection().unwrap();
        let reference = other.root().unwrap().get("counter").unwrap().unwrap();
        let ghost = other.resolve(&reference).unwrap();
        let before = other.cache_detail();
        assert_eq!(ghost.get("n").unwrap(), Some(Value::Integer(1)));
        let after = other.cache_detail();
        assert_eq!(after.non_ghost, before.non_ghost + 1);
        assert!(after.estimated_bytes > before.estimated_bytes);
    }

    #[test]
    fn snapshot_isolation_until_next_transaction() {
        let db = memory_db();
        let writer = db.connection().unwrap();
        let reader = db.connection().unwrap();
        reader.transaction();
        let before = reader.root().unwrap();
        assert_eq!(before.get("k").unwrap(), None);

        writer.root().unwrap().set("k", Value::Integer(1)).unwrap();
        writer.commit().unwrap();

        // Same transaction: still the old snapshot.
        assert_eq!(reader.root().unwrap().get("k").unwrap(), None);

        reader.abort().unwrap();
        reader.transaction();
        assert_eq!(reader.root().unwrap().get("k").unwrap(), Some(Value::Integer(1)));
    }

    #[test]
    fn abort_reverts_to_committed_state() {
        let db = memory_db();
        let conn = db.connection().unwrap();
        let root = conn.root().unwrap();
        root.set("a", Value::Integer(1)).unwrap();
        conn.commit().unwrap();

        root.set("a", Value::Integer(2)).unwrap();
        let fresh = conn.new_object(counter_class(), Value::Null).unwrap();
        assert!(conn.has_pending_changes());
        conn.abort().unwrap();

        assert_eq!(root.status(), ObjectStatus::Ghost);
        assert_eq!(root.get("a").unwrap(), Some(Value::Integer(1)));
        assert_eq!(fresh.status(), ObjectStatus::New);
        assert!(!conn.has_pending_changes());
    }

    #[test]
    fn concurrent_writers_conflict() {
        let db = memory_db();
        let a = db.connection().unwrap();
        let b = db.connection().unwrap();
        a.transaction();
        b.transaction();
        let root_a = a.root().unwrap();
        let root_b = b.root().unwrap();

        root_a.set("x", Value::Integer(1)).unwrap();
        root_b.set("x", Value::Integer(2)).unwrap();
        a.commit().unwrap();
        let err = b.commit().unwrap_err();
        assert!(err.is_transient(), "{err}");
        assert_eq!(root_b.status(), ObjectStatus::Ghost);

        b.transaction();
        assert_eq!(b.root().unwrap().get("x").unwrap(), Some(Value::Integer(1)));
    }

    #[test]
    fn resolver_merges_concurrent_increments() {
        let db = memory_db();
        db.register_conflict_resolver(counter_class(), |input| {
            let n = |v: &Value| v.get("n").and_then(Value::as_integer).unwrap_or(0);
            let base = input.ancestor.map_or(0, n);
            let merged = n(input.committed) + n(input.new) - base;
            Some(Value::map(vec![(Value::text("n"), Value::Integer(merged))]))
        });

        let setup = db.connection().unwrap();
        let counter = setup
            .new_object(counter_class(), Value::map(vec![(Value::text("n"), Value::Integer(0))]))
            .unwrap();
        let oid = setup.add(&counter).unwrap();
        setup.commit().unwrap();
        drop(setup);

        let a = db.connection().unwrap();
        let b = db.connection().unwrap();
        a.transaction();
        b.transaction();
        let ca = a.get(oid).unwrap();
        let cb = b.get(oid).unwrap();
        ca.set("n", Value::Integer(1)).unwrap();
        cb.set("n", Value::Integer(2)).unwrap();
        a.commit().unwrap();
        b.commit().unwrap();
        assert_eq!(cb.status(), ObjectStatus::Ghost);
        assert_eq!(cb.get("n").unwrap(), Some(Value::Integer(3)));
    }

    #[test]
    fn objects_cannot_cross_connections() {
        let db = memory_db();
        let a = db.connection().unwrap();
        let b = db.connection().unwrap();
        let object = a.new_object(counter_class(), Value::Null).unwrap();
        assert!(matches!(
            b.add(&object),
            Err(CoreError::InvalidObjectReference { .. })
        ));
        assert!(matches!(
            b.reference(&object),
            Err(CoreError::InvalidObjectReference { .. })
        ));
    }

    #[test]
    fn close_refuses_pending_changes_and_pool_reuses() {
        let db = Database::open(
            Arc::new(FileStorage::open_in_memory().unwrap()),
            DatabaseConfig::default().pool_size(1),
        )
        .unwrap();
        let conn = db.connection().unwrap();
        conn.root().unwrap().set("x", Value::Integer(1)).unwrap();
        assert_eq!(db.connection_count(), 1);
        let err = conn.close().unwrap_err();
        assert!(matches!(err, CoreError::ConnectionState { .. }));
        // Dropping after the failed close discards the changes.
        assert_eq!(db.connection_count(), 0);
        assert_eq!(db.pool_len(), 1);

        let reused = db.connection().unwrap();
        assert_eq!(db.pool_len(), 0);
        assert!(!reused.has_pending_changes());
        assert_eq!(reused.root().unwrap().get("x").unwrap(), None);
        let extra = db.connection().unwrap();
        drop(reused);
        drop(extra);
        assert_eq!(db.pool_len(), 1);
    }

    #[test]
    fn undo_restores_previous_state() {
        let db = memory_db();
        let conn = db.connection().unwrap();
        let root = conn.root().unwrap();
        root.set("v", Value::Integer(1)).unwrap();
        conn.commit().unwrap();
        root.set("v", Value::Integer(2)).unwrap();
        let second = conn.commit().unwrap();

        let log = db.undo_log(0, 10).unwrap();
        assert_eq!(log[0].tid, second);

        let manager = conn.transaction_manager();
        let txn = manager.begin();
        db.undo(second, &txn).unwrap();
        manager.commit().unwrap();

        conn.transaction();
        assert_eq!(root.get("v").unwrap(), Some(Value::Integer(1)));
    }

    #[test]
    fn pack_removes_unreachable_objects() {
        let db = memory_db();
        let conn = db.connection().unwrap();
        let root = conn.root().unwrap();
        let child = conn.new_object(counter_class(), Value::Null).unwrap();
        let oid = child.oid().unwrap();
        root.set("child", conn.reference(&child).unwrap()).unwrap();
        conn.commit().unwrap();
        root.update(|state| state.remove("child")).unwrap();
        conn.commit().unwrap();

        let result = db.pack(db.storage().last_tid()).unwrap();
        assert_eq!(result.objects_removed, 1);
        assert!(matches!(
            db.storage().load(oid),
            Err(CoreError::PosKey { .. })
        ));
        assert!(db.storage().load(Oid::ROOT).is_ok());
    }

    #[test]
    fn read_current_detects_concurrent_change() {
        let db = memory_db();
        let a = db.connection().unwrap();
        let b = db.connection().unwrap();
        let setup = a.new_object(counter_class(), Value::Integer(0)).unwrap();
        let oid = setup.oid().unwrap();
        a.commit().unwrap();

        b.transaction();
        let seen = b.get(oid).unwrap();
        b.read_current(&seen).unwrap();
        b.root().unwrap().set("copy", Value::Integer(0)).unwrap();

        a.transaction();
        a.get(oid).unwrap().set_state(Value::Integer(5)).unwrap();
        a.commit().unwrap();

        assert!(matches!(
            b.commit(),
            Err(CoreError::ReadConflict { .. })
        ));
    }

    #[test]
    fn file_database_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.fs");
        {
            let db = Database::open_file(StorageConfig::new(&path).create(true), DatabaseConfig::default())
                .unwrap();
            let conn = db.connection().unwrap();
            let item = conn.new_object(counter_class(), Value::Integer(9)).unwrap();
            let reference = conn.reference(&item).unwrap();
            conn.root().unwrap().set("item", reference).unwrap();
            conn.commit().unwrap();
            drop(conn);
            db.close().unwrap();
        }
        let db = Database::open_file(StorageConfig::new(&path), DatabaseConfig::default()).unwrap();
        let conn = db.connection().unwrap();
        let reference = conn.root().unwrap().get("item").unwrap().unwrap();
        assert!(PersistentRef::from_value(&reference).is_ok());
        assert_eq!(conn.resolve(&reference).unwrap().state().unwrap(), Value::Integer(9));
        assert!(db.last_transaction().is_some());
    }

    #[test]
    fn pack_invalidates_caches() {
        let db = memory_db();
        let conn = db.connection().unwrap();
        let root = conn.root().unwrap();
        let child = conn.new_object(counter_class(), Value::Null).unwrap();
        root.set("child", conn.reference(&child).unwrap()).unwrap();
        conn.commit().unwrap();
        root.update(|state| state.remove("child")).unwrap();
        conn.commit().unwrap();
        drop(child);

        db.pack(db.storage().last_tid()).unwrap();
        conn.transaction_manager().begin();
        assert_eq!(root.status(), ObjectStatus::Ghost);
        assert_eq!(root.get("child").unwrap(), None);
    }
}
