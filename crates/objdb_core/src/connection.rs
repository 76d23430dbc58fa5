//! Connections: a snapshot view of the database plus an object cache.
//!
//! A connection reads every object as of its snapshot TID and catches up
//! at the start of each transaction through the database's invalidation
//! queue. Changed objects are written when the transaction commits; the
//! connection takes part in two-phase commit as a [`DataManager`].

use crate::cache::{CacheDetail, ObjectCache};
use crate::error::{CoreError, CoreResult};
use crate::invalidation::{InvalidationQueue, Invalidations};
use crate::object::{ObjectHost, PersistentObject};
use crate::serialize::{decode_record, encode_record, ClassInfo};
use crate::storage::{Storage, StoreOutcome};
use crate::transaction::{DataManager, Synchronizer, Transaction, TransactionManager};
use crate::types::{Oid, Tid};
use objdb_codec::{PersistentRef, Value};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct Pending {
    joined: Option<u64>,
    registered: Vec<Arc<PersistentObject>>,
    registered_oids: HashSet<Oid>,
    added: HashSet<Oid>,
    read_current: HashMap<Oid, Tid>,
    stored: Vec<(Oid, usize)>,
    resolved: HashSet<Oid>,
}

impl Pending {
    fn has_changes(&self) -> bool {
        !self.registered.is_empty()
    }
}

struct ConnState {
    snapshot: Tid,
    accesses: usize,
    closed: bool,
    pending: Pending,
}

pub(crate) struct ConnectionInner {
    id: u64,
    storage: Arc<dyn Storage>,
    queue: Arc<InvalidationQueue>,
    manager: Mutex<Arc<TransactionManager>>,
    cache: Mutex<ObjectCache>,
    state: Mutex<ConnState>,
    gc_interval: usize,
    full_invalidation: AtomicBool,
    this: Weak<ConnectionInner>,
}

impl ConnectionInner {
    pub(crate) fn new(
        storage: Arc<dyn Storage>,
        queue: Arc<InvalidationQueue>,
        manager: Arc<TransactionManager>,
        cache_size: usize,
        cache_size_bytes: usize,
        gc_interval: usize,
    ) -> Arc<Self> {
        let snapshot = queue.last_tid();
        Arc::new_cyclic(|this| Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            storage,
            queue,
            manager: Mutex::new(manager),
            cache: Mutex::new(ObjectCache::new(cache_size, cache_size_bytes)),
            state: Mutex::new(ConnState {
                snapshot,
                accesses: 0,
                closed: false,
                pending: Pending::default(),
            }),
            gc_interval: gc_interval.max(1),
            full_invalidation: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    fn as_synchronizer(&self) -> Option<Arc<dyn Synchronizer>> {
        self.this.upgrade().map(|this| this as Arc<dyn Synchronizer>)
    }

    /// Binds the connection to `manager` and brings its snapshot up to date.
    pub(crate) fn reopen(&self, manager: Arc<TransactionManager>) {
        if let Some(synchronizer) = self.as_synchronizer() {
            manager.register_synchronizer(&synchronizer);
        }
        *self.manager.lock() = manager;
        self.state.lock().closed = false;
        self.poll_invalidations();
    }

    /// Detaches from the manager. Pending changes are discarded.
    pub(crate) fn release(&self) {
        let pending = std::mem::take(&mut self.state.lock().pending);
        let manager = Arc::clone(&*self.manager.lock());
        if pending.joined.is_some() {
            if pending.has_changes() {
                debug!(connection = self.id, objects = pending.registered.len(), "discarding uncommitted changes");
            }
            self.revert(pending);
            if let Err(e) = manager.abort() {
                debug!(connection = self.id, error = %e, "abort on release failed");
            }
        }
        if let Some(synchronizer) = self.as_synchronizer() {
            manager.unregister_synchronizer(&synchronizer);
        }
        self.state.lock().closed = true;
    }

    /// Drops every cached state at the next transaction boundary.
    pub(crate) fn request_full_invalidation(&self) {
        self.full_invalidation.store(true, Ordering::Release);
    }

    pub(crate) fn cache_detail(&self) -> CacheDetail {
        self.cache.lock().detail()
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.state.lock().closed {
            return Err(CoreError::connection_state("connection is closed"));
        }
        Ok(())
    }

    fn snapshot(&self) -> Tid {
        self.state.lock().snapshot
    }

    /// Reads `oid` as of the snapshot.
    fn load(&self, oid: Oid) -> CoreResult<(ClassInfo, Value, Tid, usize)> {
        self.ensure_open()?;
        let snapshot = self.snapshot();
        match self.storage.load_before(oid, snapshot.next())? {
            Some(revision) => {
                let (class, state) = decode_record(&revision.data)?;
                Ok((class, state, revision.tid, revision.data.len()))
            }
            None => {
                // Created after the snapshot, or never.
                let (_, actual) = self.storage.load(oid)?;
                Err(CoreError::ReadConflict {
                    oid,
                    expected: snapshot,
                    actual,
                })
            }
        }
    }

    fn count_access(&self) {
        let sweep = {
            let mut state = self.state.lock();
            state.accesses += 1;
            state.accesses % self.gc_interval == 0
        };
        if sweep {
            self.cache.lock().incrgc();
        }
    }

    fn host(&self) -> Weak<dyn ObjectHost> {
        let this: Weak<dyn ObjectHost> = self.this.clone();
        this
    }

    fn get(&self, oid: Oid) -> CoreResult<Arc<PersistentObject>> {
        self.ensure_open()?;
        if let Some(object) = self.cache.lock().get(oid) {
            self.count_access();
            return Ok(object);
        }
        let (class, state, tid, size) = self.load(oid)?;
        let loaded = PersistentObject::saved(class, oid, self.host(), self.id, state, tid, size);
        let object = {
            let mut cache = self.cache.lock();
            match cache.get(oid) {
                Some(existing) => existing,
                None => {
                    cache.insert(oid, &loaded);
                    loaded
                }
            }
        };
        self.count_access();
        Ok(object)
    }

    fn resolve(&self, value: &Value) -> CoreResult<Arc<PersistentObject>> {
        let reference = PersistentRef::from_value(value)?;
        let oid = Oid::new(reference.oid());
        match reference {
            PersistentRef::Classed { module, name, .. } => {
                self.ensure_open()?;
                let mut cache = self.cache.lock();
                if let Some(object) = cache.get(oid) {
                    return Ok(object);
                }
                let ghost = PersistentObject::ghost(ClassInfo::new(module, name), oid, self.host(), self.id);
                cache.insert(oid, &ghost);
                Ok(ghost)
            }
            PersistentRef::Bare(_) | PersistentRef::Weak(_) => self.get(oid),
        }
    }

    fn add(&self, object: &Arc<PersistentObject>) -> CoreResult<Oid> {
        self.ensure_open()?;
        if let Some(oid) = object.oid() {
            return match object.host_id() {
                Some(id) if id == self.id => Ok(oid),
                _ => Err(CoreError::invalid_reference(format!(
                    "{oid} belongs to another connection"
                ))),
            };
        }
        let oid = self.storage.new_oid()?;
        object.attach(oid, self.host(), self.id)?;
        self.cache.lock().insert(oid, object);
        self.state.lock().pending.added.insert(oid);
        self.register_object(object)?;
        trace!(connection = self.id, %oid, class = %object.class(), "added object");
        Ok(oid)
    }

    fn reference(&self, object: &Arc<PersistentObject>) -> CoreResult<Value> {
        let oid = self.add(object)?;
        let class = object.class();
        Ok(PersistentRef::Classed {
            oid: oid.to_bytes(),
            module: class.module.clone(),
            name: class.name.clone(),
        }
        .to_value())
    }

    /// Joins the current transaction once per transaction.
    fn join_current(&self) -> CoreResult<()> {
        let manager = Arc::clone(&*self.manager.lock());
        let txn = manager.get();
        if self.state.lock().pending.joined == Some(txn.id()) {
            return Ok(());
        }
        let this = self
            .this
            .upgrade()
            .ok_or_else(|| CoreError::connection_state("connection is gone"))?;
        txn.join(this as Arc<dyn DataManager>)?;
        self.state.lock().pending.joined = Some(txn.id());
        Ok(())
    }

    fn register_object(&self, object: &Arc<PersistentObject>) -> CoreResult<()> {
        self.ensure_open()?;
        let oid = object
            .oid()
            .ok_or_else(|| CoreError::invalid_reference("object has not been added"))?;
        if object.host_id() != Some(self.id) {
            return Err(CoreError::invalid_reference(format!(
                "{oid} belongs to another connection"
            )));
        }
        self.join_current()?;
        let mut state = self.state.lock();
        if state.pending.registered_oids.insert(oid) {
            state.pending.registered.push(Arc::clone(object));
        }
        Ok(())
    }

    fn read_current(&self, object: &Arc<PersistentObject>) -> CoreResult<()> {
        let oid = object
            .oid()
            .ok_or_else(|| CoreError::invalid_reference("object has not been added"))?;
        if object.host_id() != Some(self.id) {
            return Err(CoreError::invalid_reference(format!(
                "{oid} belongs to another connection"
            )));
        }
        object.activate()?;
        let serial = object.serial();
        self.join_current()?;
        self.state.lock().pending.read_current.insert(oid, serial);
        Ok(())
    }

    fn apply(&self, invalidations: &Invalidations) -> usize {
        let mut cache = self.cache.lock();
        match invalidations {
            Invalidations::Partial { oids, .. } => cache.invalidate(oids.iter()),
            Invalidations::Full { .. } => cache.invalidate_all(),
        }
    }

    pub(crate) fn poll_invalidations(&self) -> Invalidations {
        let snapshot = self.snapshot();
        let mut invalidations = self.queue.since(snapshot);
        if self.full_invalidation.swap(false, Ordering::AcqRel) {
            invalidations = Invalidations::Full {
                tid: invalidations.tid(),
            };
        }
        let count = self.apply(&invalidations);
        let mut state = self.state.lock();
        state.snapshot = state.snapshot.max(invalidations.tid());
        if count > 0 {
            trace!(connection = self.id, count, snapshot = %state.snapshot, "invalidated cached objects");
        }
        invalidations
    }

    /// Restores cached objects after an abort.
    fn revert(&self, pending: Pending) {
        let mut cache = self.cache.lock();
        for object in pending.registered {
            let Some(oid) = object.oid() else { continue };
            if pending.added.contains(&oid) {
                cache.remove(oid);
                object.detach();
            } else {
                object.ghostify();
                cache.insert(oid, &object);
            }
        }
    }
}

impl ObjectHost for ConnectionInner {
    fn host_id(&self) -> u64 {
        self.id
    }

    fn load_state(&self, oid: Oid) -> CoreResult<(Value, Tid, usize)> {
        let (_, state, tid, size) = self.load(oid)?;
        self.count_access();
        Ok((state, tid, size))
    }

    fn register(&self, object: &Arc<PersistentObject>) -> CoreResult<()> {
        self.register_object(object)
    }

    fn loaded(&self, oid: Oid) {
        self.cache.lock().pin(oid);
    }
}

impl Synchronizer for ConnectionInner {
    fn new_transaction(&self, _txn: &Transaction) {
        self.poll_invalidations();
    }
}

impl DataManager for ConnectionInner {
    fn sort_key(&self) -> String {
        self.storage.sort_key()
    }

    fn abort(&self, _txn: &Transaction) -> CoreResult<()> {
        let pending = std::mem::take(&mut self.state.lock().pending);
        self.revert(pending);
        Ok(())
    }

    fn tpc_begin(&self, txn: &Transaction) -> CoreResult<()> {
        self.storage.tpc_begin(&txn.meta())
    }

    fn commit(&self, txn: &Transaction) -> CoreResult<()> {
        let meta = txn.meta();
        let (objects, read_current) = {
            let state = self.state.lock();
            (
                state.pending.registered.clone(),
                state.pending.read_current.clone(),
            )
        };
        let mut stored = Vec::with_capacity(objects.len());
        let mut resolved = HashSet::new();
        for object in &objects {
            let (Some(oid), Some((state, serial))) = (object.oid(), object.changed_state()) else {
                continue;
            };
            let data = encode_record(object.class(), &state);
            let size = data.len();
            if self.storage.store(oid, serial, data, &meta)? == StoreOutcome::Resolved {
                resolved.insert(oid);
            }
            stored.push((oid, size));
        }
        for (oid, serial) in read_current {
            self.storage.check_current_serial(oid, serial, &meta)?;
        }
        debug!(connection = self.id, txn = txn.id(), objects = stored.len(), resolved = resolved.len(), "stored changes");
        let mut state = self.state.lock();
        state.pending.stored = stored;
        state.pending.resolved = resolved;
        Ok(())
    }

    fn tpc_vote(&self, txn: &Transaction) -> CoreResult<Option<Tid>> {
        self.storage.tpc_vote(&txn.meta())
    }

    fn tpc_finish(&self, txn: &Transaction, tid: Tid) -> CoreResult<Tid> {
        // The database observes the commit and queues its invalidations.
        let final_tid = self.storage.tpc_finish(&txn.meta(), tid, None)?;

        let (snapshot, pending) = {
            let mut state = self.state.lock();
            (state.snapshot, std::mem::take(&mut state.pending))
        };
        let sizes: HashMap<Oid, usize> = pending.stored.iter().copied().collect();
        let invalidations = self.queue.since(snapshot);
        let mut cache = self.cache.lock();
        for object in &pending.registered {
            let Some(oid) = object.oid() else { continue };
            if pending.resolved.contains(&oid) {
                object.ghostify();
                cache.insert(oid, object);
            } else if let Some(size) = sizes.get(&oid) {
                object.mark_saved(final_tid, *size);
                cache.touch(oid, object);
            }
        }
        match &invalidations {
            // Nothing committed after us: our own writes are current.
            Invalidations::Partial { tid, oids } if *tid == final_tid => {
                cache.invalidate(oids.iter().filter(|oid| !sizes.contains_key(oid)));
            }
            Invalidations::Partial { oids, .. } => {
                cache.invalidate(oids.iter());
            }
            Invalidations::Full { .. } => {
                cache.invalidate_all();
            }
        }
        drop(cache);

        let mut state = self.state.lock();
        state.snapshot = state.snapshot.max(invalidations.tid());
        Ok(final_tid)
    }

    fn tpc_abort(&self, txn: &Transaction) -> CoreResult<()> {
        let result = self.storage.tpc_abort(&txn.meta());
        DataManager::abort(self, txn)?;
        result
    }
}

/// A snapshot view of the database.
///
/// Obtained from [`crate::Database::open`]. Objects loaded through a
/// connection must not be handed to another connection.
///
/// Dropping a connection returns it to the database's pool, discarding any
/// uncommitted changes; [`Connection::close`] refuses to do that.
pub struct Connection {
    inner: Arc<ConnectionInner>,
    on_release: Option<Box<dyn FnOnce(Arc<ConnectionInner>) + Send>>,
}

impl Connection {
    pub(crate) fn new(
        inner: Arc<ConnectionInner>,
        on_release: Box<dyn FnOnce(Arc<ConnectionInner>) + Send>,
    ) -> Self {
        Self {
            inner,
            on_release: Some(on_release),
        }
    }

    /// The root object (OID 0).
    pub fn root(&self) -> CoreResult<Arc<PersistentObject>> {
        self.inner.get(Oid::ROOT)
    }

    /// The object with `oid`, from the cache or loaded as of the snapshot.
    pub fn get(&self, oid: Oid) -> CoreResult<Arc<PersistentObject>> {
        self.inner.get(oid)
    }

    /// Follows a persistent reference.
    pub fn resolve(&self, reference: &Value) -> CoreResult<Arc<PersistentObject>> {
        self.inner.resolve(reference)
    }

    /// Makes `object` persistent, allocating its OID.
    ///
    /// Adding an object that already belongs to this connection returns its
    /// OID; one that belongs to another connection is rejected.
    pub fn add(&self, object: &Arc<PersistentObject>) -> CoreResult<Oid> {
        self.inner.add(object)
    }

    /// Creates and adds an object.
    pub fn new_object(&self, class: ClassInfo, state: Value) -> CoreResult<Arc<PersistentObject>> {
        let object = PersistentObject::new(class, state);
        self.inner.add(&object)?;
        Ok(object)
    }

    /// A persistent reference to `object` for embedding in another state.
    /// New objects are added first.
    pub fn reference(&self, object: &Arc<PersistentObject>) -> CoreResult<Value> {
        self.inner.reference(object)
    }

    /// Marks `object` changed and queues it for the current transaction.
    pub fn register(&self, object: &Arc<PersistentObject>) -> CoreResult<()> {
        if object.host_id() != Some(self.inner.id) {
            return Err(CoreError::invalid_reference(
                "object does not belong to this connection",
            ));
        }
        object.update(|_| ())?;
        self.inner.register_object(object)
    }

    /// Fails the commit if `object` changes after it was read.
    pub fn read_current(&self, object: &Arc<PersistentObject>) -> CoreResult<()> {
        self.inner.read_current(object)
    }

    /// Moves the snapshot to the latest commit.
    pub fn sync(&self) -> Invalidations {
        self.inner.poll_invalidations()
    }

    /// Snapshot TID loads are made against.
    #[must_use]
    pub fn snapshot_tid(&self) -> Tid {
        self.inner.snapshot()
    }

    /// The transaction manager this connection joins.
    #[must_use]
    pub fn transaction_manager(&self) -> Arc<TransactionManager> {
        Arc::clone(&*self.inner.manager.lock())
    }

    /// The current transaction of this connection's manager.
    #[must_use]
    pub fn transaction(&self) -> Transaction {
        self.transaction_manager().get()
    }

    /// Commits the current transaction.
    pub fn commit(&self) -> CoreResult<Tid> {
        self.transaction_manager().commit()
    }

    /// Aborts the current transaction.
    pub fn abort(&self) -> CoreResult<()> {
        self.transaction_manager().abort()
    }

    /// True if objects are registered in the current transaction.
    #[must_use]
    pub fn has_pending_changes(&self) -> bool {
        self.inner.state.lock().pending.has_changes()
    }

    /// Evicts least recently used objects down to the cache targets.
    pub fn cache_gc(&self) -> usize {
        self.inner.cache.lock().incrgc()
    }

    /// Evicts every object the application no longer holds.
    pub fn cache_minimize(&self) -> usize {
        self.inner.cache.lock().minimize()
    }

    /// Cache statistics.
    #[must_use]
    pub fn cache_detail(&self) -> CacheDetail {
        self.inner.cache_detail()
    }

    pub(crate) fn cached_objects(&self) -> usize {
        self.inner.cache.lock().len()
    }

    /// Returns the connection to the pool.
    pub fn close(mut self) -> CoreResult<()> {
        if self.has_pending_changes() {
            return Err(CoreError::connection_state(
                "cannot close a connection with uncommitted changes",
            ));
        }
        if let Some(on_release) = self.on_release.take() {
            on_release(Arc::clone(&self.inner));
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(on_release) = self.on_release.take() {
            on_release(Arc::clone(&self.inner));
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("snapshot", &self.inner.snapshot())
            .field("cached", &self.cached_objects())
            .finish()
    }
}
