//! Persistent objects.
//!
//! ```text
//!        load            update
//!  Ghost ─────→ Saved ─────────→ Changed
//!    ↑            │                  │
//!    └ invalidate ┘                  │ commit
//!    └──────── evict ←──────── Saved ┘
//! ```
//!
//! An object not yet added to a connection is [`ObjectStatus::New`].

use crate::error::{CoreError, CoreResult};
use crate::serialize::ClassInfo;
use crate::types::{Oid, Tid};
use objdb_codec::Value;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Connection-side services an object needs.
pub(crate) trait ObjectHost: Send + Sync {
    /// Identifies the host, to catch objects used across connections.
    fn host_id(&self) -> u64;

    /// Loads the state of `oid` as of the host's snapshot.
    fn load_state(&self, oid: Oid) -> CoreResult<(Value, Tid, usize)>;

    /// Queues a changed object for the current transaction.
    fn register(&self, object: &Arc<PersistentObject>) -> CoreResult<()>;

    /// Called once a ghost has taken on the state of `oid`.
    fn loaded(&self, _oid: Oid) {}
}

/// Observable status of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectStatus {
    /// Not yet added to a connection.
    New,
    /// State not loaded.
    Ghost,
    /// State loaded and unchanged.
    Saved,
    /// Modified in the current transaction.
    Changed,
}

#[derive(Debug, Clone)]
pub(crate) enum ObjectState {
    Ghost,
    Saved { state: Value, tid: Tid, size: usize },
    Changed { state: Value, original: Tid },
}

#[derive(Clone)]
struct Identity {
    oid: Oid,
    host: Weak<dyn ObjectHost>,
    host_id: u64,
}

/// An object stored in the database.
///
/// Obtain objects from a [`crate::Connection`] (`root`, `get`,
/// `new_object`) or create them with [`PersistentObject::new`] and add them.
pub struct PersistentObject {
    class: ClassInfo,
    identity: Mutex<Option<Identity>>,
    state: Mutex<ObjectState>,
}

impl PersistentObject {
    /// Creates an object that is not yet stored anywhere.
    #[must_use]
    pub fn new(class: ClassInfo, state: Value) -> Arc<Self> {
        Arc::new(Self {
            class,
            identity: Mutex::new(None),
            state: Mutex::new(ObjectState::Changed {
                state,
                original: Tid::ZERO,
            }),
        })
    }

    pub(crate) fn ghost(class: ClassInfo, oid: Oid, host: Weak<dyn ObjectHost>, host_id: u64) -> Arc<Self> {
        Arc::new(Self {
            class,
            identity: Mutex::new(Some(Identity { oid, host, host_id })),
            state: Mutex::new(ObjectState::Ghost),
        })
    }

    pub(crate) fn saved(
        class: ClassInfo,
        oid: Oid,
        host: Weak<dyn ObjectHost>,
        host_id: u64,
        state: Value,
        tid: Tid,
        size: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            class,
            identity: Mutex::new(Some(Identity { oid, host, host_id })),
            state: Mutex::new(ObjectState::Saved { state, tid, size }),
        })
    }

    /// Class identity.
    #[must_use]
    pub fn class(&self) -> &ClassInfo {
        &self.class
    }

    /// OID, once added.
    #[must_use]
    pub fn oid(&self) -> Option<Oid> {
        self.identity.lock().as_ref().map(|id| id.oid)
    }

    pub(crate) fn host_id(&self) -> Option<u64> {
        self.identity.lock().as_ref().map(|id| id.host_id)
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ObjectStatus {
        if self.identity.lock().is_none() {
            return ObjectStatus::New;
        }
        match &*self.state.lock() {
            ObjectState::Ghost => ObjectStatus::Ghost,
            ObjectState::Saved { .. } => ObjectStatus::Saved,
            ObjectState::Changed { .. } => ObjectStatus::Changed,
        }
    }

    /// TID of the revision the state is based on (zero if never stored
    /// or not loaded).
    #[must_use]
    pub fn serial(&self) -> Tid {
        match &*self.state.lock() {
            ObjectState::Ghost => Tid::ZERO,
            ObjectState::Saved { tid, .. } => *tid,
            ObjectState::Changed { original, .. } => *original,
        }
    }

    /// Payload size of the loaded state, 0 for ghosts and unsaved changes.
    #[must_use]
    pub fn estimated_size(&self) -> usize {
        match &*self.state.lock() {
            ObjectState::Saved { size, .. } => *size,
            _ => 0,
        }
    }

    fn host(&self) -> CoreResult<Option<Arc<dyn ObjectHost>>> {
        match self.identity.lock().as_ref() {
            None => Ok(None),
            Some(identity) => identity.host.upgrade().map(Some).ok_or_else(|| {
                CoreError::connection_state(format!(
                    "the connection that loaded {} is closed",
                    identity.oid
                ))
            }),
        }
    }

    /// Loads the state of a ghost.
    pub fn activate(&self) -> CoreResult<()> {
        if !matches!(*self.state.lock(), ObjectState::Ghost) {
            return Ok(());
        }
        let (Some(host), Some(oid)) = (self.host()?, self.oid()) else {
            return Ok(());
        };
        let (state, tid, size) = host.load_state(oid)?;
        let activated = {
            let mut current = self.state.lock();
            let ghost = matches!(*current, ObjectState::Ghost);
            if ghost {
                *current = ObjectState::Saved { state, tid, size };
            }
            ghost
        };
        if activated {
            host.loaded(oid);
        }
        Ok(())
    }

    /// A copy of the object's state, loading it if needed.
    pub fn state(&self) -> CoreResult<Value> {
        self.activate()?;
        match &*self.state.lock() {
            ObjectState::Saved { state, .. } | ObjectState::Changed { state, .. } => Ok(state.clone()),
            ObjectState::Ghost => Err(CoreError::connection_state(
                "object was invalidated while loading",
            )),
        }
    }

    /// Reads a single attribute of a map state.
    pub fn get(&self, key: &str) -> CoreResult<Option<Value>> {
        Ok(self.state()?.get(key).cloned())
    }

    /// Mutates the state in place and registers the change.
    pub fn update<R>(self: &Arc<Self>, change: impl FnOnce(&mut Value) -> R) -> CoreResult<R> {
        self.activate()?;
        let (result, newly_changed) = {
            let mut current = self.state.lock();
            let (state, original, newly_changed) =
                match std::mem::replace(&mut *current, ObjectState::Ghost) {
                    ObjectState::Saved { state, tid, .. } => (state, tid, true),
                    ObjectState::Changed { state, original } => (state, original, false),
                    ObjectState::Ghost => {
                        return Err(CoreError::connection_state(
                            "object was invalidated while loading",
                        ))
                    }
                };
            let mut state = state;
            let result = change(&mut state);
            *current = ObjectState::Changed { state, original };
            (result, newly_changed)
        };
        if newly_changed {
            if let Some(host) = self.host()? {
                host.register(self)?;
            }
        }
        Ok(result)
    }

    /// Replaces the whole state.
    pub fn set_state(self: &Arc<Self>, state: Value) -> CoreResult<()> {
        self.update(|current| *current = state)
    }

    /// Sets one attribute of a map state.
    pub fn set(self: &Arc<Self>, key: &str, value: Value) -> CoreResult<()> {
        self.update(|state| {
            state.insert(key, value);
        })
    }

    /// Binds a new object to a host.
    pub(crate) fn attach(&self, oid: Oid, host: Weak<dyn ObjectHost>, host_id: u64) -> CoreResult<()> {
        let mut identity = self.identity.lock();
        match identity.as_ref() {
            Some(existing) if existing.host_id == host_id => Ok(()),
            Some(existing) => Err(CoreError::invalid_reference(format!(
                "{} belongs to another connection",
                existing.oid
            ))),
            None => {
                *identity = Some(Identity { oid, host, host_id });
                Ok(())
            }
        }
    }

    /// Unbinds an object that was added in an aborted transaction.
    pub(crate) fn detach(&self) {
        *self.identity.lock() = None;
    }

    /// Changed state and its base TID, for commit.
    pub(crate) fn changed_state(&self) -> Option<(Value, Tid)> {
        match &*self.state.lock() {
            ObjectState::Changed { state, original } => Some((state.clone(), *original)),
            _ => None,
        }
    }

    /// Marks committed changes as saved at `tid`.
    pub(crate) fn mark_saved(&self, tid: Tid, size: usize) {
        let mut current = self.state.lock();
        if let ObjectState::Changed { state, .. } = std::mem::replace(&mut *current, ObjectState::Ghost) {
            *current = ObjectState::Saved {
                state,
                tid,
                size,
            };
        }
    }

    /// Drops loaded or changed state.
    pub(crate) fn ghostify(&self) {
        *self.state.lock() = ObjectState::Ghost;
    }

    /// Turns a saved object into a ghost. Changed objects and objects whose
    /// lock is held elsewhere are left alone.
    pub(crate) fn try_ghostify(&self) -> bool {
        match self.state.try_lock() {
            Some(mut state) if matches!(*state, ObjectState::Saved { .. }) => {
                *state = ObjectState::Ghost;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn is_changed(&self) -> bool {
        matches!(*self.state.lock(), ObjectState::Changed { .. })
    }
}

impl std::fmt::Debug for PersistentObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentObject")
            .field("class", &self.class)
            .field("oid", &self.oid())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeHost {
        loads: AtomicUsize,
        registered: Mutex<Vec<Oid>>,
    }

    impl ObjectHost for FakeHost {
        fn host_id(&self) -> u64 {
            7
        }
        fn load_state(&self, oid: Oid) -> CoreResult<(Value, Tid, usize)> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok((Value::Integer(oid.as_u64() as i64), Tid::from_u64(3), 9))
        }
        fn register(&self, object: &Arc<PersistentObject>) -> CoreResult<()> {
            self.registered.lock().push(object.oid().unwrap_or_default());
            Ok(())
        }
    }

    fn host() -> Arc<FakeHost> {
        Arc::new(FakeHost {
            loads: AtomicUsize::new(0),
            registered: Mutex::new(Vec::new()),
        })
    }

    fn ghost_of(host: &Arc<FakeHost>, oid: u64) -> Arc<PersistentObject> {
        let dyn_host: Arc<dyn ObjectHost> = host.clone();
        PersistentObject::ghost(
            ClassInfo::new("tests", "Thing"),
            Oid::from_u64(oid),
            Arc::downgrade(&dyn_host),
            7,
        )
    }

    #[test]
    fn ghost_loads_on_access() {
        let host = host();
        let object = ghost_of(&host, 5);
        assert_eq!(object.status(), ObjectStatus::Ghost);
        assert_eq!(object.state().unwrap(), Value::Integer(5));
        assert_eq!(object.status(), ObjectStatus::Saved);
        assert_eq!(object.serial(), Tid::from_u64(3));
        object.state().unwrap();
        assert_eq!(host.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn update_registers_once() {
        let host = host();
        let object = ghost_of(&host, 5);
        object.set_state(Value::Integer(6)).unwrap();
        object.update(|state| *state = Value::Integer(7)).unwrap();
        assert_eq!(object.status(), ObjectStatus::Changed);
        assert_eq!(object.serial(), Tid::from_u64(3));
        assert_eq!(host.registered.lock().clone(), vec![Oid::from_u64(5)]);

        object.mark_saved(Tid::from_u64(9), 4);
        assert_eq!(object.status(), ObjectStatus::Saved);
        assert_eq!(object.serial(), Tid::from_u64(9));
        assert_eq!(object.estimated_size(), 4);
    }

    #[test]
    fn try_ghostify_spares_changes() {
        let host = host();
        let object = ghost_of(&host, 1);
        object.activate().unwrap();
        assert!(object.try_ghostify());
        object.set_state(Value::Null).unwrap();
        assert!(!object.try_ghostify());
        assert!(object.is_changed());
    }

    #[test]
    fn closed_host_is_reported() {
        let host = host();
        let object = ghost_of(&host, 1);
        drop(host);
        assert!(matches!(
            object.state(),
            Err(CoreError::ConnectionState { .. })
        ));
    }

    #[test]
    fn new_objects_attach_once() {
        let host = host();
        let dyn_host: Arc<dyn ObjectHost> = host.clone();
        let object = PersistentObject::new(ClassInfo::new("tests", "Thing"), Value::empty_map());
        assert_eq!(object.status(), ObjectStatus::New);
        object.set("a", Value::Integer(1)).unwrap();
        object.attach(Oid::from_u64(2), Arc::downgrade(&dyn_host), 7).unwrap();
        assert_eq!(object.status(), ObjectStatus::Changed);
        assert!(object.attach(Oid::from_u64(2), Arc::downgrade(&dyn_host), 7).is_ok());
        assert!(matches!(
            object.attach(Oid::from_u64(2), Arc::downgrade(&dyn_host), 8),
            Err(CoreError::InvalidObjectReference { .. })
        ));
        assert_eq!(object.get("a").unwrap(), Some(Value::Integer(1)));
    }
}
