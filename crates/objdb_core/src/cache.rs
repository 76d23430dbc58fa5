//! Per-connection object cache.
//!
//! Every object a connection hands out is registered here by OID, so the
//! connection never has two live objects for one OID. Non-ghost objects are
//! held strongly and kept in LRU order; ghosts are held weakly and vanish
//! when the application drops them.
//!
//! Eviction turns a saved object back into a ghost. It only touches objects
//! the application no longer holds; changed objects are never evicted.

use crate::object::{ObjectStatus, PersistentObject};
use crate::types::Oid;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use tracing::trace;

struct Entry {
    object: Weak<PersistentObject>,
    strong: Option<Arc<PersistentObject>>,
    tick: u64,
}

/// Cache statistics for one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheDetail {
    /// Objects registered (ghosts included).
    pub objects: usize,
    /// Objects with loaded or changed state.
    pub non_ghost: usize,
    /// Payload bytes of saved objects.
    pub estimated_bytes: usize,
    /// Target number of non-ghost objects.
    pub target_objects: usize,
    /// Target bytes (0 = unbounded).
    pub target_bytes: usize,
}

pub(crate) struct ObjectCache {
    entries: HashMap<Oid, Entry>,
    lru: BTreeMap<u64, Oid>,
    tick: u64,
    target_objects: usize,
    target_bytes: usize,
}

impl ObjectCache {
    pub(crate) fn new(target_objects: usize, target_bytes: usize) -> Self {
        Self {
            entries: HashMap::new(),
            lru: BTreeMap::new(),
            tick: 0,
            target_objects,
            target_bytes,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Looks an object up, marking it recently used.
    pub(crate) fn get(&mut self, oid: Oid) -> Option<Arc<PersistentObject>> {
        let object = self.entries.get(&oid)?.object.upgrade();
        match object {
            Some(object) => {
                self.touch(oid, &object);
                Some(object)
            }
            None => {
                self.remove(oid);
                None
            }
        }
    }

    /// Registers `object` under `oid`, replacing any dead entry.
    pub(crate) fn insert(&mut self, oid: Oid, object: &Arc<PersistentObject>) {
        self.remove(oid);
        let tick = self.next_tick();
        let strong = (object.status() != ObjectStatus::Ghost).then(|| Arc::clone(object));
        self.entries.insert(
            oid,
            Entry {
                object: Arc::downgrade(object),
                strong,
                tick,
            },
        );
        self.lru.insert(tick, oid);
    }

    /// Moves `oid` to the young end and pins it if it now has state.
    pub(crate) fn touch(&mut self, oid: Oid, object: &Arc<PersistentObject>) {
        let tick = self.next_tick();
        if let Some(entry) = self.entries.get_mut(&oid) {
            self.lru.remove(&entry.tick);
            entry.tick = tick;
            if entry.strong.is_none() && object.status() != ObjectStatus::Ghost {
                entry.strong = Some(Arc::clone(object));
            }
            self.lru.insert(tick, oid);
        }
    }

    /// Re-pins a registered object that loaded its own state.
    pub(crate) fn pin(&mut self, oid: Oid) -> bool {
        let Some(object) = self.entries.get(&oid).and_then(|entry| entry.object.upgrade()) else {
            return false;
        };
        self.touch(oid, &object);
        true
    }

    pub(crate) fn remove(&mut self, oid: Oid) -> Option<Arc<PersistentObject>> {
        let entry = self.entries.remove(&oid)?;
        self.lru.remove(&entry.tick);
        entry.object.upgrade()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Ghostifies saved objects in `oids`. Changed objects keep their state.
    pub(crate) fn invalidate<'a>(&mut self, oids: impl IntoIterator<Item = &'a Oid>) -> usize {
        let mut count = 0;
        for oid in oids {
            let Some(entry) = self.entries.get_mut(oid) else {
                continue;
            };
            let Some(object) = entry.object.upgrade() else {
                continue;
            };
            if object.is_changed() {
                continue;
            }
            object.ghostify();
            entry.strong = None;
            count += 1;
        }
        count
    }

    /// Ghostifies every saved object.
    pub(crate) fn invalidate_all(&mut self) -> usize {
        let oids: Vec<Oid> = self.entries.keys().copied().collect();
        self.invalidate(oids.iter())
    }

    fn usage(&self) -> (usize, usize) {
        let mut non_ghost = 0;
        let mut bytes = 0;
        for entry in self.entries.values() {
            if let Some(strong) = &entry.strong {
                non_ghost += 1;
                bytes += strong.estimated_size();
            }
        }
        (non_ghost, bytes)
    }

    fn over_target(&self, non_ghost: usize, bytes: usize) -> bool {
        non_ghost > self.target_objects || (self.target_bytes > 0 && bytes > self.target_bytes)
    }

    /// Evicts least recently used objects until the cache is within target.
    pub(crate) fn incrgc(&mut self) -> usize {
        let (mut non_ghost, mut bytes) = self.usage();
        if !self.over_target(non_ghost, bytes) {
            return 0;
        }
        let oldest: Vec<Oid> = self.lru.values().copied().collect();
        let mut evicted = 0;
        for oid in oldest {
            if !self.over_target(non_ghost, bytes) {
                break;
            }
            if let Some(size) = self.evict(oid) {
                non_ghost -= 1;
                bytes = bytes.saturating_sub(size);
                evicted += 1;
            }
        }
        trace!(evicted, non_ghost, bytes, "cache sweep");
        evicted
    }

    /// Evicts every object the application does not hold.
    pub(crate) fn minimize(&mut self) -> usize {
        let oids: Vec<Oid> = self.lru.values().copied().collect();
        oids.into_iter().filter(|oid| self.evict(*oid).is_some()).count()
    }

    /// Ghostifies and unpins one object. Returns its former size.
    fn evict(&mut self, oid: Oid) -> Option<usize> {
        let entry = self.entries.get_mut(&oid)?;
        let strong = entry.strong.as_ref()?;
        // Only the cache's own reference may remain.
        if Arc::strong_count(strong) != 1 {
            return None;
        }
        let size = strong.estimated_size();
        if !strong.try_ghostify() {
            return None;
        }
        entry.strong = None;
        // The weak link is now dead.
        self.remove(oid);
        Some(size)
    }

    pub(crate) fn detail(&self) -> CacheDetail {
        let (non_ghost, estimated_bytes) = self.usage();
        CacheDetail {
            objects: self.entries.len(),
            non_ghost,
            estimated_bytes,
            target_objects: self.target_objects,
            target_bytes: self.target_bytes,
        }
    }
}
