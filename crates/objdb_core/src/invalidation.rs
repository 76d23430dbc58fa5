//! Recent-commit ring used to bring connection snapshots up to date.

use crate::types::{Oid, Tid};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

/// What a connection must drop from its cache to catch up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidations {
    /// Only these objects changed between the snapshot and `tid`.
    Partial {
        /// New snapshot.
        tid: Tid,
        /// Changed objects.
        oids: HashSet<Oid>,
    },
    /// The snapshot is older than the ring; everything may be stale.
    Full {
        /// New snapshot.
        tid: Tid,
    },
}

impl Invalidations {
    /// Snapshot the connection moves to.
    #[must_use]
    pub fn tid(&self) -> Tid {
        match self {
            Self::Partial { tid, .. } | Self::Full { tid } => *tid,
        }
    }
}

#[derive(Debug)]
struct Ring {
    entries: VecDeque<(Tid, Arc<HashSet<Oid>>)>,
    last_tid: Tid,
    /// Snapshots strictly older than this cannot be caught up partially.
    horizon: Tid,
}

/// Bounded queue of `(tid, changed oids)` for the most recent commits.
#[derive(Debug)]
pub struct InvalidationQueue {
    ring: Mutex<Ring>,
    capacity: usize,
}

impl InvalidationQueue {
    /// Creates a queue starting at `last_tid` and keeping `capacity` commits.
    #[must_use]
    pub fn new(last_tid: Tid, capacity: usize) -> Self {
        Self {
            ring: Mutex::new(Ring {
                entries: VecDeque::with_capacity(capacity),
                last_tid,
                horizon: last_tid,
            }),
            capacity,
        }
    }

    /// Records a commit. Commits at or before the newest entry are ignored.
    pub fn push(&self, tid: Tid, oids: impl IntoIterator<Item = Oid>) {
        let mut ring = self.ring.lock();
        if tid <= ring.last_tid {
            return;
        }
        ring.entries.push_back((tid, Arc::new(oids.into_iter().collect())));
        ring.last_tid = tid;
        while ring.entries.len() > self.capacity {
            if let Some((dropped, _)) = ring.entries.pop_front() {
                ring.horizon = dropped;
            }
        }
    }

    /// Changes needed to move a snapshot taken at `snapshot` to the newest TID.
    #[must_use]
    pub fn since(&self, snapshot: Tid) -> Invalidations {
        let ring = self.ring.lock();
        if snapshot < ring.horizon {
            return Invalidations::Full { tid: ring.last_tid };
        }
        let mut oids = HashSet::new();
        for (tid, changed) in ring.entries.iter().rev() {
            if *tid <= snapshot {
                break;
            }
            oids.extend(changed.iter().copied());
        }
        Invalidations::Partial {
            tid: ring.last_tid,
            oids,
        }
    }

    /// Forgets every entry so all snapshots need a full invalidation.
    pub fn invalidate_all(&self, tid: Tid) {
        let mut ring = self.ring.lock();
        ring.entries.clear();
        ring.last_tid = ring.last_tid.max(tid);
        ring.horizon = ring.last_tid;
    }

    /// Newest TID seen.
    #[must_use]
    pub fn last_tid(&self) -> Tid {
        self.ring.lock().last_tid
    }

    /// Number of commits held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.lock().entries.len()
    }

    /// True if no commits are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
