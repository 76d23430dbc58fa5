//! Storage and database configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Options for opening a [`crate::FileStorage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data file path. `None` keeps the log in memory.
    pub path: Option<PathBuf>,

    /// Whether to create the data file if it does not exist.
    pub create: bool,

    /// Opens the storage read-only; mutations fail with `ReadOnly`.
    pub read_only: bool,

    /// Maximum file size in bytes. Commits that would grow past it fail.
    pub quota: Option<u64>,

    /// Whether pack removes unreachable objects entirely.
    pub pack_gc: bool,

    /// Whether to fsync at vote and finish.
    pub sync_on_commit: bool,

    /// How long `tpc_begin` waits for another transaction to release the
    /// commit slot. `None` waits forever.
    pub commit_lock_timeout: Option<Duration>,

    /// Whether to write the index sidecar on close and after pack.
    pub save_index: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: None,
            create: false,
            read_only: false,
            quota: None,
            pack_gc: true,
            sync_on_commit: true,
            commit_lock_timeout: None,
            save_index: true,
        }
    }
}

impl StorageConfig {
    /// Creates a configuration for the data file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Creates a configuration for an in-memory log.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Sets whether to create the file if missing.
    #[must_use]
    pub const fn create(mut self, value: bool) -> Self {
        self.create = value;
        self
    }

    /// Sets read-only mode.
    #[must_use]
    pub const fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Sets the file size quota.
    #[must_use]
    pub const fn quota(mut self, bytes: u64) -> Self {
        self.quota = Some(bytes);
        self
    }

    /// Sets whether pack collects unreachable objects.
    #[must_use]
    pub const fn pack_gc(mut self, value: bool) -> Self {
        self.pack_gc = value;
        self
    }

    /// Sets whether commits fsync.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the commit slot wait timeout.
    #[must_use]
    pub const fn commit_lock_timeout(mut self, timeout: Duration) -> Self {
        self.commit_lock_timeout = Some(timeout);
        self
    }

    /// Sets whether the index sidecar is saved.
    #[must_use]
    pub const fn save_index(mut self, value: bool) -> Self {
        self.save_index = value;
        self
    }
}

/// Options for a [`crate::Database`] handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Idle connections kept for reuse. Opening more logs a warning.
    pub pool_size: usize,

    /// Target number of non-ghost objects per connection cache.
    pub cache_size: usize,

    /// Target payload bytes per connection cache (0 = unbounded).
    pub cache_size_bytes: usize,

    /// Object accesses between opportunistic cache sweeps.
    pub cache_gc_interval: usize,

    /// Commits remembered by the invalidation queue.
    pub invalidation_history: usize,

    /// Wall-clock limit for a commit. `None` disables it.
    pub commit_timeout: Option<Duration>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            pool_size: 7,
            cache_size: 400,
            cache_size_bytes: 0,
            cache_gc_interval: 100,
            invalidation_history: 100,
            commit_timeout: None,
        }
    }
}

impl DatabaseConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the connection pool size.
    #[must_use]
    pub const fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Sets the per-connection object count target.
    #[must_use]
    pub const fn cache_size(mut self, objects: usize) -> Self {
        self.cache_size = objects;
        self
    }

    /// Sets the per-connection byte target.
    #[must_use]
    pub const fn cache_size_bytes(mut self, bytes: usize) -> Self {
        self.cache_size_bytes = bytes;
        self
    }

    /// Sets the sweep interval.
    #[must_use]
    pub const fn cache_gc_interval(mut self, accesses: usize) -> Self {
        self.cache_gc_interval = accesses;
        self
    }

    /// Sets how many commits the invalidation queue remembers.
    #[must_use]
    pub const fn invalidation_history(mut self, commits: usize) -> Self {
        self.invalidation_history = commits;
        self
    }

    /// Sets the commit timeout.
    #[must_use]
    pub const fn commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = Some(timeout);
        self
    }
}
