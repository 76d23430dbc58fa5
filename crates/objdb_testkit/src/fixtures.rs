//! Test fixtures and storage helpers.
//!
//! Provides temporary file storages and databases that clean up after
//! themselves, plus one-call commit helpers for driving the two-phase
//! protocol directly against a storage.

use objdb_codec::Value;
use objdb_core::serialize::{encode_record, ClassInfo};
use objdb_core::{
    CoreResult, Database, DatabaseConfig, FileStorage, Oid, Storage, StorageConfig, Tid,
    TransactionMeta,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// File name used for data files inside fixture directories.
pub const DATA_FILE: &str = "data.fs";

/// A file storage in a temporary directory.
pub struct TestStorage {
    /// The storage.
    pub storage: Arc<FileStorage>,
    path: PathBuf,
    // Kept alive so the directory outlives the storage.
    _dir: TempDir,
}

impl TestStorage {
    /// Creates an empty storage with default options.
    pub fn new() -> Self {
        Self::with_config(|config| config)
    }

    /// Creates an empty storage, letting `configure` adjust the options.
    pub fn with_config(configure: impl FnOnce(StorageConfig) -> StorageConfig) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let path = dir.path().join(DATA_FILE);
        let config = configure(StorageConfig::new(&path).create(true));
        let storage = FileStorage::open(config).expect("Failed to open file storage");
        Self {
            storage: Arc::new(storage),
            path,
            _dir: dir,
        }
    }

    /// Path of the data file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Closes the storage and opens the same file again.
    pub fn reopen(&mut self) -> CoreResult<()> {
        self.storage.close()?;
        self.storage = Arc::new(FileStorage::open(StorageConfig::new(&self.path))?);
        Ok(())
    }
}

impl Default for TestStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestStorage {
    type Target = FileStorage;

    fn deref(&self) -> &Self::Target {
        &self.storage
    }
}

/// A database over a temporary file storage.
pub struct TestDatabase {
    /// The database handle.
    pub db: Database,
    path: PathBuf,
    _dir: TempDir,
}

impl TestDatabase {
    /// Opens a database with default options.
    pub fn new() -> Self {
        Self::with_config(DatabaseConfig::default())
    }

    /// Opens a database with `config`.
    pub fn with_config(config: DatabaseConfig) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let path = dir.path().join(DATA_FILE);
        let db = Database::open_file(StorageConfig::new(&path).create(true), config)
            .expect("Failed to open database");
        Self {
            db,
            path,
            _dir: dir,
        }
    }

    /// Path of the data file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for TestDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestDatabase {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// Runs `f` against a fresh database.
pub fn with_temp_db<F, R>(f: F) -> R
where
    F: FnOnce(&Database) -> R,
{
    let fixture = TestDatabase::new();
    f(&fixture.db)
}

/// Class used for test objects.
pub fn leaf_class() -> ClassInfo {
    ClassInfo::new("objdb.testing", "Leaf")
}

/// Encodes `state` as a record of the test class.
pub fn leaf_record(state: &Value) -> Vec<u8> {
    encode_record(&leaf_class(), state)
}

/// Commits one store of `data` to `oid` and returns the transaction TID.
pub fn commit_one(storage: &dyn Storage, oid: Oid, expected: Tid, data: Vec<u8>) -> CoreResult<Tid> {
    commit_many(storage, vec![(oid, expected, data)])
}

/// Commits several stores in a single transaction.
///
/// On failure the transaction is aborted before the error is returned.
pub fn commit_many(storage: &dyn Storage, writes: Vec<(Oid, Tid, Vec<u8>)>) -> CoreResult<Tid> {
    let txn = TransactionMeta::new();
    storage.tpc_begin(&txn)?;
    let result = writes
        .into_iter()
        .try_for_each(|(oid, expected, data)| storage.store(oid, expected, data, &txn).map(|_| ()))
        .and_then(|()| storage.tpc_vote(&txn))
        .and_then(|proposed| storage.tpc_finish(&txn, proposed.unwrap_or(Tid::ZERO), None));
    if result.is_err() {
        storage.tpc_abort(&txn)?;
    }
    result
}
