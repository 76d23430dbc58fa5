//! # objdb core
//!
//! Transactional, multi-version object database engine.
//!
//! This crate provides:
//! - An append-only file storage with crash recovery, pack and undo
//! - A two-phase commit coordinator with transaction managers
//! - Snapshot-isolated connections with per-connection object caches
//! - Application-level conflict resolution by class
//!
//! ## Layers
//!
//! ```text
//! Database ── pool of Connections ── ObjectCache ── PersistentObject
//!    │               │
//!    │               └── joins Transactions (two-phase commit)
//!    │
//!    └── InvalidationQueue ←── commit notifications ── Storage (FileStorage)
//! ```
//!
//! ## Example
//!
//! ```
//! use objdb_core::{FileStorage, Oid, Storage, Tid, TransactionMeta};
//!
//! let storage = FileStorage::open_in_memory().unwrap();
//! let txn = TransactionMeta::new().user("alice");
//! let oid = storage.new_oid().unwrap();
//!
//! storage.tpc_begin(&txn).unwrap();
//! storage.store(oid, Tid::ZERO, b"payload".to_vec(), &txn).unwrap();
//! let proposed = storage.tpc_vote(&txn).unwrap().unwrap();
//! let tid = storage.tpc_finish(&txn, proposed, None).unwrap();
//!
//! assert_eq!(storage.load(oid).unwrap(), (b"payload".to_vec(), tid));
//! assert_eq!(Oid::ROOT.as_u64(), 0);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod config;
mod conflict;
mod connection;
mod db;
mod error;
pub mod filestorage;
mod invalidation;
mod object;
pub mod serialize;
mod storage;
mod timestamp;
pub mod transaction;
mod types;

pub use cache::CacheDetail;
pub use config::{DatabaseConfig, StorageConfig};
pub use conflict::{ConflictInput, ConflictResolvers, ResolverFn};
pub use connection::Connection;
pub use db::{Database, LastTransaction};
pub use error::{CoreError, CoreResult};
pub use filestorage::{verify_file, FileStorage, PackResult, TransactionIterator, TxnStatus, VerifyReport};
pub use invalidation::{InvalidationQueue, Invalidations};
pub use object::{ObjectStatus, PersistentObject};
pub use serialize::ClassInfo;
pub use storage::{
    DataRecord, HistoryEntry, LoadedRevision, ReferencesFn, Storage, StorageObserver, StoreOutcome,
    TransactionMeta, TransactionRecord, TransactionStream, UndoInfo,
};
pub use timestamp::{tid_before_now, tid_from_system_time, TidAllocator, TimeStamp};
pub use transaction::{
    DataManager, Synchronizer, Transaction, TransactionManager, TransactionStatus,
};
pub use types::{Oid, Tid};

pub use objdb_codec::{PersistentRef, Value};
