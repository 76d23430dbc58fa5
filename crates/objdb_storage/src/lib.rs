//! # objdb storage
//!
//! Byte-store backends for the objdb file storage.
//!
//! Backends are **opaque byte stores**: they know nothing about
//! transaction blocks, data records or object payloads. The file storage
//! in `objdb_core` owns all format interpretation.
//!
//! ## Design Principles
//!
//! - Backends are simple byte stores (read, append, patch, flush, truncate)
//! - In-place writes exist only so a committed status byte can be flipped
//!   after the transaction body is durable
//! - Must be `Send + Sync` for concurrent readers
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral storages
//! - [`FileBackend`] - For persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use objdb_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"hello world").unwrap();
//! let data = backend.read_at(offset, 11).unwrap();
//! assert_eq!(&data, b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
