//! # objdb testkit
//!
//! Test utilities for objdb.
//!
//! This crate provides:
//! - Fixtures: temporary file storages and databases
//! - Property-based strategies using proptest
//! - Crash helpers that damage a data file the way an interrupted write would
//! - A model of expected object contents for cross-checking a storage
//!
//! The end-to-end scenarios live under `tests/`.
//!
//! ## Usage
//!
//! ```rust
//! use objdb_testkit::prelude::*;
//!
//! let fixture = TestStorage::new();
//! let oid = fixture.storage.new_oid().unwrap();
//! let tid = commit_one(&*fixture.storage, oid, Tid::ZERO, b"A".to_vec()).unwrap();
//! assert_eq!(fixture.storage.load(oid).unwrap(), (b"A".to_vec(), tid));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod integration;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
    pub use objdb_core::{Oid, Storage, Tid};
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use integration::*;
