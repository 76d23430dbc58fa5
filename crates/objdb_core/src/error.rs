//! Error types for the objdb engine.

use crate::types::{Oid, Tid};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by storages, the transaction coordinator and connections.
///
/// Variants fall into four groups:
///
/// - *transient* ([`CoreError::is_transient`]): the transaction may be retried
/// - *semantic*: the caller misused the API
/// - *durability*: a commit failed and was aborted
/// - *fatal* ([`CoreError::is_fatal`]): the storage is unusable
#[derive(Debug, Error)]
pub enum CoreError {
    /// Byte-store backend error.
    #[error("backend error: {0}")]
    Backend(#[from] objdb_storage::StorageError),

    /// CBOR codec error.
    #[error("codec error: {0}")]
    Codec(#[from] objdb_codec::CodecError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A write raced with a concurrent commit and could not be resolved.
    #[error("conflict on {oid}: expected serial {expected}, committed serial {actual}")]
    Conflict {
        /// Object that conflicted.
        oid: Oid,
        /// Serial the writer based its change on.
        expected: Tid,
        /// Serial currently committed.
        actual: Tid,
    },

    /// An object read with `read_current` changed before commit.
    #[error("read conflict on {oid}: read serial {expected}, committed serial {actual}")]
    ReadConflict {
        /// Object that changed.
        oid: Oid,
        /// Serial that was read.
        expected: Tid,
        /// Serial currently committed.
        actual: Tid,
    },

    /// No such object, or no such revision.
    #[error("no object {oid}{}", .tid.map(|t| format!(" at {t}")).unwrap_or_default())]
    PosKey {
        /// Requested object.
        oid: Oid,
        /// Requested revision, if any.
        tid: Option<Tid>,
    },

    /// Storage operation attempted with the wrong transaction, or outside one.
    #[error("storage transaction error: {message}")]
    StorageTransaction {
        /// What went wrong.
        message: String,
    },

    /// Mutation attempted on a read-only storage.
    #[error("storage is read-only")]
    ReadOnly,

    /// Operation or format feature that is not supported.
    #[error("unsupported: {message}")]
    Unsupported {
        /// What is unsupported.
        message: String,
    },

    /// Corrupted file or broken invariant; the storage must not be used further.
    #[error("storage system error: {message}")]
    StorageSystem {
        /// Description of the corruption.
        message: String,
    },

    /// A commit failed to become durable.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the failure.
        message: String,
    },

    /// Committing would grow the file past its configured quota.
    #[error("quota exceeded: file would grow to {size} bytes, quota is {quota}")]
    QuotaExceeded {
        /// Size the file would reach.
        size: u64,
        /// Configured quota.
        quota: u64,
    },

    /// Another process holds the storage's lock file.
    #[error("storage locked: {}", .path.display())]
    Locked {
        /// Lock file path.
        path: PathBuf,
    },

    /// The storage has been closed.
    #[error("storage is closed")]
    Closed,

    /// A transaction cannot be undone.
    #[error("undo error: {message}")]
    Undo {
        /// Why the undo was refused.
        message: String,
    },

    /// Connection used in a state that does not allow the operation.
    #[error("connection state error: {message}")]
    ConnectionState {
        /// What went wrong.
        message: String,
    },

    /// An object belongs to a different connection, or a reference is malformed.
    #[error("invalid object reference: {message}")]
    InvalidObjectReference {
        /// What went wrong.
        message: String,
    },

    /// The commit ran past its deadline and was aborted.
    #[error("transaction timed out after {timeout:?}")]
    TransactionTimeout {
        /// Configured timeout.
        timeout: Duration,
    },

    /// The transaction already failed or finished; it must be aborted.
    #[error("transaction failed: {message}")]
    TransactionFailed {
        /// Original failure.
        message: String,
    },
}

impl CoreError {
    /// Creates a storage transaction error.
    pub fn storage_transaction(message: impl Into<String>) -> Self {
        Self::StorageTransaction {
            message: message.into(),
        }
    }

    /// Creates an unsupported error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Creates a storage system (corruption) error.
    pub fn storage_system(message: impl Into<String>) -> Self {
        Self::StorageSystem {
            message: message.into(),
        }
    }

    /// Creates a storage (durability) error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates an undo error.
    pub fn undo(message: impl Into<String>) -> Self {
        Self::Undo {
            message: message.into(),
        }
    }

    /// Creates a connection state error.
    pub fn connection_state(message: impl Into<String>) -> Self {
        Self::ConnectionState {
            message: message.into(),
        }
    }

    /// Creates an invalid object reference error.
    pub fn invalid_reference(message: impl Into<String>) -> Self {
        Self::InvalidObjectReference {
            message: message.into(),
        }
    }

    /// Creates a transaction failed error.
    pub fn transaction_failed(message: impl Into<String>) -> Self {
        Self::TransactionFailed {
            message: message.into(),
        }
    }

    /// Creates a missing-object error.
    pub fn pos_key(oid: Oid) -> Self {
        Self::PosKey { oid, tid: None }
    }

    /// True for errors after which retrying the whole transaction may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::ReadConflict { .. })
    }

    /// True for errors that leave the storage unusable.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StorageSystem { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let conflict = CoreError::Conflict {
            oid: Oid::from_u64(1),
            expected: Tid::ZERO,
            actual: Tid::from_u64(5),
        };
        assert!(conflict.is_transient());
        assert!(!conflict.is_fatal());
        assert!(CoreError::storage_system("bad magic").is_fatal());
        assert!(!CoreError::ReadOnly.is_transient());
    }

    #[test]
    fn pos_key_message_mentions_revision() {
        let plain = CoreError::pos_key(Oid::from_u64(2)).to_string();
        assert_eq!(plain, "no object 0x0000000000000002");

        let at = CoreError::PosKey {
            oid: Oid::from_u64(2),
            tid: Some(Tid::from_u64(3)),
        }
        .to_string();
        assert!(at.ends_with(" at 0x0000000000000003"));
    }
}
