//! Two-phase commit coordination.
//!
//! A [`Transaction`] collects the data managers (connections, undo
//! requests) that joined it and drives them through the commit protocol:
//!
//! ```text
//! tpc_begin (sorted) -> commit (sorted) -> tpc_vote (sorted) -> tpc_finish (reverse)
//!                \______________ on any error: tpc_abort _______________/
//! ```
//!
//! The final TID is the largest TID any manager proposed at vote.

mod manager;
mod state;

use crate::error::CoreResult;
use crate::types::Tid;
use std::sync::atomic::{AtomicU64, Ordering};

pub use manager::TransactionManager;
pub use state::{Transaction, TransactionStatus};

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-unique transaction id.
pub fn next_transaction_id() -> u64 {
    NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// A participant in a transaction.
pub trait DataManager: Send + Sync {
    /// Managers are called in ascending key order (finish in descending).
    fn sort_key(&self) -> String;

    /// Discards changes made in `txn` outside of two-phase commit.
    fn abort(&self, txn: &Transaction) -> CoreResult<()>;

    /// First phase: claim whatever the commit needs.
    fn tpc_begin(&self, txn: &Transaction) -> CoreResult<()>;

    /// Writes the manager's changes.
    fn commit(&self, txn: &Transaction) -> CoreResult<()>;

    /// Makes the changes durable and proposes a TID.
    fn tpc_vote(&self, txn: &Transaction) -> CoreResult<Option<Tid>>;

    /// Commits at `tid`. Returns the TID actually used.
    fn tpc_finish(&self, txn: &Transaction, tid: Tid) -> CoreResult<Tid>;

    /// Rolls back after `tpc_begin`.
    fn tpc_abort(&self, txn: &Transaction) -> CoreResult<()>;
}

/// Hooks around transaction boundaries.
pub trait Synchronizer: Send + Sync {
    /// A new transaction began.
    fn new_transaction(&self, _txn: &Transaction) {}

    /// The transaction is about to commit. An error aborts it.
    fn before_completion(&self, _txn: &Transaction) -> CoreResult<()> {
        Ok(())
    }

    /// The transaction committed or aborted.
    fn after_completion(&self, _txn: &Transaction) {}
}
