//! Transaction manager.

use super::state::Transaction;
use super::Synchronizer;
use crate::error::{CoreError, CoreResult};
use crate::types::Tid;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

/// Tracks the current transaction of one unit of work.
///
/// Connections opened with a manager register as synchronizers so each new
/// transaction starts from a fresh snapshot.
///
/// # Example
///
/// ```
/// use objdb_core::TransactionManager;
///
/// let manager = TransactionManager::new();
/// let txn = manager.begin();
/// txn.note("nothing to do");
/// manager.commit().unwrap();
/// ```
pub struct TransactionManager {
    current: Mutex<Option<Transaction>>,
    synchronizers: RwLock<Vec<Weak<dyn Synchronizer>>>,
    commit_timeout: Option<Duration>,
}

impl TransactionManager {
    /// Creates a manager with no current transaction.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
            synchronizers: RwLock::new(Vec::new()),
            commit_timeout: None,
        }
    }

    /// Sets a wall-clock limit on two-phase commit.
    #[must_use]
    pub fn with_commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = Some(timeout);
        self
    }

    /// Starts a new transaction, aborting the current one if it is still open.
    pub fn begin(&self) -> Transaction {
        let previous = self.current.lock().take();
        if let Some(previous) = previous {
            if previous.is_active() {
                debug!(txn = previous.id(), "begin aborts the open transaction");
                if let Err(e) = previous.abort() {
                    debug!(txn = previous.id(), error = %e, "abort of replaced transaction failed");
                }
            }
        }

        let synchronizers = self.live_synchronizers();
        let txn = Transaction::with_hooks(
            synchronizers.iter().map(Arc::downgrade).collect(),
            self.commit_timeout,
        );
        for synchronizer in &synchronizers {
            synchronizer.new_transaction(&txn);
        }
        *self.current.lock() = Some(txn.clone());
        txn
    }

    /// The current transaction, beginning one if there is none.
    pub fn get(&self) -> Transaction {
        if let Some(txn) = self.current.lock().as_ref() {
            if txn.is_active() {
                return txn.clone();
            }
        }
        self.begin()
    }

    /// The current transaction without creating one.
    #[must_use]
    pub fn current(&self) -> Option<Transaction> {
        self.current.lock().clone()
    }

    /// Commits the current transaction.
    pub fn commit(&self) -> CoreResult<Tid> {
        let txn = self
            .current
            .lock()
            .take()
            .ok_or_else(|| CoreError::transaction_failed("no transaction in progress"))?;
        txn.commit()
    }

    /// Aborts the current transaction, if any.
    pub fn abort(&self) -> CoreResult<()> {
        let txn = self.current.lock().take();
        match txn {
            Some(txn) => txn.abort(),
            None => Ok(()),
        }
    }

    /// Registers a synchronizer. The manager only keeps a weak reference.
    pub fn register_synchronizer(&self, synchronizer: &Arc<dyn Synchronizer>) {
        let mut synchronizers = self.synchronizers.write();
        synchronizers.retain(|s| s.strong_count() > 0);
        synchronizers.push(Arc::downgrade(synchronizer));
    }

    /// Removes a synchronizer.
    pub fn unregister_synchronizer(&self, synchronizer: &Arc<dyn Synchronizer>) {
        let target = Arc::as_ptr(synchronizer).cast::<()>();
        self.synchronizers
            .write()
            .retain(|s| s.strong_count() > 0 && !std::ptr::eq(s.as_ptr().cast::<()>(), target));
    }

    /// Number of live synchronizers.
    #[must_use]
    pub fn synchronizer_count(&self) -> usize {
        self.synchronizers
            .read()
            .iter()
            .filter(|s| s.strong_count() > 0)
            .count()
    }

    fn live_synchronizers(&self) -> Vec<Arc<dyn Synchronizer>> {
        self.synchronizers.read().iter().filter_map(Weak::upgrade).collect()
    }

    /// Runs `work` in a fresh transaction and commits it, retrying up to
    /// `attempts` times on transient errors such as conflicts.
    pub fn run<T, F>(&self, attempts: usize, mut work: F) -> CoreResult<T>
    where
        F: FnMut(&Transaction) -> CoreResult<T>,
    {
        let attempts = attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let txn = self.begin();
            let outcome = work(&txn).and_then(|value| self.commit().map(|_| value));
            match outcome {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if let Err(abort_error) = self.abort() {
                        debug!(error = %abort_error, "abort after failed attempt");
                    }
                    if !e.is_transient() || attempt >= attempts {
                        return Err(e);
                    }
                    debug!(attempt, error = %e, "retrying transaction");
                }
            }
        }
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("current", &self.current.lock().as_ref().map(Transaction::id))
            .field("synchronizers", &self.synchronizer_count())
            .field("commit_timeout", &self.commit_timeout)
            .finish()
    }
}
