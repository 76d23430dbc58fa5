//! Transaction state and the commit protocol.

use super::{DataManager, Synchronizer};
use crate::error::{CoreError, CoreResult};
use crate::storage::TransactionMeta;
use crate::timestamp::tid_from_system_time;
use crate::transaction::next_transaction_id;
use crate::types::Tid;
use objdb_codec::Value;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, warn};

/// Where a transaction is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Accepting work.
    Active,
    /// Between `tpc_begin` and the end of voting.
    Preparing,
    /// Every manager voted yes; finishing.
    Prepared,
    /// Committed.
    Committed,
    /// A manager failed; aborting.
    Failed,
    /// Aborted.
    Aborted,
}

struct TxnState {
    status: TransactionStatus,
    resources: Vec<Arc<dyn DataManager>>,
    user: String,
    description: String,
    extension: Value,
    failure: Option<String>,
    tid: Option<Tid>,
}

struct TxnInner {
    id: u64,
    state: Mutex<TxnState>,
    timeout: Option<Duration>,
    synchronizers: Vec<Weak<dyn Synchronizer>>,
}

/// A unit of work spanning one or more data managers.
///
/// Cloning yields another handle to the same transaction.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TxnInner>,
}

fn same_manager(a: &Arc<dyn DataManager>, b: &Arc<dyn DataManager>) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

impl Transaction {
    /// Creates a standalone transaction with no synchronizers.
    #[must_use]
    pub fn new() -> Self {
        Self::with_hooks(Vec::new(), None)
    }

    pub(crate) fn with_hooks(synchronizers: Vec<Weak<dyn Synchronizer>>, timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(TxnInner {
                id: next_transaction_id(),
                state: Mutex::new(TxnState {
                    status: TransactionStatus::Active,
                    resources: Vec::new(),
                    user: String::new(),
                    description: String::new(),
                    extension: Value::empty_map(),
                    failure: None,
                    tid: None,
                }),
                timeout,
                synchronizers,
            }),
        }
    }

    /// Process-unique id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> TransactionStatus {
        self.inner.state.lock().status
    }

    /// True while work can still be added.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status() == TransactionStatus::Active
    }

    /// Commit TID, once committed.
    #[must_use]
    pub fn tid(&self) -> Option<Tid> {
        self.inner.state.lock().tid
    }

    /// Commit timeout, if any.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.inner.timeout
    }

    /// True if both handles refer to the same transaction.
    #[must_use]
    pub fn same_as(&self, other: &Transaction) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Sets the committing user.
    pub fn set_user(&self, user: impl Into<String>) {
        self.inner.state.lock().user = user.into();
    }

    /// Appends a line to the description.
    pub fn note(&self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let mut state = self.inner.state.lock();
        if !state.description.is_empty() {
            state.description.push('\n');
        }
        state.description.push_str(text);
    }

    /// Sets an extension entry.
    pub fn set_extension(&self, key: &str, value: Value) {
        self.inner.state.lock().extension.insert(key, value);
    }

    /// Committing user.
    #[must_use]
    pub fn user(&self) -> String {
        self.inner.state.lock().user.clone()
    }

    /// Accumulated description.
    #[must_use]
    pub fn description(&self) -> String {
        self.inner.state.lock().description.clone()
    }

    /// Extension map.
    #[must_use]
    pub fn extension(&self) -> Value {
        self.inner.state.lock().extension.clone()
    }

    /// Metadata as handed to storages.
    #[must_use]
    pub fn meta(&self) -> TransactionMeta {
        let state = self.inner.state.lock();
        let mut meta = TransactionMeta::with_id(self.inner.id)
            .user(state.user.clone())
            .description(state.description.clone());
        meta.extension = state.extension.clone();
        meta
    }

    /// Adds a data manager. Joining twice is a no-op.
    pub fn join(&self, resource: Arc<dyn DataManager>) -> CoreResult<()> {
        let mut state = self.inner.state.lock();
        if state.status != TransactionStatus::Active {
            return Err(CoreError::transaction_failed(format!(
                "cannot join a transaction that is {:?}",
                state.status
            )));
        }
        if !state.resources.iter().any(|r| same_manager(r, &resource)) {
            state.resources.push(resource);
        }
        Ok(())
    }

    /// Number of joined managers.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.inner.state.lock().resources.len()
    }

    fn synchronizers(&self) -> Vec<Arc<dyn Synchronizer>> {
        self.inner.synchronizers.iter().filter_map(Weak::upgrade).collect()
    }

    fn set_status(&self, status: TransactionStatus) {
        self.inner.state.lock().status = status;
    }

    fn check_timeout(&self, started: Instant) -> CoreResult<()> {
        match self.inner.timeout {
            Some(timeout) if started.elapsed() > timeout => {
                Err(CoreError::TransactionTimeout { timeout })
            }
            _ => Ok(()),
        }
    }

    /// Runs two-phase commit over every joined manager.
    ///
    /// On failure every manager is aborted and the transaction ends up
    /// [`TransactionStatus::Aborted`]; the first error is returned.
    pub fn commit(&self) -> CoreResult<Tid> {
        {
            let state = self.inner.state.lock();
            match state.status {
                TransactionStatus::Active => {}
                TransactionStatus::Aborted if state.failure.is_some() => {
                    return Err(CoreError::transaction_failed(format!(
                        "transaction {} already failed: {}",
                        self.inner.id,
                        state.failure.as_deref().unwrap_or_default()
                    )))
                }
                other => {
                    return Err(CoreError::transaction_failed(format!(
                        "cannot commit a transaction that is {other:?}"
                    )))
                }
            }
        }

        let synchronizers = self.synchronizers();
        for synchronizer in &synchronizers {
            if let Err(e) = synchronizer.before_completion(self) {
                let resources = self.inner.state.lock().resources.clone();
                self.fail(&[], &e);
                for resource in &resources {
                    if let Err(abort_error) = resource.abort(self) {
                        warn!(txn = self.inner.id, error = %abort_error, "abort failed");
                    }
                }
                self.complete(&synchronizers);
                return Err(e);
            }
        }

        let mut resources = {
            let mut state = self.inner.state.lock();
            state.status = TransactionStatus::Preparing;
            state.resources.clone()
        };
        resources.sort_by_key(|r| r.sort_key());

        let started = Instant::now();
        let mut begun = 0;
        let voted = (|| -> CoreResult<Option<Tid>> {
            for resource in &resources {
                resource.tpc_begin(self)?;
                begun += 1;
            }
            for resource in &resources {
                self.check_timeout(started)?;
                resource.commit(self)?;
            }
            let mut proposed = None;
            for resource in &resources {
                self.check_timeout(started)?;
                if let Some(tid) = resource.tpc_vote(self)? {
                    proposed = proposed.max(Some(tid));
                }
            }
            self.check_timeout(started)?;
            Ok(proposed)
        })();

        let proposed = match voted {
            Ok(proposed) => proposed,
            Err(e) => {
                self.fail(&resources[..begun], &e);
                for resource in &resources[begun..] {
                    if let Err(abort_error) = resource.abort(self) {
                        warn!(txn = self.inner.id, error = %abort_error, "abort failed");
                    }
                }
                self.complete(&synchronizers);
                return Err(e);
            }
        };

        self.set_status(TransactionStatus::Prepared);
        let mut tid = proposed.unwrap_or_else(|| tid_from_system_time(SystemTime::now()));
        let mut finish_error = None;
        for resource in resources.iter().rev() {
            match resource.tpc_finish(self, tid) {
                Ok(used) => tid = tid.max(used),
                Err(e) => {
                    error!(
                        txn = self.inner.id,
                        manager = %resource.sort_key(),
                        error = %e,
                        "tpc_finish failed; transaction is partially committed"
                    );
                    finish_error.get_or_insert(e);
                }
            }
        }

        {
            let mut state = self.inner.state.lock();
            state.status = TransactionStatus::Committed;
            state.tid = Some(tid);
            state.resources.clear();
        }
        self.complete(&synchronizers);
        match finish_error {
            Some(e) => Err(CoreError::transaction_failed(format!(
                "transaction {} committed at {tid} but a manager failed to finish: {e}",
                self.inner.id
            ))),
            None => {
                debug!(txn = self.inner.id, %tid, managers = resources.len(), "committed");
                Ok(tid)
            }
        }
    }

    fn fail(&self, begun: &[Arc<dyn DataManager>], cause: &CoreError) {
        {
            let mut state = self.inner.state.lock();
            state.status = TransactionStatus::Failed;
            state.failure = Some(cause.to_string());
        }
        for resource in begun {
            if let Err(e) = resource.tpc_abort(self) {
                warn!(txn = self.inner.id, error = %e, "tpc_abort failed");
            }
        }
        debug!(txn = self.inner.id, error = %cause, "commit failed");
        let mut state = self.inner.state.lock();
        state.status = TransactionStatus::Aborted;
        state.resources.clear();
    }

    fn complete(&self, synchronizers: &[Arc<dyn Synchronizer>]) {
        for synchronizer in synchronizers {
            synchronizer.after_completion(self);
        }
    }

    /// Abandons the transaction, reverting every joined manager.
    pub fn abort(&self) -> CoreResult<()> {
        let resources = {
            let mut state = self.inner.state.lock();
            match state.status {
                TransactionStatus::Committed => {
                    return Err(CoreError::transaction_failed(
                        "cannot abort a committed transaction",
                    ))
                }
                TransactionStatus::Aborted => return Ok(()),
                _ => {}
            }
            state.status = TransactionStatus::Aborted;
            std::mem::take(&mut state.resources)
        };
        let mut first_error = None;
        for resource in &resources {
            if let Err(e) = resource.abort(self) {
                warn!(txn = self.inner.id, error = %e, "abort failed");
                first_error.get_or_insert(e);
            }
        }
        self.complete(&self.synchronizers());
        first_error.map_or(Ok(()), Err)
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("status", &state.status)
            .field("resources", &state.resources.len())
            .field("tid", &state.tid)
            .finish()
    }
}
