//! Edit log abstraction
//!
//! The edit log is the replication primitive of the coordinator: a mutation is
//! only acknowledged once its record has been appended. Followers consume the
//! same records in the same order.
//!
//! - [`EditLog`]: the append interface used by the transaction managers
//! - [`MemoryEditLog`]: records kept in memory (tests, embedded followers)
//! - [`FencedEditLog`]: stops accepting appends after the first failure
//! - [`crate::file_log::FileEditLog`]: append-only file with fsync policy

use crate::record::EditLogRecord;
use loadtxn_core::{Result, TxnError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// Durable, ordered append of coordinator mutations
///
/// Implementations must be safe to call from many threads. A successful
/// return means the record is durable according to the log's policy.
pub trait EditLog: Send + Sync {
    /// Append a record, returning its position in the log
    ///
    /// # Errors
    ///
    /// Returns an error if the record could not be made durable.
    fn append(&self, record: &EditLogRecord) -> Result<u64>;
}

/// In-memory edit log
///
/// Keeps every appended record so tests can hand them to a follower.
/// `set_fail_appends(true)` makes subsequent appends fail.
#[derive(Debug, Default)]
pub struct MemoryEditLog {
    records: Mutex<Vec<EditLogRecord>>,
    fail_appends: AtomicBool,
}

impl MemoryEditLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty log behind an `Arc`
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Copy of every record appended so far
    pub fn records(&self) -> Vec<EditLogRecord> {
        self.records.lock().clone()
    }

    /// Records appended at or after position `from`
    pub fn records_since(&self, from: usize) -> Vec<EditLogRecord> {
        let records = self.records.lock();
        records.iter().skip(from).cloned().collect()
    }

    /// Number of records appended
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// True when nothing has been appended
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Make appends fail (or succeed again)
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }
}

impl EditLog for MemoryEditLog {
    fn append(&self, record: &EditLogRecord) -> Result<u64> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(TxnError::EditLog("injected append failure".to_string()));
        }
        let mut records = self.records.lock();
        records.push(record.clone());
        Ok(records.len() as u64 - 1)
    }
}

/// Edit log wrapper that fences itself after a failed append
///
/// A node whose append failed can no longer prove that followers will see
/// the same sequence of transitions, so it must stop serving mutations until
/// an operator (or a leadership change) calls [`FencedEditLog::unfence`].
pub struct FencedEditLog {
    inner: Arc<dyn EditLog>,
    fenced: AtomicBool,
}

impl FencedEditLog {
    /// Wrap a log
    pub fn new(inner: Arc<dyn EditLog>) -> Self {
        Self {
            inner,
            fenced: AtomicBool::new(false),
        }
    }

    /// Whether appends are currently refused
    pub fn is_fenced(&self) -> bool {
        self.fenced.load(Ordering::SeqCst)
    }

    /// Accept appends again
    pub fn unfence(&self) {
        if self.fenced.swap(false, Ordering::SeqCst) {
            info!(target: "loadtxn::editlog", "Edit log unfenced, accepting appends");
        }
    }
}

impl EditLog for FencedEditLog {
    fn append(&self, record: &EditLogRecord) -> Result<u64> {
        if self.is_fenced() {
            return Err(TxnError::ReplicationUnavailable(
                "edit log is fenced after an earlier append failure".to_string(),
            ));
        }
        match self.inner.append(record) {
            Ok(pos) => Ok(pos),
            Err(e) => {
                self.fenced.store(true, Ordering::SeqCst);
                error!(
                    target: "loadtxn::editlog",
                    op = record.op_code(),
                    error = %e,
                    "Edit log append failed, refusing further mutations"
                );
                Err(e)
            }
        }
    }
}
