//! Transaction state record
//!
//! `TransactionState` is the full lifecycle record of one load transaction.
//! It is the unit that is appended to the edit log on every transition and
//! replayed by followers, so it is plain serde data with no references into
//! manager internals.
//!
//! ## Status Lifecycle
//!
//! ```text
//! PREPARE ──commit──> COMMITTED ──finish──> VISIBLE
//!    │                    │
//!    └──────abort─────────┴──────────────> ABORTED
//! ```
//!
//! VISIBLE and ABORTED are terminal. UNKNOWN is only ever synthesized for
//! lookups of ids the manager does not track; it is never stored.

use crate::types::{
    BackendId, DbId, LoadJobSourceType, PartitionId, TableId, TabletId, TxnCoordinator, TxnId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Current wall-clock time in milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Status of a load transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Not tracked (synthetic, never stored)
    Unknown,
    /// Begun, data being written
    Prepare,
    /// Data durable on a quorum, versions assigned, waiting for publish
    Committed,
    /// Published and readable
    Visible,
    /// Rolled back
    Aborted,
}

impl TransactionStatus {
    /// PREPARE or COMMITTED
    pub fn is_running(&self) -> bool {
        matches!(self, TransactionStatus::Prepare | TransactionStatus::Committed)
    }

    /// VISIBLE or ABORTED
    pub fn is_final(&self) -> bool {
        matches!(self, TransactionStatus::Visible | TransactionStatus::Aborted)
    }

    /// Whether the lifecycle permits moving from `self` to `next`
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Prepare, Committed) | (Committed, Visible) | (Prepare, Aborted) | (Committed, Aborted)
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionStatus::Unknown => "UNKNOWN",
            TransactionStatus::Prepare => "PREPARE",
            TransactionStatus::Committed => "COMMITTED",
            TransactionStatus::Visible => "VISIBLE",
            TransactionStatus::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

/// A replica that acknowledged writing its part of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TabletCommitInfo {
    /// Tablet written
    pub tablet_id: TabletId,
    /// Backend holding the replica
    pub backend_id: BackendId,
}

impl TabletCommitInfo {
    /// Create a commit info
    pub fn new(tablet_id: TabletId, backend_id: BackendId) -> Self {
        Self {
            tablet_id,
            backend_id,
        }
    }
}

/// A replica that failed to write its part of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TabletFailInfo {
    /// Tablet written
    pub tablet_id: TabletId,
    /// Backend holding the replica
    pub backend_id: BackendId,
}

impl TabletFailInfo {
    /// Create a fail info
    pub fn new(tablet_id: TabletId, backend_id: BackendId) -> Self {
        Self {
            tablet_id,
            backend_id,
        }
    }
}

/// Version assigned to one partition at commit time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionCommitInfo {
    /// Partition id
    pub partition_id: PartitionId,
    /// Version readers see once the transaction is visible
    pub version: i64,
    /// Commit timestamp recorded as the version time
    pub version_time: i64,
}

/// Per-table commit versions
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableCommitInfo {
    /// Table id
    pub table_id: TableId,
    /// partition id -> commit info
    pub partition_commit_infos: BTreeMap<PartitionId, PartitionCommitInfo>,
}

impl TableCommitInfo {
    /// Empty commit info for a table
    pub fn new(table_id: TableId) -> Self {
        Self {
            table_id,
            partition_commit_infos: BTreeMap::new(),
        }
    }
}

/// Payload carried by a specific load type, used on replay and on finish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnCommitAttachment {
    /// Routine load task progress (Kafka partition -> next offset)
    RoutineLoadTask {
        /// Owning routine load job
        job_id: i64,
        /// Progress per source partition
        partition_offsets: BTreeMap<i32, i64>,
        /// Rows loaded by the task
        loaded_rows: i64,
        /// Rows filtered by the task
        filtered_rows: i64,
    },
    /// Generic load statistics
    Load {
        /// Rows loaded
        loaded_rows: i64,
        /// Rows filtered
        filtered_rows: i64,
        /// Bytes received
        received_bytes: i64,
    },
    /// Payload owned by a load type this crate does not interpret
    Opaque {
        /// Load type name
        kind: String,
        /// Encoded payload
        payload: Vec<u8>,
    },
}

/// Full lifecycle record of one load transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionState {
    transaction_id: TxnId,
    db_id: DbId,
    table_id_list: Vec<TableId>,
    label: String,
    coordinator: TxnCoordinator,
    source_type: LoadJobSourceType,
    status: TransactionStatus,
    reason: String,
    timeout_ms: i64,
    prepare_time: i64,
    commit_time: i64,
    finish_time: i64,
    error_replicas: BTreeSet<i64>,
    commit_attachment: Option<TxnCommitAttachment>,
    table_commit_infos: BTreeMap<TableId, TableCommitInfo>,
}

impl TransactionState {
    /// Create a PREPARE transaction. Unset timestamps are -1.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db_id: DbId,
        table_id_list: Vec<TableId>,
        transaction_id: TxnId,
        label: impl Into<String>,
        coordinator: TxnCoordinator,
        source_type: LoadJobSourceType,
        timeout_ms: i64,
        prepare_time: i64,
    ) -> Self {
        Self {
            transaction_id,
            db_id,
            table_id_list,
            label: label.into(),
            coordinator,
            source_type,
            status: TransactionStatus::Prepare,
            reason: String::new(),
            timeout_ms,
            prepare_time,
            commit_time: -1,
            finish_time: -1,
            error_replicas: BTreeSet::new(),
            commit_attachment: None,
            table_commit_infos: BTreeMap::new(),
        }
    }

    /// Transaction id
    pub fn transaction_id(&self) -> TxnId {
        self.transaction_id
    }

    /// Owning database
    pub fn db_id(&self) -> DbId {
        self.db_id
    }

    /// Tables still touched by the transaction
    pub fn table_id_list(&self) -> &[TableId] {
        &self.table_id_list
    }

    /// Load label
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Coordinating node
    pub fn coordinator(&self) -> &TxnCoordinator {
        &self.coordinator
    }

    /// Ingestion path
    pub fn source_type(&self) -> LoadJobSourceType {
        self.source_type
    }

    /// Lifecycle status
    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Abort (or failure) reason, empty if none
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Timeout in milliseconds
    pub fn timeout_ms(&self) -> i64 {
        self.timeout_ms
    }

    /// Begin time (ms)
    pub fn prepare_time(&self) -> i64 {
        self.prepare_time
    }

    /// Commit time (ms), -1 if never committed
    pub fn commit_time(&self) -> i64 {
        self.commit_time
    }

    /// Finish time (ms), -1 while running
    pub fn finish_time(&self) -> i64 {
        self.finish_time
    }

    /// Replicas that failed to publish
    pub fn error_replicas(&self) -> &BTreeSet<i64> {
        &self.error_replicas
    }

    /// Load-type payload
    pub fn commit_attachment(&self) -> Option<&TxnCommitAttachment> {
        self.commit_attachment.as_ref()
    }

    /// Commit versions per table
    pub fn table_commit_infos(&self) -> &BTreeMap<TableId, TableCommitInfo> {
        &self.table_commit_infos
    }

    /// Commit versions of one table
    pub fn table_commit_info(&self, table_id: TableId) -> Option<&TableCommitInfo> {
        self.table_commit_infos.get(&table_id)
    }

    /// PREPARE or COMMITTED
    pub fn is_running(&self) -> bool {
        self.status.is_running()
    }

    /// Whether a PREPARE transaction has outlived its timeout at `now_ms`
    pub fn is_timeout(&self, now_ms: i64) -> bool {
        self.status == TransactionStatus::Prepare && now_ms - self.prepare_time > self.timeout_ms
    }

    /// Whether the transaction touches `table_id`
    pub fn contains_table(&self, table_id: TableId) -> bool {
        self.table_id_list.contains(&table_id)
    }

    /// Drop a table from the transaction (the table was dropped after begin)
    ///
    /// Returns true if the table was present.
    pub fn remove_table(&mut self, table_id: TableId) -> bool {
        let before = self.table_id_list.len();
        self.table_id_list.retain(|t| *t != table_id);
        self.table_commit_infos.remove(&table_id);
        before != self.table_id_list.len()
    }

    /// Record commit versions for a table
    pub fn put_table_commit_info(&mut self, info: TableCommitInfo) {
        self.table_commit_infos.insert(info.table_id, info);
    }

    /// Replace the load-type payload
    pub fn set_commit_attachment(&mut self, attachment: Option<TxnCommitAttachment>) {
        self.commit_attachment = attachment;
    }

    /// Record replicas that failed to publish
    pub fn add_error_replicas(&mut self, replicas: impl IntoIterator<Item = i64>) {
        self.error_replicas.extend(replicas);
    }

    /// Move to `status`, stamping the matching timestamp.
    ///
    /// Returns false (and leaves the state untouched) for transitions outside
    /// the lifecycle.
    pub fn transition(&mut self, status: TransactionStatus, now_ms: i64) -> bool {
        if !self.status.can_transition_to(status) {
            return false;
        }
        self.status = status;
        match status {
            TransactionStatus::Committed => self.commit_time = now_ms,
            TransactionStatus::Visible | TransactionStatus::Aborted => self.finish_time = now_ms,
            TransactionStatus::Prepare | TransactionStatus::Unknown => {}
        }
        true
    }

    /// Set the abort reason
    pub fn set_reason(&mut self, reason: impl Into<String>) {
        self.reason = reason.into();
    }
}

/// Committed transactions of one database published together, in order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionStateBatch {
    states: Vec<TransactionState>,
}

impl TransactionStateBatch {
    /// Create a batch. Members keep the given publish order.
    pub fn new(states: Vec<TransactionState>) -> Self {
        Self { states }
    }

    /// Number of members
    pub fn size(&self) -> usize {
        self.states.len()
    }

    /// True when the batch has no members
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Members in publish order
    pub fn states(&self) -> &[TransactionState] {
        &self.states
    }

    /// Consume into members
    pub fn into_states(self) -> Vec<TransactionState> {
        self.states
    }

    /// Member ids in publish order
    pub fn txn_ids(&self) -> Vec<TxnId> {
        self.states.iter().map(|s| s.transaction_id()).collect()
    }

    /// Database of the batch, taken from the first member
    pub fn db_id(&self) -> Option<DbId> {
        self.states.first().map(|s| s.db_id())
    }

    /// Union of member tables
    pub fn table_ids(&self) -> BTreeSet<TableId> {
        self.states
            .iter()
            .flat_map(|s| s.table_id_list().iter().copied())
            .collect()
    }
}
