//! Error types for the load-transaction coordinator
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Every transaction-scoped variant carries the database id and transaction id
//! (and the label where one is known) so a client can correlate the failure
//! with its load job.

use crate::types::{DbId, PartitionId, TableId, TabletId, TxnId};
use crate::txn_state::TransactionStatus;
use std::io;
use thiserror::Error;

/// Result type alias for coordinator operations
pub type Result<T> = std::result::Result<T, TxnError>;

/// Error types for the load-transaction coordinator
#[derive(Debug, Error)]
pub enum TxnError {
    /// The label already names a running (or still retained visible) transaction
    #[error("label [{label}] has already been used in db {db_id} by transaction {existing_txn_id}")]
    DuplicateLabel {
        /// Database the label belongs to
        db_id: DbId,
        /// The duplicated label
        label: String,
        /// Transaction currently holding the label
        existing_txn_id: TxnId,
    },

    /// Per-database admission cap reached
    #[error("current running txns on db {db_id} is {running}, larger than limit {limit}")]
    RunningTxnExceedLimit {
        /// Database that is at capacity
        db_id: DbId,
        /// Counted running transactions
        running: usize,
        /// Configured cap
        limit: usize,
    },

    /// Unknown transaction, or one that is already VISIBLE/ABORTED
    #[error("transaction not found, db id: {db_id}, transaction id: {txn_id}")]
    TransactionNotFound {
        /// Database searched
        db_id: DbId,
        /// Transaction requested
        txn_id: TxnId,
    },

    /// Finish was requested for a transaction that has not been committed
    #[error("transaction {txn_id} in db {db_id} is {status}, not committed")]
    TransactionNotCommitted {
        /// Owning database
        db_id: DbId,
        /// Transaction id
        txn_id: TxnId,
        /// Current status
        status: TransactionStatus,
    },

    /// Finish was requested ahead of an earlier committer on a shared table
    #[error("transaction {txn_id} in db {db_id} cannot publish before transaction {blocking_txn_id}")]
    PublishNotReady {
        /// Owning database
        db_id: DbId,
        /// Transaction asked to finish
        txn_id: TxnId,
        /// Earlier committer that is not yet visible
        blocking_txn_id: TxnId,
    },

    /// A tablet did not collect enough successful replicas
    #[error(
        "tablet {tablet_id} of transaction {txn_id} (db {db_id}, label {label}) \
         has {success_replicas} successful replicas, less than quorum {quorum}"
    )]
    QuorumNotMet {
        /// Owning database
        db_id: DbId,
        /// Transaction id
        txn_id: TxnId,
        /// Transaction label
        label: String,
        /// Failing tablet
        tablet_id: TabletId,
        /// Replicas that acknowledged the write
        success_replicas: usize,
        /// Required replicas
        quorum: usize,
    },

    /// The transaction ran past its timeout before commit
    #[error("transaction {txn_id} (db {db_id}, label {label}) exceeded its timeout of {timeout_ms}ms")]
    StaleTransaction {
        /// Owning database
        db_id: DbId,
        /// Transaction id
        txn_id: TxnId,
        /// Transaction label
        label: String,
        /// Configured timeout
        timeout_ms: i64,
    },

    /// A table or partition disappeared from the catalog.
    ///
    /// Never surfaced by the transaction managers: publish treats the missing
    /// object as already published and logs a warning.
    #[error("table {table_id} partition {partition_id:?} of db {db_id} is missing")]
    TableOrPartitionMissing {
        /// Owning database
        db_id: DbId,
        /// Table that was looked up
        table_id: TableId,
        /// Partition that was looked up, if the table itself exists
        partition_id: Option<PartitionId>,
    },

    /// Requested load timeout is outside the configured window
    #[error("invalid timeout {timeout_sec}s, must be between {min}s and {max}s")]
    InvalidTimeout {
        /// Requested timeout
        timeout_sec: i64,
        /// Lower bound
        min: i64,
        /// Upper bound
        max: i64,
    },

    /// No transaction manager exists for the database
    #[error("database transaction manager for db {db_id} does not exist")]
    DatabaseNotFound {
        /// Database requested
        db_id: DbId,
    },

    /// Invalid argument or call sequence
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Appending to the edit log failed
    #[error("Edit log error: {0}")]
    EditLog(String),

    /// The edit log is fenced after an earlier append failure
    #[error("Replication unavailable: {0}")]
    ReplicationUnavailable(String),

    /// I/O error (file operations)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Truncated entry at the end of a log file
    #[error("Incomplete entry at offset {offset}: have {have} bytes, need {needed}")]
    IncompleteEntry {
        /// File offset of the entry
        offset: u64,
        /// Bytes available
        have: usize,
        /// Bytes required
        needed: usize,
    },

    /// Configuration could not be loaded or is invalid
    #[error("Config error: {0}")]
    Config(String),
}

impl TxnError {
    /// Check whether this error is a not-found error
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            TxnError::TransactionNotFound { .. } | TxnError::DatabaseNotFound { .. }
        )
    }

    /// Check whether this error rejected a begin request at admission
    pub fn is_admission_rejection(&self) -> bool {
        matches!(
            self,
            TxnError::DuplicateLabel { .. } | TxnError::RunningTxnExceedLimit { .. }
        )
    }

    /// Check whether this error means the node must stop serving writes
    pub fn is_replication_failure(&self) -> bool {
        matches!(
            self,
            TxnError::EditLog(_) | TxnError::ReplicationUnavailable(_)
        )
    }
}
