//! Edit log record types
//!
//! Every mutation of coordinator state is described by exactly one record.
//! The leader appends the record before acknowledging the caller; followers
//! (and a restarting leader) rebuild their indexes by replaying records in
//! log order.

use loadtxn_core::{DbId, TransactionState, TransactionStateBatch, TxnId};
use serde::{Deserialize, Serialize};

/// Record type tags, stored in the frame header
pub mod op {
    /// `SaveTransactionId`
    pub const SAVE_TRANSACTION_ID: u8 = 1;
    /// `UpsertTransactionState`
    pub const UPSERT_TRANSACTION_STATE: u8 = 2;
    /// `UpsertTransactionStateBatch`
    pub const UPSERT_TRANSACTION_STATE_BATCH: u8 = 3;
}

/// One replicated mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EditLogRecord {
    /// The id generator reserved every id below `batch_end_id`
    SaveTransactionId {
        /// Exclusive upper bound of the reserved range
        batch_end_id: TxnId,
    },

    /// Full state of one transaction after a transition
    UpsertTransactionState(TransactionState),

    /// Full states of a batch finished together
    UpsertTransactionStateBatch(TransactionStateBatch),
}

impl EditLogRecord {
    /// Frame type tag
    pub fn op_code(&self) -> u8 {
        match self {
            EditLogRecord::SaveTransactionId { .. } => op::SAVE_TRANSACTION_ID,
            EditLogRecord::UpsertTransactionState(_) => op::UPSERT_TRANSACTION_STATE,
            EditLogRecord::UpsertTransactionStateBatch(_) => op::UPSERT_TRANSACTION_STATE_BATCH,
        }
    }

    /// Database the record belongs to, None for id reservations
    pub fn db_id(&self) -> Option<DbId> {
        match self {
            EditLogRecord::SaveTransactionId { .. } => None,
            EditLogRecord::UpsertTransactionState(state) => Some(state.db_id()),
            EditLogRecord::UpsertTransactionStateBatch(batch) => batch.db_id(),
        }
    }

    /// Transactions described by the record
    pub fn txn_ids(&self) -> Vec<TxnId> {
        match self {
            EditLogRecord::SaveTransactionId { .. } => Vec::new(),
            EditLogRecord::UpsertTransactionState(state) => vec![state.transaction_id()],
            EditLogRecord::UpsertTransactionStateBatch(batch) => batch.txn_ids(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loadtxn_core::{LoadJobSourceType, TxnCoordinator};

    fn state(id: TxnId) -> TransactionState {
        TransactionState::new(
            3,
            vec![1],
            id,
            format!("l{}", id),
            TxnCoordinator::fe("fe"),
            LoadJobSourceType::Frontend,
            1000,
            0,
        )
    }

    #[test]
    fn test_accessors() {
        let save = EditLogRecord::SaveTransactionId { batch_end_id: 2000 };
        assert_eq!(save.op_code(), op::SAVE_TRANSACTION_ID);
        assert_eq!(save.db_id(), None);
        assert!(save.txn_ids().is_empty());

        let upsert = EditLogRecord::UpsertTransactionState(state(7));
        assert_eq!(upsert.db_id(), Some(3));
        assert_eq!(upsert.txn_ids(), vec![7]);

        let batch = EditLogRecord::UpsertTransactionStateBatch(TransactionStateBatch::new(vec![
            state(8),
            state(9),
        ]));
        assert_eq!(batch.op_code(), op::UPSERT_TRANSACTION_STATE_BATCH);
        assert_eq!(batch.txn_ids(), vec![8, 9]);
    }
}
