//! Transaction id allocation
//!
//! Ids are handed out from reserved ranges of [`BATCH_ID_INTERVAL`]. Each new
//! range is logged (`SaveTransactionId`) before its first id is returned, so a
//! restarted or newly elected leader resumes at the end of the last logged
//! range and never reissues an id.

use loadtxn_core::{Result, TxnId};
use loadtxn_durability::{EditLog, EditLogRecord};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Size of one reserved id range
pub const BATCH_ID_INTERVAL: i64 = 1000;

/// First id ever issued
pub const INITIAL_TXN_ID: TxnId = 1000;

#[derive(Debug)]
struct IdRange {
    next_id: TxnId,
    batch_end_id: TxnId,
}

/// Issues strictly increasing, globally unique transaction ids
pub struct TransactionIdGenerator {
    range: Mutex<IdRange>,
    edit_log: Arc<dyn EditLog>,
}

impl TransactionIdGenerator {
    /// Create a generator that logs reservations to `edit_log`
    pub fn new(edit_log: Arc<dyn EditLog>) -> Self {
        Self {
            range: Mutex::new(IdRange {
                next_id: INITIAL_TXN_ID,
                batch_end_id: INITIAL_TXN_ID,
            }),
            edit_log,
        }
    }

    /// Allocate the next id
    ///
    /// # Errors
    ///
    /// Fails if a new range had to be reserved and the reservation could not
    /// be logged. No id is consumed in that case.
    pub fn next_transaction_id(&self) -> Result<TxnId> {
        let mut range = self.range.lock();
        if range.next_id >= range.batch_end_id {
            let batch_end_id = range.batch_end_id + BATCH_ID_INTERVAL;
            self.edit_log
                .append(&EditLogRecord::SaveTransactionId { batch_end_id })?;
            debug!(target: "loadtxn::txn", batch_end_id, "Reserved transaction id range");
            range.batch_end_id = batch_end_id;
        }
        let id = range.next_id;
        range.next_id += 1;
        Ok(id)
    }

    /// The id the next call to `next_transaction_id` returns (no side effect)
    pub fn peek_next_transaction_id(&self) -> TxnId {
        self.range.lock().next_id
    }

    /// Exclusive bound of the reserved range
    pub fn batch_end_id(&self) -> TxnId {
        self.range.lock().batch_end_id
    }

    /// Apply a logged reservation (replay, checkpoint load)
    ///
    /// Allocation resumes at `batch_end_id`: ids left unused in the replayed
    /// range may already have been handed out by the previous leader.
    pub fn init_transaction_id(&self, batch_end_id: TxnId) {
        let mut range = self.range.lock();
        if batch_end_id > range.batch_end_id {
            range.batch_end_id = batch_end_id;
            range.next_id = batch_end_id;
        }
    }
}
