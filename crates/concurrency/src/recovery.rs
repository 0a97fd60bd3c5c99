//! Edit log replay and restart recovery
//!
//! Replay trusts the leader: records are applied in log order through the
//! managers' replay entry points, with no label, quorum or admission checks.
//! Applying a record twice leaves the same indexes, so a checkpoint followed
//! by the full log converges to the same state as the log alone.
//!
//! ## Recovery Procedure
//!
//! 1. Load the checkpoint image (if one exists)
//! 2. Open the edit log, cutting a partial tail record
//! 3. Replay every complete record
//! 4. Hand back a coordinator that appends to the same log

use crate::global_mgr::GlobalTransactionMgr;
use loadtxn_core::{Catalog, Result, TxnConfig, TxnId};
use loadtxn_durability::{EditLogRecord, FileEditLog, TxnCheckpoint};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Statistics from replaying an edit log
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Records applied
    pub records_applied: usize,
    /// Transaction states applied (a batch counts each member)
    pub txn_states_applied: usize,
    /// Id reservations applied
    pub id_reservations: usize,
    /// Largest transaction id seen
    pub max_txn_id: Option<TxnId>,
}

/// Apply `records` to `mgr` in order
pub fn replay_edit_log<I>(mgr: &GlobalTransactionMgr, records: I) -> ReplayStats
where
    I: IntoIterator<Item = EditLogRecord>,
{
    let mut stats = ReplayStats::default();
    for record in records {
        match &record {
            EditLogRecord::SaveTransactionId { .. } => stats.id_reservations += 1,
            other => {
                let txn_ids = other.txn_ids();
                stats.txn_states_applied += txn_ids.len();
                stats.max_txn_id = txn_ids.into_iter().chain(stats.max_txn_id).max();
            }
        }
        mgr.apply_edit_log_record(record);
        stats.records_applied += 1;
    }
    stats
}

/// Result of [`RecoveryCoordinator::recover`]
pub struct RecoveryResult {
    /// Coordinator with every recovered transaction indexed
    pub mgr: GlobalTransactionMgr,
    /// The edit log new mutations are appended to
    pub edit_log: Arc<FileEditLog>,
    /// Replay statistics of the log
    pub stats: ReplayStats,
    /// Whether a checkpoint image was loaded
    pub from_checkpoint: bool,
}

/// Rebuilds a coordinator from disk after a restart
pub struct RecoveryCoordinator {
    log_path: PathBuf,
    checkpoint_path: Option<PathBuf>,
}

impl RecoveryCoordinator {
    /// Recover from the edit log at `log_path`
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
            checkpoint_path: None,
        }
    }

    /// Load this checkpoint image before replaying the log
    pub fn with_checkpoint_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint_path = Some(path.into());
        self
    }

    /// Perform recovery
    ///
    /// # Errors
    ///
    /// - the checkpoint or log cannot be read, or is corrupt
    /// - the configuration is invalid
    pub fn recover(&self, config: TxnConfig, catalog: Arc<dyn Catalog>) -> Result<RecoveryResult> {
        let checkpoint = match &self.checkpoint_path {
            Some(path) => TxnCheckpoint::read_from(path)?,
            None => None,
        };
        let (log, records) = FileEditLog::recover(&self.log_path, config.edit_log_durability.into())?;
        let edit_log = Arc::new(log);
        let mgr = GlobalTransactionMgr::new(config, edit_log.clone(), catalog)?;

        let from_checkpoint = checkpoint.is_some();
        if let Some(checkpoint) = checkpoint {
            mgr.load_checkpoint(checkpoint);
        }
        let stats = replay_edit_log(&mgr, records);

        info!(
            target: "loadtxn::replay",
            log = %self.log_path.display(),
            from_checkpoint,
            records = stats.records_applied,
            txn_states = stats.txn_states_applied,
            "Recovery complete"
        );
        Ok(RecoveryResult {
            mgr,
            edit_log,
            stats,
            from_checkpoint,
        })
    }
}
