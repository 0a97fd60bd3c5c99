//! Process-wide transaction coordinator
//!
//! `GlobalTransactionMgr` is constructed once at startup and handed to every
//! request path. It owns:
//!
//! - the id generator shared by all databases (ids are globally unique)
//! - one [`DatabaseTransactionMgr`] per database, created on first use
//! - the fenced edit log every mutation is appended to
//!
//! Requests are routed by database id. Operations on different databases
//! never contend on a common lock beyond the id generator.

use crate::database_mgr::DatabaseTransactionMgr;
use crate::id_generator::TransactionIdGenerator;
use dashmap::DashMap;
use loadtxn_core::{
    Catalog, DbId, LoadJobSourceType, Result, TableId, TabletCommitInfo, TabletFailInfo,
    TransactionState, TransactionStateBatch, TransactionStatus, TxnCommitAttachment, TxnConfig,
    TxnCoordinator, TxnError, TxnId,
};
use loadtxn_durability::{EditLog, EditLogRecord, FencedEditLog, TxnCheckpoint};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Routes transaction operations to per-database managers
pub struct GlobalTransactionMgr {
    config: Arc<TxnConfig>,
    edit_log: Arc<FencedEditLog>,
    catalog: Arc<dyn Catalog>,
    id_generator: TransactionIdGenerator,
    db_mgrs: DashMap<DbId, Arc<DatabaseTransactionMgr>>,
}

impl GlobalTransactionMgr {
    /// Create a coordinator appending to `edit_log`
    ///
    /// # Errors
    ///
    /// Returns `Config` if the configuration is invalid.
    pub fn new(
        config: TxnConfig,
        edit_log: Arc<dyn EditLog>,
        catalog: Arc<dyn Catalog>,
    ) -> Result<Self> {
        config.validate()?;
        let edit_log = Arc::new(FencedEditLog::new(edit_log));
        Ok(Self {
            config: Arc::new(config),
            id_generator: TransactionIdGenerator::new(edit_log.clone()),
            edit_log,
            catalog,
            db_mgrs: DashMap::new(),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &TxnConfig {
        &self.config
    }

    /// Catalog consulted at commit and publish
    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    /// Shared id generator
    pub fn id_generator(&self) -> &TransactionIdGenerator {
        &self.id_generator
    }

    /// True after an edit log append failed; mutations are refused
    pub fn is_replication_fenced(&self) -> bool {
        self.edit_log.is_fenced()
    }

    /// Serve mutations again once replication is healthy
    pub fn resume_replication(&self) {
        self.edit_log.unfence();
    }

    // ========================================================================
    // Database managers
    // ========================================================================

    /// Manager of `db_id`, created if absent
    pub fn add_database_transaction_mgr(&self, db_id: DbId) -> Arc<DatabaseTransactionMgr> {
        self.db_mgrs
            .entry(db_id)
            .or_insert_with(|| {
                debug!(target: "loadtxn::txn", db_id, "Created database transaction manager");
                Arc::new(DatabaseTransactionMgr::new(
                    db_id,
                    self.config.clone(),
                    self.edit_log.clone(),
                    self.catalog.clone(),
                ))
            })
            .value()
            .clone()
    }

    /// Drop the manager of a dropped database, with all its transactions
    pub fn remove_database_transaction_mgr(&self, db_id: DbId) -> bool {
        let removed = self.db_mgrs.remove(&db_id).is_some();
        if removed {
            info!(target: "loadtxn::txn", db_id, "Removed database transaction manager");
        }
        removed
    }

    /// Manager of `db_id`
    ///
    /// # Errors
    ///
    /// `DatabaseNotFound` if no transaction was ever begun or replayed there.
    pub fn get_database_transaction_mgr(&self, db_id: DbId) -> Result<Arc<DatabaseTransactionMgr>> {
        self.db_mgrs
            .get(&db_id)
            .map(|mgr| mgr.value().clone())
            .ok_or(TxnError::DatabaseNotFound { db_id })
    }

    /// Ids of databases with a manager, ascending
    pub fn database_ids(&self) -> Vec<DbId> {
        let mut ids: Vec<DbId> = self.db_mgrs.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    // Snapshot of the managers so no map shard stays locked while we call
    // into them
    fn all_db_mgrs(&self) -> Vec<Arc<DatabaseTransactionMgr>> {
        let mut mgrs: Vec<_> = self.db_mgrs.iter().map(|e| e.value().clone()).collect();
        mgrs.sort_by_key(|m| m.db_id());
        mgrs
    }

    fn db_mgr_for_txn(&self, db_id: DbId, txn_id: TxnId) -> Result<Arc<DatabaseTransactionMgr>> {
        self.get_database_transaction_mgr(db_id)
            .map_err(|_| TxnError::TransactionNotFound { db_id, txn_id })
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Begin a transaction in `db_id`
    pub fn begin_transaction(
        &self,
        db_id: DbId,
        table_ids: Vec<TableId>,
        label: &str,
        coordinator: TxnCoordinator,
        source_type: LoadJobSourceType,
        timeout_sec: i64,
    ) -> Result<TxnId> {
        self.add_database_transaction_mgr(db_id).begin_transaction(
            &self.id_generator,
            table_ids,
            label,
            coordinator,
            source_type,
            timeout_sec,
        )
    }

    /// Commit a PREPARE transaction
    pub fn commit_transaction(
        &self,
        db_id: DbId,
        txn_id: TxnId,
        tablet_commit_infos: &[TabletCommitInfo],
        tablet_fail_infos: &[TabletFailInfo],
        attachment: Option<TxnCommitAttachment>,
    ) -> Result<()> {
        self.db_mgr_for_txn(db_id, txn_id)?.commit_transaction(
            txn_id,
            tablet_commit_infos,
            tablet_fail_infos,
            attachment,
        )
    }

    /// Make a COMMITTED transaction VISIBLE (idempotent)
    pub fn finish_transaction(&self, db_id: DbId, txn_id: TxnId, error_replicas: &[i64]) -> Result<()> {
        self.db_mgr_for_txn(db_id, txn_id)?
            .finish_transaction(txn_id, error_replicas)
    }

    /// Make every member of a publish batch VISIBLE
    pub fn finish_transaction_batch(
        &self,
        db_id: DbId,
        batch: &TransactionStateBatch,
        error_replicas: &[i64],
    ) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.get_database_transaction_mgr(db_id)?
            .finish_transaction_batch(batch, error_replicas)
    }

    /// Abort a running transaction
    pub fn abort_transaction(
        &self,
        db_id: DbId,
        txn_id: TxnId,
        reason: &str,
        attachment: Option<TxnCommitAttachment>,
    ) -> Result<()> {
        self.db_mgr_for_txn(db_id, txn_id)?
            .abort_transaction(txn_id, reason, attachment)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Status of a transaction in `db_id`, `Unknown` if not retained
    pub fn get_txn_state(&self, db_id: DbId, txn_id: TxnId) -> TransactionStatus {
        self.db_mgrs
            .get(&db_id)
            .map_or(TransactionStatus::Unknown, |mgr| mgr.get_txn_state(txn_id))
    }

    /// Status of a transaction in any database, `Unknown` if not retained
    pub fn get_txn_status(&self, txn_id: TxnId) -> TransactionStatus {
        self.all_db_mgrs()
            .iter()
            .map(|mgr| mgr.get_txn_state(txn_id))
            .find(|status| *status != TransactionStatus::Unknown)
            .unwrap_or(TransactionStatus::Unknown)
    }

    /// Copy of a transaction's state
    pub fn get_transaction_state(&self, db_id: DbId, txn_id: TxnId) -> Option<TransactionState> {
        self.db_mgrs
            .get(&db_id)
            .and_then(|mgr| mgr.get_transaction_state(txn_id))
    }

    /// Publish batches of every database, grouped by ascending database id
    pub fn get_ready_to_publish_txn_list_batch(&self) -> Vec<TransactionStateBatch> {
        self.all_db_mgrs()
            .iter()
            .flat_map(|mgr| mgr.get_ready_to_publish_txn_list_batch())
            .collect()
    }

    /// Expire finished transactions in every database
    pub fn remove_expired_txns(&self, now_ms: i64) -> usize {
        self.all_db_mgrs()
            .iter()
            .map(|mgr| mgr.remove_expired_txns(now_ms))
            .sum()
    }

    /// Running compaction transactions of every database: id -> start time
    pub fn get_lake_compaction_active_txn_stats(&self) -> HashMap<TxnId, i64> {
        self.all_db_mgrs()
            .iter()
            .flat_map(|mgr| mgr.get_lake_compaction_active_txn_map())
            .collect()
    }

    /// Smallest id of any running transaction, or the next id to be issued.
    ///
    /// Never larger than an in-flight id: the next id is read before the
    /// databases are scanned, and a begin holds its database's write lock
    /// from id allocation until the state is indexed.
    pub fn get_min_active_txn_id(&self) -> TxnId {
        let next = self.id_generator.peek_next_transaction_id();
        self.all_db_mgrs()
            .iter()
            .filter_map(|mgr| mgr.min_active_txn_id())
            .min()
            .map_or(next, |min| min.min(next))
    }

    /// Same as [`Self::get_min_active_txn_id`], compaction transactions only
    pub fn get_min_active_compaction_txn_id(&self) -> TxnId {
        let next = self.id_generator.peek_next_transaction_id();
        self.all_db_mgrs()
            .iter()
            .filter_map(|mgr| mgr.min_active_compaction_txn_id())
            .min()
            .map_or(next, |min| min.min(next))
    }

    // ========================================================================
    // Replay
    // ========================================================================

    /// Apply a replicated transaction state
    pub fn replay_upsert_transaction_state(&self, state: TransactionState) {
        self.add_database_transaction_mgr(state.db_id())
            .replay_upsert_transaction_state(state);
    }

    /// Apply a replicated publish batch
    pub fn replay_upsert_transaction_state_batch(&self, batch: TransactionStateBatch) {
        if let Some(db_id) = batch.db_id() {
            self.add_database_transaction_mgr(db_id)
                .replay_upsert_transaction_state_batch(batch);
        }
    }

    /// Apply a replicated id reservation
    pub fn replay_save_transaction_id(&self, batch_end_id: TxnId) {
        self.id_generator.init_transaction_id(batch_end_id);
    }

    /// Apply any edit log record
    pub fn apply_edit_log_record(&self, record: EditLogRecord) {
        match record {
            EditLogRecord::SaveTransactionId { batch_end_id } => {
                self.replay_save_transaction_id(batch_end_id)
            }
            EditLogRecord::UpsertTransactionState(state) => {
                self.replay_upsert_transaction_state(state)
            }
            EditLogRecord::UpsertTransactionStateBatch(batch) => {
                self.replay_upsert_transaction_state_batch(batch)
            }
        }
    }

    // ========================================================================
    // Checkpoint
    // ========================================================================

    /// Image of every retained transaction plus the id reservation bound
    pub fn checkpoint(&self) -> TxnCheckpoint {
        TxnCheckpoint {
            next_txn_id: self.id_generator.batch_end_id(),
            states: self
                .all_db_mgrs()
                .iter()
                .flat_map(|mgr| mgr.all_transaction_states())
                .collect(),
        }
    }

    /// Rebuild indexes from a checkpoint image
    pub fn load_checkpoint(&self, checkpoint: TxnCheckpoint) {
        let txns = checkpoint.states.len();
        self.id_generator.init_transaction_id(checkpoint.next_txn_id);
        for state in checkpoint.states {
            self.replay_upsert_transaction_state(state);
        }
        info!(
            target: "loadtxn::replay",
            txns,
            next_txn_id = checkpoint.next_txn_id,
            "Loaded checkpoint"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use loadtxn_durability::MemoryEditLog;

    fn setup() -> (Arc<MemoryEditLog>, Arc<MemoryCatalog>, GlobalTransactionMgr) {
        let log = MemoryEditLog::shared();
        let catalog = Arc::new(MemoryCatalog::new());
        for db in [1, 2] {
            catalog.add_partition(db, 10, 100, 1);
            catalog.add_tablet(db, 10, 100, db * 1000, 1);
        }
        let mgr =
            GlobalTransactionMgr::new(TxnConfig::for_testing(), log.clone(), catalog.clone()).unwrap();
        (log, catalog, mgr)
    }

    fn try_begin(mgr: &GlobalTransactionMgr, db: DbId, label: &str) -> Result<TxnId> {
        mgr.begin_transaction(
            db,
            vec![10],
            label,
            TxnCoordinator::fe("fe1"),
            LoadJobSourceType::BackendStreaming,
            60,
        )
    }

    fn begin(mgr: &GlobalTransactionMgr, db: DbId, label: &str, source: LoadJobSourceType) -> TxnId {
        mgr.begin_transaction(db, vec![10], label, TxnCoordinator::fe("fe1"), source, 60)
            .unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = TxnConfig::for_testing().with_max_running_txn_num_per_db(0);
        assert!(matches!(
            GlobalTransactionMgr::new(config, MemoryEditLog::shared(), Arc::new(MemoryCatalog::new())),
            Err(TxnError::Config(_))
        ));
    }

    #[test]
    fn test_ids_are_global() {
        let (_, _, mgr) = setup();
        let a = begin(&mgr, 1, "l", LoadJobSourceType::BackendStreaming);
        let b = begin(&mgr, 2, "l", LoadJobSourceType::BackendStreaming);
        assert!(b > a);
        assert_eq!(mgr.database_ids(), vec![1, 2]);
        assert_eq!(mgr.get_txn_status(b), TransactionStatus::Prepare);
        assert_eq!(mgr.get_txn_state(1, b), TransactionStatus::Unknown);
        assert_eq!(mgr.get_txn_status(12134), TransactionStatus::Unknown);
    }

    #[test]
    fn test_unknown_database() {
        let (_, _, mgr) = setup();
        assert!(mgr
            .commit_transaction(7, 1000, &[], &[], None)
            .unwrap_err()
            .is_not_found());
        assert!(mgr.abort_transaction(7, 1000, "", None).unwrap_err().is_not_found());
        assert!(matches!(
            mgr.get_database_transaction_mgr(7),
            Err(TxnError::DatabaseNotFound { db_id: 7 })
        ));
    }

    #[test]
    fn test_min_active_watermark() {
        let (_, _, mgr) = setup();
        assert_eq!(mgr.get_min_active_txn_id(), mgr.id_generator().peek_next_transaction_id());

        let a = begin(&mgr, 1, "a", LoadJobSourceType::BackendStreaming);
        let c = begin(&mgr, 2, "c", LoadJobSourceType::LakeCompaction);
        assert_eq!(mgr.get_min_active_txn_id(), a);
        assert_eq!(mgr.get_min_active_compaction_txn_id(), c);

        mgr.abort_transaction(1, a, "", None).unwrap();
        assert_eq!(mgr.get_min_active_txn_id(), c);
        mgr.abort_transaction(2, c, "", None).unwrap();
        assert_eq!(mgr.get_min_active_txn_id(), c + 1);
        assert_eq!(mgr.get_lake_compaction_active_txn_stats().len(), 0);
    }

    #[test]
    fn test_follower_converges() {
        let (log, _, leader) = setup();
        let a = begin(&leader, 1, "a", LoadJobSourceType::BackendStreaming);
        leader
            .commit_transaction(1, a, &[TabletCommitInfo::new(1000, 1)], &[], None)
            .unwrap();
        leader.finish_transaction(1, a, &[]).unwrap();
        let b = begin(&leader, 2, "b", LoadJobSourceType::RoutineLoadTask);

        let follower_catalog = Arc::new(MemoryCatalog::new());
        follower_catalog.add_partition(1, 10, 100, 1);
        let follower = GlobalTransactionMgr::new(
            TxnConfig::for_testing(),
            MemoryEditLog::shared(),
            follower_catalog.clone(),
        )
        .unwrap();
        for record in log.records() {
            follower.apply_edit_log_record(record);
        }

        assert_eq!(follower.get_txn_state(1, a), TransactionStatus::Visible);
        assert_eq!(follower.get_txn_state(2, b), TransactionStatus::Prepare);
        assert_eq!(follower_catalog.visible_version(1, 10, 100).unwrap().0, 2);
        assert_eq!(
            follower
                .get_database_transaction_mgr(2)
                .unwrap()
                .get_running_routine_load_txn_nums(),
            1
        );
        assert!(follower.id_generator().peek_next_transaction_id() > b);
    }

    #[test]
    fn test_fenced_after_append_failure() {
        let (log, _, mgr) = setup();
        begin(&mgr, 1, "a", LoadJobSourceType::BackendStreaming);
        log.set_fail_appends(true);
        assert!(try_begin(&mgr, 1, "b").is_err());
        log.set_fail_appends(false);

        let err = try_begin(&mgr, 1, "c").unwrap_err();
        assert!(err.is_replication_failure());
        assert!(mgr.is_replication_fenced());

        mgr.resume_replication();
        begin(&mgr, 1, "c", LoadJobSourceType::BackendStreaming);
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let (_, catalog, mgr) = setup();
        let a = begin(&mgr, 1, "a", LoadJobSourceType::BackendStreaming);
        let b = begin(&mgr, 2, "b", LoadJobSourceType::BackendStreaming);
        mgr.abort_transaction(2, b, "user", None).unwrap();

        let image = mgr.checkpoint();
        assert_eq!(image.states.len(), 2);

        let restored =
            GlobalTransactionMgr::new(TxnConfig::for_testing(), MemoryEditLog::shared(), catalog)
                .unwrap();
        restored.load_checkpoint(image);
        assert_eq!(restored.get_txn_state(1, a), TransactionStatus::Prepare);
        assert_eq!(restored.get_txn_state(2, b), TransactionStatus::Aborted);
        let next = try_begin(&restored, 1, "n").unwrap();
        assert!(next > b);
    }
}
