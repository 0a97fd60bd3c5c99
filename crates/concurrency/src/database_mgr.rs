//! Per-database transaction manager
//!
//! Owns every transaction of one database: the running and finished indexes,
//! the label index, admission counters, the lake compaction map and the
//! publish dependency graph.
//!
//! ## Locking
//!
//! One `RwLock` guards all of it. Mutations (begin, commit, finish, abort,
//! expiry, replay) take the write lock for their whole duration, including
//! the edit log append, so the log order of a database is the order in which
//! its transitions were applied. Queries take the read lock.
//!
//! ## Two entry points per mutation
//!
//! - Leader path (`begin_transaction`, `commit_transaction`, ...): validate,
//!   build the new state, append it to the edit log, then apply it.
//! - Replay path (`replay_upsert_transaction_state*`): apply a state the
//!   leader already decided on, without validation.
//!
//! Both end in the same index update and catalog update, so a follower that
//! replays the leader's log converges to the leader's indexes.

use crate::graph::TransactionGraph;
use crate::id_generator::TransactionIdGenerator;
use loadtxn_core::{
    now_ms, Catalog, DbId, LoadJobSourceType, PartitionCommitInfo, PartitionId, Result,
    TableCommitInfo, TableId, TabletCommitInfo, TabletFailInfo, TransactionState,
    TransactionStateBatch, TransactionStatus, TxnCommitAttachment, TxnConfig, TxnCoordinator,
    TxnError, TxnId, TxnSourceType,
};
use loadtxn_durability::{EditLog, EditLogRecord};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One-row summary of a transaction, for operators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnInfo {
    /// Transaction id
    pub txn_id: TxnId,
    /// Label
    pub label: String,
    /// Rendered coordinator, e.g. `BE: 10.0.0.1`
    pub coordinator: String,
    /// Current status
    pub status: TransactionStatus,
    /// Load type
    pub source_type: LoadJobSourceType,
    /// Begin time (ms)
    pub prepare_time: i64,
    /// Commit time (ms), -1 if not committed
    pub commit_time: i64,
    /// Visible/abort time (ms), -1 if still running
    pub finish_time: i64,
    /// Abort reason
    pub reason: String,
    /// Replicas that failed to publish
    pub error_replicas_count: usize,
    /// Timeout (ms)
    pub timeout_ms: i64,
    /// Tables written
    pub table_ids: Vec<TableId>,
}

impl From<&TransactionState> for TxnInfo {
    fn from(state: &TransactionState) -> Self {
        Self {
            txn_id: state.transaction_id(),
            label: state.label().to_string(),
            coordinator: state.coordinator().to_string(),
            status: state.status(),
            source_type: state.source_type(),
            prepare_time: state.prepare_time(),
            commit_time: state.commit_time(),
            finish_time: state.finish_time(),
            reason: state.reason().to_string(),
            error_replicas_count: state.error_replicas().len(),
            timeout_ms: state.timeout_ms(),
            table_ids: state.table_id_list().to_vec(),
        }
    }
}

#[derive(Debug, Default)]
struct DbTxnIndex {
    running: HashMap<TxnId, TransactionState>,
    finished: HashMap<TxnId, TransactionState>,
    label_to_txn_ids: HashMap<String, BTreeSet<TxnId>>,
    // Counted against max_running_txn_num_per_db
    running_txn_nums: usize,
    running_routine_load_txn_nums: usize,
    running_by_source: HashMap<LoadJobSourceType, usize>,
    lake_compaction_txns: HashMap<TxnId, i64>,
    graph: TransactionGraph,
}

impl DbTxnIndex {
    fn get(&self, txn_id: TxnId) -> Option<&TransactionState> {
        self.running
            .get(&txn_id)
            .or_else(|| self.finished.get(&txn_id))
    }

    fn status_of(&self, txn_id: TxnId) -> TransactionStatus {
        self.get(txn_id)
            .map_or(TransactionStatus::Unknown, |s| s.status())
    }

    fn track_running(&mut self, state: &TransactionState) {
        match state.source_type() {
            LoadJobSourceType::RoutineLoadTask => self.running_routine_load_txn_nums += 1,
            LoadJobSourceType::LakeCompaction => {
                self.lake_compaction_txns
                    .insert(state.transaction_id(), state.prepare_time());
            }
            _ => self.running_txn_nums += 1,
        }
        *self.running_by_source.entry(state.source_type()).or_default() += 1;
    }

    fn untrack_running(&mut self, state: &TransactionState) {
        match state.source_type() {
            LoadJobSourceType::RoutineLoadTask => {
                self.running_routine_load_txn_nums =
                    self.running_routine_load_txn_nums.saturating_sub(1)
            }
            LoadJobSourceType::LakeCompaction => {
                self.lake_compaction_txns.remove(&state.transaction_id());
            }
            _ => self.running_txn_nums = self.running_txn_nums.saturating_sub(1),
        }
        if let Some(count) = self.running_by_source.get_mut(&state.source_type()) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.running_by_source.remove(&state.source_type());
            }
        }
    }

    fn unindex_label(&mut self, label: &str, txn_id: TxnId) {
        if let Some(ids) = self.label_to_txn_ids.get_mut(label) {
            ids.remove(&txn_id);
            if ids.is_empty() {
                self.label_to_txn_ids.remove(label);
            }
        }
    }

    /// Install a state in every index. Shared by the leader and replay paths.
    fn upsert(&mut self, state: TransactionState) {
        let txn_id = state.transaction_id();
        self.label_to_txn_ids
            .entry(state.label().to_string())
            .or_default()
            .insert(txn_id);

        if state.is_running() {
            if self.finished.contains_key(&txn_id) {
                warn!(
                    target: "loadtxn::replay",
                    db_id = state.db_id(),
                    txn_id,
                    status = %state.status(),
                    "Ignoring running state of a finished transaction"
                );
                return;
            }
            if state.status() == TransactionStatus::Committed {
                self.graph.add(txn_id, state.table_id_list());
            }
            if !self.running.contains_key(&txn_id) {
                self.track_running(&state);
            }
            self.running.insert(txn_id, state);
        } else {
            if let Some(prev) = self.running.remove(&txn_id) {
                self.untrack_running(&prev);
                self.graph.remove(txn_id);
            }
            self.finished.insert(txn_id, state);
        }
    }

    fn running_limit_check(
        &self,
        db_id: DbId,
        source_type: LoadJobSourceType,
        limit: usize,
    ) -> Result<()> {
        if source_type.is_exempt_from_running_limit() {
            return Ok(());
        }
        if self.running_txn_nums >= limit {
            return Err(TxnError::RunningTxnExceedLimit {
                db_id,
                running: self.running_txn_nums,
                limit,
            });
        }
        Ok(())
    }
}

/// Transaction manager of one database
pub struct DatabaseTransactionMgr {
    db_id: DbId,
    config: Arc<TxnConfig>,
    edit_log: Arc<dyn EditLog>,
    catalog: Arc<dyn Catalog>,
    index: RwLock<DbTxnIndex>,
}

impl DatabaseTransactionMgr {
    /// Create an empty manager
    pub fn new(
        db_id: DbId,
        config: Arc<TxnConfig>,
        edit_log: Arc<dyn EditLog>,
        catalog: Arc<dyn Catalog>,
    ) -> Self {
        Self {
            db_id,
            config,
            edit_log,
            catalog,
            index: RwLock::new(DbTxnIndex::default()),
        }
    }

    /// Database id
    pub fn db_id(&self) -> DbId {
        self.db_id
    }

    fn not_found(&self, txn_id: TxnId) -> TxnError {
        TxnError::TransactionNotFound {
            db_id: self.db_id,
            txn_id,
        }
    }

    // ========================================================================
    // Leader path
    // ========================================================================

    /// Begin a transaction, returning its id.
    ///
    /// A retried begin (same label, tables, source and coordinator while the
    /// first attempt is still PREPARE) returns the existing id.
    ///
    /// # Errors
    ///
    /// - `InvalidOperation` for an empty label or table list
    /// - `InvalidTimeout` if `timeout_sec` is outside the configured window
    /// - `DuplicateLabel` if the label is held by another transaction
    /// - `RunningTxnExceedLimit` when a counted source is at the cap
    /// - edit log errors; nothing is indexed in that case
    pub fn begin_transaction(
        &self,
        id_generator: &TransactionIdGenerator,
        table_ids: Vec<TableId>,
        label: &str,
        coordinator: TxnCoordinator,
        source_type: LoadJobSourceType,
        timeout_sec: i64,
    ) -> Result<TxnId> {
        if label.is_empty() {
            return Err(TxnError::InvalidOperation("label must not be empty".to_string()));
        }
        if table_ids.is_empty() {
            return Err(TxnError::InvalidOperation(format!(
                "transaction {} must write at least one table",
                label
            )));
        }
        self.config.check_timeout(timeout_sec)?;

        let mut index = self.index.write();

        if let Some(ids) = index.label_to_txn_ids.get(label) {
            for &existing_id in ids.iter().rev() {
                let Some(existing) = index.get(existing_id) else {
                    continue;
                };
                match existing.status() {
                    TransactionStatus::Aborted | TransactionStatus::Unknown => continue,
                    TransactionStatus::Prepare
                        if Self::is_same_request(existing, &table_ids, &coordinator, source_type) =>
                    {
                        debug!(
                            target: "loadtxn::txn",
                            db_id = self.db_id,
                            txn_id = existing_id,
                            label,
                            "Begin retried, returning existing transaction"
                        );
                        return Ok(existing_id);
                    }
                    _ => {
                        return Err(TxnError::DuplicateLabel {
                            db_id: self.db_id,
                            label: label.to_string(),
                            existing_txn_id: existing_id,
                        })
                    }
                }
            }
        }

        index.running_limit_check(
            self.db_id,
            source_type,
            self.config.max_running_txn_num_per_db,
        )?;

        let txn_id = id_generator.next_transaction_id()?;
        let state = TransactionState::new(
            self.db_id,
            table_ids,
            txn_id,
            label,
            coordinator,
            source_type,
            timeout_sec.saturating_mul(1000),
            now_ms(),
        );
        self.log_and_apply(&mut index, state)?;

        debug!(
            target: "loadtxn::txn",
            db_id = self.db_id,
            txn_id,
            label,
            source = source_type.as_str(),
            "Begin transaction"
        );
        Ok(txn_id)
    }

    fn is_same_request(
        existing: &TransactionState,
        table_ids: &[TableId],
        coordinator: &TxnCoordinator,
        source_type: LoadJobSourceType,
    ) -> bool {
        let existing_tables: BTreeSet<_> = existing.table_id_list().iter().collect();
        let requested_tables: BTreeSet<_> = table_ids.iter().collect();
        existing_tables == requested_tables
            && existing.source_type() == source_type
            && existing.coordinator() == coordinator
    }

    /// Commit a PREPARE transaction.
    ///
    /// Tables dropped since begin leave the transaction's table set. Every
    /// tablet of the remaining tables must reach write quorum; otherwise the
    /// transaction is aborted and `QuorumNotMet` returned.
    ///
    /// # Errors
    ///
    /// - `TransactionNotFound` unless the transaction is PREPARE
    /// - `StaleTransaction` if it outlived its timeout
    /// - `QuorumNotMet` (the transaction is aborted)
    /// - edit log errors
    pub fn commit_transaction(
        &self,
        txn_id: TxnId,
        tablet_commit_infos: &[TabletCommitInfo],
        tablet_fail_infos: &[TabletFailInfo],
        attachment: Option<TxnCommitAttachment>,
    ) -> Result<()> {
        let mut index = self.index.write();
        let state = match index.running.get(&txn_id) {
            Some(state) if state.status() == TransactionStatus::Prepare => state,
            _ => return Err(self.not_found(txn_id)),
        };

        let now = now_ms();
        if state.is_timeout(now) {
            return Err(TxnError::StaleTransaction {
                db_id: self.db_id,
                txn_id,
                label: state.label().to_string(),
                timeout_ms: state.timeout_ms(),
            });
        }

        let mut new_state = state.clone();
        for table_id in state.table_id_list() {
            if !self.catalog.table_exists(self.db_id, *table_id) {
                warn!(
                    target: "loadtxn::txn",
                    db_id = self.db_id,
                    txn_id,
                    table_id,
                    "Table dropped before commit, removing it from transaction"
                );
                new_state.remove_table(*table_id);
            }
        }

        let partitions = match self.check_quorum(&new_state, tablet_commit_infos, tablet_fail_infos)
        {
            Ok(partitions) => partitions,
            Err(err) => {
                warn!(
                    target: "loadtxn::txn",
                    db_id = self.db_id,
                    txn_id,
                    label = new_state.label(),
                    error = %err,
                    "Commit failed quorum, aborting transaction"
                );
                self.abort_locked(&mut index, txn_id, &err.to_string(), None)?;
                return Err(err);
            }
        };

        let table_ids = new_state.table_id_list().to_vec();
        for table_id in table_ids {
            let mut table_info = TableCommitInfo::new(table_id);
            for &partition_id in partitions.get(&table_id).into_iter().flatten() {
                match self
                    .catalog
                    .partition_version(self.db_id, table_id, partition_id)
                {
                    Ok(version) => {
                        table_info.partition_commit_infos.insert(
                            partition_id,
                            PartitionCommitInfo {
                                partition_id,
                                version: version.next_version,
                                version_time: now,
                            },
                        );
                    }
                    Err(e) => warn!(
                        target: "loadtxn::txn",
                        db_id = self.db_id,
                        txn_id,
                        table_id,
                        partition_id,
                        error = %e,
                        "Partition missing at commit, skipping"
                    ),
                }
            }
            new_state.put_table_commit_info(table_info);
        }

        if attachment.is_some() {
            new_state.set_commit_attachment(attachment);
        }
        let moved = new_state.transition(TransactionStatus::Committed, now);
        debug_assert!(moved, "PREPARE -> COMMITTED rejected for txn {}", txn_id);
        let label = new_state.label().to_string();
        self.log_and_apply(&mut index, new_state)?;

        info!(
            target: "loadtxn::txn",
            db_id = self.db_id,
            txn_id,
            label = %label,
            "Transaction committed"
        );
        Ok(())
    }

    /// Group successful replicas per tablet and check quorum.
    ///
    /// Returns table -> partitions written.
    fn check_quorum(
        &self,
        state: &TransactionState,
        tablet_commit_infos: &[TabletCommitInfo],
        tablet_fail_infos: &[TabletFailInfo],
    ) -> Result<BTreeMap<TableId, BTreeSet<PartitionId>>> {
        let failed: HashSet<_> = tablet_fail_infos
            .iter()
            .map(|f| (f.tablet_id, f.backend_id))
            .collect();
        let mut success_per_tablet: BTreeMap<_, BTreeSet<_>> = BTreeMap::new();
        for info in tablet_commit_infos {
            let replicas = success_per_tablet.entry(info.tablet_id).or_default();
            if !failed.contains(&(info.tablet_id, info.backend_id)) {
                replicas.insert(info.backend_id);
            }
        }
        for info in tablet_fail_infos {
            success_per_tablet.entry(info.tablet_id).or_default();
        }

        let mut partitions: BTreeMap<TableId, BTreeSet<PartitionId>> = BTreeMap::new();
        for (tablet_id, replicas) in success_per_tablet {
            let Some(meta) = self.catalog.tablet_meta(tablet_id) else {
                debug!(
                    target: "loadtxn::txn",
                    db_id = self.db_id,
                    txn_id = state.transaction_id(),
                    tablet_id,
                    "Ignoring unknown tablet"
                );
                continue;
            };
            if meta.db_id != self.db_id || !state.contains_table(meta.table_id) {
                continue;
            }
            if replicas.len() < meta.quorum() {
                return Err(TxnError::QuorumNotMet {
                    db_id: self.db_id,
                    txn_id: state.transaction_id(),
                    label: state.label().to_string(),
                    tablet_id,
                    success_replicas: replicas.len(),
                    quorum: meta.quorum(),
                });
            }
            partitions
                .entry(meta.table_id)
                .or_default()
                .insert(meta.partition_id);
        }
        Ok(partitions)
    }

    /// Make a COMMITTED transaction VISIBLE.
    ///
    /// Finishing a VISIBLE transaction again is a no-op.
    ///
    /// # Errors
    ///
    /// - `TransactionNotCommitted` if the transaction is PREPARE
    /// - `TransactionNotFound` if it is unknown or ABORTED
    /// - `PublishNotReady` while an earlier commit on a shared table is not
    ///   yet VISIBLE
    /// - edit log errors
    pub fn finish_transaction(&self, txn_id: TxnId, error_replicas: &[i64]) -> Result<()> {
        let mut index = self.index.write();
        let Some(new_state) = self.prepare_finish(&index, txn_id, error_replicas, &HashSet::new())?
        else {
            return Ok(());
        };
        self.log_and_apply(&mut index, new_state)?;
        info!(
            target: "loadtxn::publish",
            db_id = self.db_id,
            txn_id,
            "Transaction visible"
        );
        Ok(())
    }

    /// Finish every member of a publish batch under one lock and one record.
    ///
    /// Members already VISIBLE are skipped. Validation happens for the whole
    /// batch before anything is logged.
    pub fn finish_transaction_batch(
        &self,
        batch: &TransactionStateBatch,
        error_replicas: &[i64],
    ) -> Result<()> {
        if let Some(db_id) = batch.db_id() {
            if db_id != self.db_id {
                return Err(TxnError::InvalidOperation(format!(
                    "batch of db {} sent to db {}",
                    db_id, self.db_id
                )));
            }
        }

        let mut index = self.index.write();
        let mut new_states = Vec::with_capacity(batch.size());
        let mut published_before: HashSet<TxnId> = HashSet::new();
        for txn_id in batch.txn_ids() {
            if let Some(new_state) =
                self.prepare_finish(&index, txn_id, error_replicas, &published_before)?
            {
                new_states.push(new_state);
            }
            published_before.insert(txn_id);
        }
        if new_states.is_empty() {
            return Ok(());
        }

        let finished = TransactionStateBatch::new(new_states);
        self.edit_log
            .append(&EditLogRecord::UpsertTransactionStateBatch(finished.clone()))?;
        let txn_ids = finished.txn_ids();
        for state in finished.into_states() {
            self.apply(&mut index, state);
        }

        info!(
            target: "loadtxn::publish",
            db_id = self.db_id,
            txns = ?txn_ids,
            "Transaction batch visible"
        );
        Ok(())
    }

    /// Build the VISIBLE state of `txn_id`, or None if it already is.
    ///
    /// Every earlier committer on a shared table must be VISIBLE already or
    /// be published ahead of it in the same batch (`published_before`).
    fn prepare_finish(
        &self,
        index: &DbTxnIndex,
        txn_id: TxnId,
        error_replicas: &[i64],
        published_before: &HashSet<TxnId>,
    ) -> Result<Option<TransactionState>> {
        let state = match index.get(txn_id) {
            Some(state) => state,
            None => return Err(self.not_found(txn_id)),
        };
        match state.status() {
            TransactionStatus::Visible => Ok(None),
            TransactionStatus::Committed => {
                let blocking = index.graph.predecessors(txn_id).and_then(|preds| {
                    preds
                        .iter()
                        .find(|pred| !published_before.contains(pred))
                        .copied()
                });
                if let Some(blocking_txn_id) = blocking {
                    return Err(TxnError::PublishNotReady {
                        db_id: self.db_id,
                        txn_id,
                        blocking_txn_id,
                    });
                }
                let mut new_state = state.clone();
                new_state.add_error_replicas(error_replicas.iter().copied());
                let moved = new_state.transition(TransactionStatus::Visible, now_ms());
                debug_assert!(moved, "COMMITTED -> VISIBLE rejected for txn {}", txn_id);
                Ok(Some(new_state))
            }
            TransactionStatus::Prepare => Err(TxnError::TransactionNotCommitted {
                db_id: self.db_id,
                txn_id,
                status: state.status(),
            }),
            TransactionStatus::Aborted | TransactionStatus::Unknown => {
                Err(self.not_found(txn_id))
            }
        }
    }

    /// Abort a running transaction.
    ///
    /// # Errors
    ///
    /// `TransactionNotFound` unless the transaction is PREPARE or COMMITTED.
    pub fn abort_transaction(
        &self,
        txn_id: TxnId,
        reason: &str,
        attachment: Option<TxnCommitAttachment>,
    ) -> Result<()> {
        let mut index = self.index.write();
        self.abort_locked(&mut index, txn_id, reason, attachment)
    }

    fn abort_locked(
        &self,
        index: &mut DbTxnIndex,
        txn_id: TxnId,
        reason: &str,
        attachment: Option<TxnCommitAttachment>,
    ) -> Result<()> {
        let mut new_state = match index.running.get(&txn_id) {
            Some(state) => state.clone(),
            None => return Err(self.not_found(txn_id)),
        };
        new_state.set_reason(reason);
        if attachment.is_some() {
            new_state.set_commit_attachment(attachment);
        }
        let moved = new_state.transition(TransactionStatus::Aborted, now_ms());
        debug_assert!(moved, "running -> ABORTED rejected for txn {}", txn_id);
        self.log_and_apply(index, new_state)?;

        info!(
            target: "loadtxn::txn",
            db_id = self.db_id,
            txn_id,
            reason,
            "Transaction aborted"
        );
        Ok(())
    }

    /// Append the new state, then install it
    fn log_and_apply(&self, index: &mut DbTxnIndex, state: TransactionState) -> Result<()> {
        self.edit_log
            .append(&EditLogRecord::UpsertTransactionState(state.clone()))?;
        self.apply(index, state);
        Ok(())
    }

    fn apply(&self, index: &mut DbTxnIndex, state: TransactionState) {
        let prev = index.status_of(state.transaction_id());
        self.apply_catalog_effects(prev, &state);
        index.upsert(state);
    }

    /// Version bookkeeping of a transition: commit consumes the versions
    /// assigned to the transaction, visible publishes them.
    fn apply_catalog_effects(&self, prev: TransactionStatus, state: &TransactionState) {
        let status = state.status();
        if status == prev {
            return;
        }
        for (&table_id, table_info) in state.table_commit_infos() {
            for (&partition_id, partition) in &table_info.partition_commit_infos {
                let result = match status {
                    TransactionStatus::Committed => self.catalog.commit_partition_version(
                        self.db_id,
                        table_id,
                        partition_id,
                        partition.version,
                    ),
                    TransactionStatus::Visible => self.catalog.publish_partition_version(
                        self.db_id,
                        table_id,
                        partition_id,
                        partition.version,
                        partition.version_time,
                    ),
                    _ => return,
                };
                if let Err(e) = result {
                    warn!(
                        target: "loadtxn::publish",
                        db_id = self.db_id,
                        txn_id = state.transaction_id(),
                        table_id,
                        partition_id,
                        status = %status,
                        error = %e,
                        "Partition gone, treating it as published"
                    );
                }
            }
        }
    }

    /// Remove a dropped table from a running transaction.
    ///
    /// Not logged: followers learn about the drop from their own catalog, and
    /// a later commit record carries the reduced table set.
    pub fn remove_table_from_transaction(&self, txn_id: TxnId, table_id: TableId) -> Result<bool> {
        let mut index = self.index.write();
        let state = index
            .running
            .get_mut(&txn_id)
            .ok_or_else(|| self.not_found(txn_id))?;
        let removed = state.remove_table(table_id);
        if removed {
            debug!(
                target: "loadtxn::txn",
                db_id = self.db_id,
                txn_id,
                table_id,
                "Removed dropped table from transaction"
            );
        }
        Ok(removed)
    }

    // ========================================================================
    // Replay path
    // ========================================================================

    /// Apply a replicated state without validation
    pub fn replay_upsert_transaction_state(&self, state: TransactionState) {
        let mut index = self.index.write();
        debug!(
            target: "loadtxn::replay",
            db_id = self.db_id,
            txn_id = state.transaction_id(),
            status = %state.status(),
            "Replay transaction state"
        );
        self.apply(&mut index, state);
    }

    /// Apply a replicated publish batch without validation
    pub fn replay_upsert_transaction_state_batch(&self, batch: TransactionStateBatch) {
        let mut index = self.index.write();
        for state in batch.into_states() {
            self.apply(&mut index, state);
        }
    }

    // ========================================================================
    // Publish selection and expiry
    // ========================================================================

    /// Group COMMITTED transactions into publish batches, in publish order.
    ///
    /// Candidates are visited in dependency order, smaller ids first among
    /// independent ones. A transaction joins the current batch once all of
    /// its predecessors are placed. The batch is closed before a candidate
    /// that shares a table with a member of larger id (commit order differs
    /// from id order there), and at `transaction_publish_batch_max_size`. A
    /// transaction whose tables were all dropped is published alone, and
    /// only when nothing precedes it.
    pub fn get_ready_to_publish_txn_list_batch(&self) -> Vec<TransactionStateBatch> {
        let index = self.index.read();
        let max_size = self.config.transaction_publish_batch_max_size.max(1);
        let mut placed: HashSet<TxnId> = HashSet::new();
        let mut batches = Vec::new();
        let mut current: Vec<TransactionState> = Vec::new();
        // Largest member id per table in the current batch
        let mut current_tables: HashMap<TableId, TxnId> = HashMap::new();

        for txn_id in index.graph.topological_order() {
            let Some(state) = index.running.get(&txn_id) else {
                continue;
            };
            if state.status() != TransactionStatus::Committed {
                continue;
            }
            let predecessors = index.graph.predecessors(txn_id);
            let ready = predecessors.map_or(true, |preds| preds.iter().all(|p| placed.contains(p)));
            if !ready {
                continue;
            }

            if state.table_id_list().is_empty() {
                if predecessors.map_or(true, |preds| preds.is_empty()) {
                    placed.insert(txn_id);
                    batches.push(TransactionStateBatch::new(vec![state.clone()]));
                }
                continue;
            }

            let out_of_id_order = state
                .table_id_list()
                .iter()
                .any(|table_id| current_tables.get(table_id).map_or(false, |&max| max > txn_id));
            if out_of_id_order {
                batches.push(TransactionStateBatch::new(std::mem::take(&mut current)));
                current_tables.clear();
            }

            placed.insert(txn_id);
            for &table_id in state.table_id_list() {
                let max = current_tables.entry(table_id).or_insert(txn_id);
                *max = (*max).max(txn_id);
            }
            current.push(state.clone());
            if current.len() >= max_size {
                batches.push(TransactionStateBatch::new(std::mem::take(&mut current)));
                current_tables.clear();
            }
        }
        if !current.is_empty() {
            batches.push(TransactionStateBatch::new(current));
        }

        if !batches.is_empty() {
            debug!(
                target: "loadtxn::publish",
                db_id = self.db_id,
                batches = batches.len(),
                "Selected publish batches"
            );
        }
        batches
    }

    /// Drop finished transactions older than the retention window.
    ///
    /// Returns the number removed. Not logged: every node expires on its own
    /// clock.
    pub fn remove_expired_txns(&self, now_ms: i64) -> usize {
        let keep_ms = self.config.label_keep_max_ms();
        let mut index = self.index.write();
        let expired: Vec<TxnId> = index
            .finished
            .values()
            .filter(|s| keep_ms <= 0 || now_ms - s.finish_time() > keep_ms)
            .map(|s| s.transaction_id())
            .collect();
        for txn_id in &expired {
            if let Some(state) = index.finished.remove(txn_id) {
                index.unindex_label(state.label(), *txn_id);
            }
        }
        if !expired.is_empty() {
            info!(
                target: "loadtxn::txn",
                db_id = self.db_id,
                removed = expired.len(),
                "Removed expired transactions"
            );
        }
        expired.len()
    }

    /// Remove one finished transaction immediately
    ///
    /// # Errors
    ///
    /// `TransactionNotFound` if unknown, `InvalidOperation` if still running.
    pub fn delete_transaction(&self, txn_id: TxnId) -> Result<()> {
        let mut index = self.index.write();
        if index.running.contains_key(&txn_id) {
            return Err(TxnError::InvalidOperation(format!(
                "transaction {} is still running",
                txn_id
            )));
        }
        let state = index
            .finished
            .remove(&txn_id)
            .ok_or_else(|| self.not_found(txn_id))?;
        index.unindex_label(state.label(), txn_id);
        Ok(())
    }

    // ========================================================================
    // Admission
    // ========================================================================

    /// Reject a begin of `source_type` if the database is at its cap
    pub fn check_running_txn_exceed_limit(&self, source_type: LoadJobSourceType) -> Result<()> {
        self.index.read().running_limit_check(
            self.db_id,
            source_type,
            self.config.max_running_txn_num_per_db,
        )
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Running plus retained finished transactions
    pub fn get_transaction_num(&self) -> usize {
        let index = self.index.read();
        index.running.len() + index.finished.len()
    }

    /// Running transactions counted against the cap
    pub fn get_running_txn_nums(&self) -> usize {
        self.index.read().running_txn_nums
    }

    /// Running routine load tasks
    pub fn get_running_routine_load_txn_nums(&self) -> usize {
        self.index.read().running_routine_load_txn_nums
    }

    /// Retained VISIBLE/ABORTED transactions
    pub fn get_finished_txn_nums(&self) -> usize {
        self.index.read().finished.len()
    }

    /// Every PREPARE/COMMITTED transaction, exempt sources included
    pub fn get_total_running_txn_nums(&self) -> usize {
        self.index.read().running.len()
    }

    /// Running transactions per load type
    pub fn get_running_txn_nums_by_source(&self) -> HashMap<LoadJobSourceType, usize> {
        self.index.read().running_by_source.clone()
    }

    /// Ids that carried `label` and are still retained
    pub fn get_txn_ids_by_label(&self, label: &str) -> Option<BTreeSet<TxnId>> {
        self.index.read().label_to_txn_ids.get(label).cloned()
    }

    /// Newest transaction carrying `label`
    pub fn get_label_transaction_state(&self, label: &str) -> Option<TransactionState> {
        let index = self.index.read();
        let newest = *index.label_to_txn_ids.get(label)?.iter().next_back()?;
        index.get(newest).cloned()
    }

    /// Copy of a transaction's state
    pub fn get_transaction_state(&self, txn_id: TxnId) -> Option<TransactionState> {
        self.index.read().get(txn_id).cloned()
    }

    /// Status of a transaction, `Unknown` if it is not retained
    pub fn get_txn_state(&self, txn_id: TxnId) -> TransactionStatus {
        self.index.read().status_of(txn_id)
    }

    /// Running compaction transactions: id -> start time
    pub fn get_lake_compaction_active_txn_map(&self) -> HashMap<TxnId, i64> {
        self.index.read().lake_compaction_txns.clone()
    }

    /// Running transactions driven by backend `host` as `(db_id, txn_id)`,
    /// ascending, at most `limit`. Used to abort them when the backend restarts.
    pub fn get_transaction_id_by_coordinate_be(
        &self,
        host: &str,
        limit: usize,
    ) -> Vec<(DbId, TxnId)> {
        let index = self.index.read();
        let mut ids: Vec<TxnId> = index
            .running
            .values()
            .filter(|s| {
                s.coordinator().source_type == TxnSourceType::BE && s.coordinator().host == host
            })
            .map(|s| s.transaction_id())
            .collect();
        ids.sort_unstable();
        ids.into_iter()
            .take(limit)
            .map(|txn_id| (self.db_id, txn_id))
            .collect()
    }

    /// One-row summary of a transaction
    pub fn get_txn_info(&self, txn_id: TxnId) -> Option<TxnInfo> {
        self.index.read().get(txn_id).map(TxnInfo::from)
    }

    /// Tables of a transaction with the partitions committed on each
    pub fn get_table_trans_info(&self, txn_id: TxnId) -> Result<Vec<(TableId, Vec<PartitionId>)>> {
        let index = self.index.read();
        let state = index.get(txn_id).ok_or_else(|| self.not_found(txn_id))?;
        Ok(state
            .table_id_list()
            .iter()
            .map(|&table_id| {
                let partitions = state
                    .table_commit_info(table_id)
                    .map(|info| info.partition_commit_infos.keys().copied().collect())
                    .unwrap_or_default();
                (table_id, partitions)
            })
            .collect())
    }

    /// Committed version of each partition of one table
    pub fn get_partition_trans_info(
        &self,
        txn_id: TxnId,
        table_id: TableId,
    ) -> Result<Vec<(PartitionId, i64)>> {
        let index = self.index.read();
        let state = index.get(txn_id).ok_or_else(|| self.not_found(txn_id))?;
        Ok(state
            .table_commit_info(table_id)
            .map(|info| {
                info.partition_commit_infos
                    .values()
                    .map(|p| (p.partition_id, p.version))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// PREPARE transactions past their timeout at `now_ms`, ascending
    pub fn get_timeout_txn_ids(&self, now_ms: i64) -> Vec<TxnId> {
        let index = self.index.read();
        let mut ids: Vec<TxnId> = index
            .running
            .values()
            .filter(|s| s.is_timeout(now_ms))
            .map(|s| s.transaction_id())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Smallest running id
    pub fn min_active_txn_id(&self) -> Option<TxnId> {
        self.index.read().running.keys().min().copied()
    }

    /// Smallest running compaction id
    pub fn min_active_compaction_txn_id(&self) -> Option<TxnId> {
        self.index.read().lake_compaction_txns.keys().min().copied()
    }

    /// Every retained state, ascending by id (checkpoint input)
    pub fn all_transaction_states(&self) -> Vec<TransactionState> {
        let index = self.index.read();
        let mut states: Vec<TransactionState> = index
            .running
            .values()
            .chain(index.finished.values())
            .cloned()
            .collect();
        states.sort_by_key(|s| s.transaction_id());
        states
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use loadtxn_durability::MemoryEditLog;

    const DB: DbId = 1;
    const TABLE: TableId = 10;
    const PARTITION: PartitionId = 100;
    const TABLET: i64 = 1000;

    struct Fixture {
        log: Arc<MemoryEditLog>,
        catalog: Arc<MemoryCatalog>,
        ids: TransactionIdGenerator,
        mgr: DatabaseTransactionMgr,
    }

    fn fixture(config: TxnConfig) -> Fixture {
        let log = MemoryEditLog::shared();
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.add_partition(DB, TABLE, PARTITION, 1);
        catalog.add_tablet(DB, TABLE, PARTITION, TABLET, 3);
        Fixture {
            ids: TransactionIdGenerator::new(log.clone()),
            mgr: DatabaseTransactionMgr::new(DB, Arc::new(config), log.clone(), catalog.clone()),
            log,
            catalog,
        }
    }

    fn begin(f: &Fixture, label: &str, source: LoadJobSourceType) -> Result<TxnId> {
        f.mgr.begin_transaction(
            &f.ids,
            vec![TABLE],
            label,
            TxnCoordinator::be("be1"),
            source,
            100,
        )
    }

    fn replicas(n: i64) -> Vec<TabletCommitInfo> {
        (0..n).map(|be| TabletCommitInfo::new(TABLET, be)).collect()
    }

    #[test]
    fn test_lifecycle_and_counters() {
        let f = fixture(TxnConfig::for_testing());
        let txn = begin(&f, "l1", LoadJobSourceType::BackendStreaming).unwrap();
        assert_eq!(f.mgr.get_txn_state(txn), TransactionStatus::Prepare);
        assert_eq!(f.mgr.get_running_txn_nums(), 1);

        f.mgr.commit_transaction(txn, &replicas(3), &[], None).unwrap();
        assert_eq!(f.mgr.get_txn_state(txn), TransactionStatus::Committed);
        assert_eq!(
            f.mgr.get_partition_trans_info(txn, TABLE).unwrap(),
            vec![(PARTITION, 2)]
        );

        f.mgr.finish_transaction(txn, &[]).unwrap();
        assert_eq!(f.mgr.get_txn_state(txn), TransactionStatus::Visible);
        assert_eq!(f.mgr.get_running_txn_nums(), 0);
        assert_eq!(f.mgr.get_finished_txn_nums(), 1);
        assert_eq!(f.catalog.visible_version(DB, TABLE, PARTITION).unwrap().0, 2);

        // id reservation + begin + commit + visible
        assert_eq!(f.log.len(), 4);
    }

    #[test]
    fn test_idempotent_begin() {
        let f = fixture(TxnConfig::for_testing());
        let txn = begin(&f, "l1", LoadJobSourceType::BackendStreaming).unwrap();
        assert_eq!(begin(&f, "l1", LoadJobSourceType::BackendStreaming).unwrap(), txn);
        assert!(matches!(
            begin(&f, "l1", LoadJobSourceType::InsertStreaming),
            Err(TxnError::DuplicateLabel { existing_txn_id, .. }) if existing_txn_id == txn
        ));
        assert_eq!(f.mgr.get_running_txn_nums(), 1);
    }

    #[test]
    fn test_aborted_label_is_reusable() {
        let f = fixture(TxnConfig::for_testing());
        let first = begin(&f, "l1", LoadJobSourceType::BackendStreaming).unwrap();
        f.mgr.abort_transaction(first, "cancelled", None).unwrap();
        let second = begin(&f, "l1", LoadJobSourceType::BackendStreaming).unwrap();
        assert!(second > first);
        assert_eq!(
            f.mgr.get_txn_ids_by_label("l1"),
            Some(BTreeSet::from([first, second]))
        );
        assert_eq!(
            f.mgr.get_label_transaction_state("l1").unwrap().transaction_id(),
            second
        );
    }

    #[test]
    fn test_quorum_failure_aborts() {
        let f = fixture(TxnConfig::for_testing());
        let txn = begin(&f, "l1", LoadJobSourceType::BackendStreaming).unwrap();
        let fails = vec![TabletFailInfo::new(TABLET, 1)];
        let err = f
            .mgr
            .commit_transaction(txn, &replicas(2), &fails, None)
            .unwrap_err();
        assert!(matches!(
            err,
            TxnError::QuorumNotMet {
                success_replicas: 1,
                quorum: 2,
                ..
            }
        ));
        assert_eq!(f.mgr.get_txn_state(txn), TransactionStatus::Aborted);
        assert!(!f.mgr.get_transaction_state(txn).unwrap().reason().is_empty());
    }

    #[test]
    fn test_stale_commit_rejected() {
        let f = fixture(TxnConfig::for_testing());
        let txn = begin(&f, "l1", LoadJobSourceType::BackendStreaming).unwrap();
        // Backdate the begin instead of sleeping past the timeout
        {
            let mut index = f.mgr.index.write();
            let state = index.running.remove(&txn).unwrap();
            let old = TransactionState::new(
                DB,
                state.table_id_list().to_vec(),
                txn,
                state.label(),
                state.coordinator().clone(),
                state.source_type(),
                state.timeout_ms(),
                now_ms() - state.timeout_ms() - 1,
            );
            index.running.insert(txn, old);
        }
        assert_eq!(f.mgr.get_timeout_txn_ids(now_ms()), vec![txn]);
        assert!(matches!(
            f.mgr.commit_transaction(txn, &replicas(3), &[], None),
            Err(TxnError::StaleTransaction { .. })
        ));
        assert_eq!(f.mgr.get_txn_state(txn), TransactionStatus::Prepare);
    }

    #[test]
    fn test_dropped_table_at_commit() {
        let f = fixture(TxnConfig::for_testing());
        let txn = begin(&f, "l1", LoadJobSourceType::BackendStreaming).unwrap();
        f.catalog.drop_table(DB, TABLE);
        f.mgr.commit_transaction(txn, &replicas(3), &[], None).unwrap();
        let state = f.mgr.get_transaction_state(txn).unwrap();
        assert!(state.table_id_list().is_empty());

        // Published alone, then finishes despite the missing table
        let batches = f.mgr.get_ready_to_publish_txn_list_batch();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].txn_ids(), vec![txn]);
        f.mgr.finish_transaction_batch(&batches[0], &[]).unwrap();
        assert_eq!(f.mgr.get_txn_state(txn), TransactionStatus::Visible);
    }

    #[test]
    fn test_finish_errors() {
        let f = fixture(TxnConfig::for_testing());
        let txn = begin(&f, "l1", LoadJobSourceType::BackendStreaming).unwrap();
        assert!(matches!(
            f.mgr.finish_transaction(txn, &[]),
            Err(TxnError::TransactionNotCommitted { .. })
        ));
        f.mgr.abort_transaction(txn, "", None).unwrap();
        assert!(f.mgr.finish_transaction(txn, &[]).unwrap_err().is_not_found());
        assert!(f.mgr.finish_transaction(424242, &[]).unwrap_err().is_not_found());
    }

    #[test]
    fn test_append_failure_leaves_state_untouched() {
        let f = fixture(TxnConfig::for_testing());
        let txn = begin(&f, "l1", LoadJobSourceType::BackendStreaming).unwrap();
        f.log.set_fail_appends(true);
        assert!(f.mgr.commit_transaction(txn, &replicas(3), &[], None).is_err());
        assert_eq!(f.mgr.get_txn_state(txn), TransactionStatus::Prepare);
        assert_eq!(f.catalog.partition_version(DB, TABLE, PARTITION).unwrap().next_version, 2);
        assert!(begin(&f, "l2", LoadJobSourceType::BackendStreaming).is_err());
        assert_eq!(f.mgr.get_transaction_num(), 1);
    }

    #[test]
    fn test_compaction_is_tracked_separately() {
        let f = fixture(TxnConfig::for_testing().with_max_running_txn_num_per_db(1));
        begin(&f, "load", LoadJobSourceType::BackendStreaming).unwrap();
        let c1 = begin(&f, "c1", LoadJobSourceType::LakeCompaction).unwrap();
        let c2 = begin(&f, "c2", LoadJobSourceType::LakeCompaction).unwrap();
        assert_eq!(f.mgr.get_running_txn_nums(), 1);
        assert_eq!(f.mgr.get_total_running_txn_nums(), 3);
        assert_eq!(f.mgr.min_active_compaction_txn_id(), Some(c1));
        assert_eq!(f.mgr.get_lake_compaction_active_txn_map().len(), 2);
        assert_eq!(
            f.mgr.get_running_txn_nums_by_source()[&LoadJobSourceType::LakeCompaction],
            2
        );

        f.mgr.abort_transaction(c1, "", None).unwrap();
        assert_eq!(f.mgr.min_active_compaction_txn_id(), Some(c2));
    }

    #[test]
    fn test_batch_respects_max_size() {
        let f = fixture(TxnConfig::for_testing().with_publish_batch_max_size(2));
        let txns: Vec<TxnId> = (0..5)
            .map(|i| {
                let txn = begin(&f, &format!("l{}", i), LoadJobSourceType::BackendStreaming).unwrap();
                f.mgr.commit_transaction(txn, &replicas(3), &[], None).unwrap();
                txn
            })
            .collect();
        let batches = f.mgr.get_ready_to_publish_txn_list_batch();
        let sizes: Vec<usize> = batches.iter().map(|b| b.size()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        let flattened: Vec<TxnId> = batches.iter().flat_map(|b| b.txn_ids()).collect();
        assert_eq!(flattened, txns);
    }

    #[test]
    fn test_finish_waits_for_earlier_commit() {
        let f = fixture(TxnConfig::for_testing());
        let a = begin(&f, "a", LoadJobSourceType::BackendStreaming).unwrap();
        let b = begin(&f, "b", LoadJobSourceType::BackendStreaming).unwrap();
        f.mgr.commit_transaction(a, &replicas(3), &[], None).unwrap();
        f.mgr.commit_transaction(b, &replicas(3), &[], None).unwrap();
        let logged = f.log.len();

        let err = f.mgr.finish_transaction(b, &[]).unwrap_err();
        assert!(matches!(
            err,
            TxnError::PublishNotReady { txn_id, blocking_txn_id, .. }
                if txn_id == b && blocking_txn_id == a
        ));
        assert_eq!(f.mgr.get_txn_state(b), TransactionStatus::Committed);
        assert_eq!(f.catalog.visible_version(DB, TABLE, PARTITION).unwrap().0, 1);
        assert_eq!(f.log.len(), logged);

        // A batch listing b ahead of a is refused as a whole
        let reversed = TransactionStateBatch::new(vec![
            f.mgr.get_transaction_state(b).unwrap(),
            f.mgr.get_transaction_state(a).unwrap(),
        ]);
        assert!(matches!(
            f.mgr.finish_transaction_batch(&reversed, &[]),
            Err(TxnError::PublishNotReady { .. })
        ));
        assert_eq!(f.mgr.get_txn_state(a), TransactionStatus::Committed);

        f.mgr.finish_transaction(a, &[]).unwrap();
        assert_eq!(f.catalog.visible_version(DB, TABLE, PARTITION).unwrap().0, 2);
        f.mgr.finish_transaction(b, &[]).unwrap();
        assert_eq!(f.catalog.visible_version(DB, TABLE, PARTITION).unwrap().0, 3);
    }

    #[test]
    fn test_batch_split_when_commit_order_reverses_ids() {
        let f = fixture(TxnConfig::for_testing());
        let a = begin(&f, "a", LoadJobSourceType::BackendStreaming).unwrap();
        let b = begin(&f, "b", LoadJobSourceType::BackendStreaming).unwrap();
        assert!(a < b);
        f.mgr.commit_transaction(b, &replicas(3), &[], None).unwrap();
        f.mgr.commit_transaction(a, &replicas(3), &[], None).unwrap();

        let batches = f.mgr.get_ready_to_publish_txn_list_batch();
        let ids: Vec<Vec<TxnId>> = batches.iter().map(|batch| batch.txn_ids()).collect();
        assert_eq!(ids, vec![vec![b], vec![a]]);

        for batch in &batches {
            f.mgr.finish_transaction_batch(batch, &[]).unwrap();
        }
        assert_eq!(f.mgr.get_txn_state(a), TransactionStatus::Visible);
        // b carries version 2 and a version 3
        assert_eq!(f.catalog.visible_version(DB, TABLE, PARTITION).unwrap().0, 3);
    }

    #[test]
    fn test_delete_running_rejected() {
        let f = fixture(TxnConfig::for_testing());
        let txn = begin(&f, "l1", LoadJobSourceType::BackendStreaming).unwrap();
        assert!(matches!(
            f.mgr.delete_transaction(txn),
            Err(TxnError::InvalidOperation(_))
        ));
        assert!(f.mgr.delete_transaction(9999).unwrap_err().is_not_found());
    }
}
