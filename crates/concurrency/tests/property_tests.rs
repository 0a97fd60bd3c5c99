//! Property-based tests for the transaction coordinator
//!
//! Random operation sequences are driven against one database while a small
//! model tracks what each transaction should look like. After every step:
//!
//! - observed status changes are legal lifecycle transitions
//! - publish batches never place a transaction ahead of an earlier commit
//!   on a shared table that is still waiting
//! - the min active id never passes a running transaction
//! - admission never lets the capped counter exceed its limit

use proptest::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use loadtxn_concurrency::{GlobalTransactionMgr, MemoryCatalog};
use loadtxn_core::{
    LoadJobSourceType, TableId, TabletCommitInfo, TransactionStatus, TxnConfig, TxnCoordinator,
    TxnError, TxnId,
};
use loadtxn_durability::MemoryEditLog;

const DB: i64 = 1;
const TABLES: [TableId; 3] = [1, 2, 3];
const BATCH_MAX: usize = 2;

#[derive(Debug, Clone)]
enum Op {
    Begin(Vec<TableId>),
    Commit(prop::sample::Index),
    Finish(prop::sample::Index),
    Abort(prop::sample::Index),
    PublishFirstBatch,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => prop::sample::subsequence(TABLES.to_vec(), 1..=TABLES.len()).prop_map(Op::Begin),
        3 => any::<prop::sample::Index>().prop_map(Op::Commit),
        1 => any::<prop::sample::Index>().prop_map(Op::Finish),
        1 => any::<prop::sample::Index>().prop_map(Op::Abort),
        2 => Just(Op::PublishFirstBatch),
    ]
}

fn coordinator(config: TxnConfig) -> GlobalTransactionMgr {
    let catalog = Arc::new(MemoryCatalog::new());
    for table_id in TABLES {
        catalog.add_partition(DB, table_id, table_id * 10, 1);
        catalog.add_tablet(DB, table_id, table_id * 10, table_id * 100, 1);
    }
    GlobalTransactionMgr::new(config, MemoryEditLog::shared(), catalog).unwrap()
}

fn commit_infos() -> Vec<TabletCommitInfo> {
    TABLES
        .iter()
        .map(|t| TabletCommitInfo::new(t * 100, 1))
        .collect()
}

#[derive(Default)]
struct Model {
    txns: Vec<TxnId>,
    tables: HashMap<TxnId, Vec<TableId>>,
    status: HashMap<TxnId, TransactionStatus>,
    commit_order: Vec<TxnId>,
}

impl Model {
    fn pick(&self, idx: &prop::sample::Index) -> Option<TxnId> {
        (!self.txns.is_empty()).then(|| self.txns[idx.index(self.txns.len())])
    }

    fn shares_table(&self, a: TxnId, b: TxnId) -> bool {
        let tables_a = &self.tables[&a];
        self.tables[&b].iter().any(|t| tables_a.contains(t))
    }

    /// An earlier commit on a shared table that is still waiting to publish
    fn waiting_before(&self, txn: TxnId) -> Option<TxnId> {
        let committed_at = self.commit_order.iter().position(|t| *t == txn)?;
        self.commit_order[..committed_at]
            .iter()
            .copied()
            .find(|&earlier| {
                self.status[&earlier] == TransactionStatus::Committed
                    && self.shares_table(earlier, txn)
            })
    }
}

fn check_invariants(mgr: &GlobalTransactionMgr, model: &mut Model) -> Result<(), TestCaseError> {
    // Lifecycle: every observed change is a legal transition
    for &txn in &model.txns {
        let observed = mgr.get_txn_state(DB, txn);
        let previous = model.status[&txn];
        if observed != previous {
            prop_assert!(
                previous.can_transition_to(observed),
                "txn {} moved {} -> {}",
                txn,
                previous,
                observed
            );
            model.status.insert(txn, observed);
        }
    }

    // Publish order: waiting earlier commits on a shared table come first
    let batches = mgr.get_ready_to_publish_txn_list_batch();
    let order: Vec<TxnId> = batches.iter().flat_map(|b| b.txn_ids()).collect();
    for batch in &batches {
        prop_assert!(batch.size() <= BATCH_MAX);
        // Same-table members share a batch only when commit order is id order
        let ids = batch.txn_ids();
        for (i, &a) in ids.iter().enumerate() {
            for &b in &ids[i + 1..] {
                if model.shares_table(a, b) {
                    prop_assert!(a < b, "batch {:?} puts {} ahead of {}", ids, a, b);
                }
            }
        }
    }
    let placed_before: HashMap<TxnId, usize> =
        order.iter().enumerate().map(|(pos, id)| (*id, pos)).collect();
    for (pos, &txn) in order.iter().enumerate() {
        prop_assert_eq!(model.status[&txn], TransactionStatus::Committed);
        let committed_at = model.commit_order.iter().position(|t| *t == txn).unwrap();
        for &earlier in &model.commit_order[..committed_at] {
            if model.status[&earlier] == TransactionStatus::Committed
                && model.shares_table(earlier, txn)
            {
                let earlier_pos = placed_before.get(&earlier).copied();
                prop_assert!(
                    earlier_pos.map_or(false, |p| p < pos),
                    "txn {} published before waiting txn {}",
                    txn,
                    earlier
                );
            }
        }
    }

    // Watermark
    let min_running = model
        .txns
        .iter()
        .filter(|t| model.status[*t].is_running())
        .min()
        .copied();
    if let Some(min_running) = min_running {
        prop_assert!(mgr.get_min_active_txn_id() <= min_running);
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_lifecycle_and_publish_order(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let mgr = coordinator(TxnConfig::for_testing().with_publish_batch_max_size(BATCH_MAX));
        let mut model = Model::default();

        for (step, op) in ops.into_iter().enumerate() {
            match op {
                Op::Begin(tables) => {
                    let txn = mgr
                        .begin_transaction(
                            DB,
                            tables.clone(),
                            &format!("label_{}", step),
                            TxnCoordinator::be("be1"),
                            LoadJobSourceType::BackendStreaming,
                            60,
                        )
                        .unwrap();
                    model.txns.push(txn);
                    model.tables.insert(txn, tables);
                    model.status.insert(txn, TransactionStatus::Prepare);
                }
                Op::Commit(idx) => {
                    if let Some(txn) = model.pick(&idx) {
                        let result = mgr.commit_transaction(DB, txn, &commit_infos(), &[], None);
                        prop_assert_eq!(
                            result.is_ok(),
                            model.status[&txn] == TransactionStatus::Prepare
                        );
                        if result.is_ok() {
                            model.commit_order.push(txn);
                        }
                    }
                }
                Op::Finish(idx) => {
                    if let Some(txn) = model.pick(&idx) {
                        let result = mgr.finish_transaction(DB, txn, &[]);
                        let expect_ok = match model.status[&txn] {
                            TransactionStatus::Visible => true,
                            TransactionStatus::Committed => model.waiting_before(txn).is_none(),
                            _ => false,
                        };
                        prop_assert_eq!(result.is_ok(), expect_ok);
                        if model.status[&txn] == TransactionStatus::Committed && !expect_ok {
                            let blocked = matches!(result, Err(TxnError::PublishNotReady { .. }));
                            prop_assert!(blocked);
                        }
                    }
                }
                Op::Abort(idx) => {
                    if let Some(txn) = model.pick(&idx) {
                        let result = mgr.abort_transaction(DB, txn, "random", None);
                        prop_assert_eq!(result.is_ok(), model.status[&txn].is_running());
                    }
                }
                Op::PublishFirstBatch => {
                    if let Some(batch) = mgr.get_ready_to_publish_txn_list_batch().first() {
                        mgr.finish_transaction_batch(DB, batch, &[]).unwrap();
                    }
                }
            }
            check_invariants(&mgr, &mut model)?;
        }
    }

    #[test]
    fn prop_admission_cap_holds(
        sources in prop::collection::vec(
            prop::sample::select(vec![
                LoadJobSourceType::BackendStreaming,
                LoadJobSourceType::Frontend,
                LoadJobSourceType::RoutineLoadTask,
                LoadJobSourceType::LakeCompaction,
            ]),
            1..40,
        ),
        aborts in prop::collection::vec(any::<bool>(), 40),
    ) {
        let cap = 3;
        let mgr = coordinator(TxnConfig::for_testing().with_max_running_txn_num_per_db(cap));
        let db = mgr.get_database_transaction_mgr(DB).unwrap();
        let mut capped_running: Vec<TxnId> = Vec::new();
        let mut seen = HashSet::new();

        for (i, source) in sources.into_iter().enumerate() {
            let before = db.get_running_txn_nums();
            let result = mgr.begin_transaction(
                DB,
                vec![1],
                &format!("l{}", i),
                TxnCoordinator::fe("fe1"),
                source,
                60,
            );
            let capped = !source.is_exempt_from_running_limit();
            match result {
                Ok(txn) => {
                    prop_assert!(seen.insert(txn));
                    if capped {
                        capped_running.push(txn);
                    }
                }
                Err(TxnError::RunningTxnExceedLimit { .. }) => {
                    prop_assert!(capped);
                    prop_assert!(before >= cap);
                }
                Err(e) => return Err(TestCaseError::fail(e.to_string())),
            }
            prop_assert!(db.get_running_txn_nums() <= cap);
            prop_assert_eq!(db.get_running_txn_nums(), capped_running.len());

            if aborts[i] {
                if let Some(txn) = capped_running.pop() {
                    mgr.abort_transaction(DB, txn, "free a slot", None).unwrap();
                }
            }
        }
    }
}
