//! Publish-order dependency graph of committed transactions
//!
//! One node per COMMITTED transaction of a database. An edge `a -> b` means
//! `a` and `b` write a common table and `a` committed first, so `b` must not
//! become visible before `a`.
//!
//! Each table keeps the chain of its live committers in commit order, and
//! only consecutive chain members are linked: older committers reach newer
//! ones transitively. Removing a node (the transaction finished or aborted)
//! links its chain neighbours directly, so ordering among the remaining
//! nodes survives removal.

use loadtxn_core::{TableId, TxnId};
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

#[derive(Debug, Default)]
struct Node {
    table_ids: Vec<TableId>,
    ins: BTreeSet<TxnId>,
    outs: BTreeSet<TxnId>,
}

/// Dependency DAG over committed transactions
#[derive(Debug, Default)]
pub struct TransactionGraph {
    nodes: HashMap<TxnId, Node>,
    // Live committers of each table, in commit order
    table_chains: HashMap<TableId, Vec<TxnId>>,
    nodes_without_ins: BTreeSet<TxnId>,
}

impl TransactionGraph {
    /// Empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes
    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    /// True when no transaction is waiting to publish
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether the transaction is in the graph
    pub fn contains(&self, txn_id: TxnId) -> bool {
        self.nodes.contains_key(&txn_id)
    }

    /// Add a newly committed transaction. Adding an existing node is a no-op.
    pub fn add(&mut self, txn_id: TxnId, table_ids: &[TableId]) {
        if self.nodes.contains_key(&txn_id) {
            return;
        }
        let mut node = Node {
            table_ids: table_ids.to_vec(),
            ..Default::default()
        };
        for &table_id in table_ids {
            let chain = self.table_chains.entry(table_id).or_default();
            if let Some(&prev) = chain.last() {
                if let Some(prev_node) = self.nodes.get_mut(&prev) {
                    prev_node.outs.insert(txn_id);
                    node.ins.insert(prev);
                }
            }
            if chain.last() != Some(&txn_id) {
                chain.push(txn_id);
            }
        }
        if node.ins.is_empty() {
            self.nodes_without_ins.insert(txn_id);
        }
        self.nodes.insert(txn_id, node);
    }

    /// Remove a transaction, reconnecting its neighbours.
    ///
    /// Returns false if it was not in the graph.
    pub fn remove(&mut self, txn_id: TxnId) -> bool {
        let node = match self.nodes.remove(&txn_id) {
            Some(node) => node,
            None => return false,
        };
        self.nodes_without_ins.remove(&txn_id);

        for &pred in &node.ins {
            if let Some(p) = self.nodes.get_mut(&pred) {
                p.outs.remove(&txn_id);
            }
        }
        for &succ in &node.outs {
            if let Some(s) = self.nodes.get_mut(&succ) {
                s.ins.remove(&txn_id);
            }
        }

        // Bridge the neighbours of the removed node on each of its tables
        for &table_id in &node.table_ids {
            let Some(chain) = self.table_chains.get_mut(&table_id) else {
                continue;
            };
            let Some(pos) = chain.iter().position(|&id| id == txn_id) else {
                continue;
            };
            chain.remove(pos);
            let bridge = match (pos.checked_sub(1), chain.get(pos)) {
                (Some(before), Some(&succ)) => Some((chain[before], succ)),
                _ => None,
            };
            if chain.is_empty() {
                self.table_chains.remove(&table_id);
            }
            if let Some((pred, succ)) = bridge {
                if let Some(p) = self.nodes.get_mut(&pred) {
                    p.outs.insert(succ);
                }
                if let Some(s) = self.nodes.get_mut(&succ) {
                    s.ins.insert(pred);
                }
            }
        }

        for &succ in &node.outs {
            if self.nodes.get(&succ).map_or(false, |s| s.ins.is_empty()) {
                self.nodes_without_ins.insert(succ);
            }
        }
        true
    }

    /// Direct predecessors of a transaction
    pub fn predecessors(&self, txn_id: TxnId) -> Option<&BTreeSet<TxnId>> {
        self.nodes.get(&txn_id).map(|n| &n.ins)
    }

    /// Transactions with no pending predecessor, ascending
    pub fn txns_without_dependency(&self) -> Vec<TxnId> {
        self.nodes_without_ins.iter().copied().collect()
    }

    /// Every node in dependency order; ties break on the smaller id
    pub fn topological_order(&self) -> Vec<TxnId> {
        let mut in_degree: HashMap<TxnId, usize> = self
            .nodes
            .iter()
            .map(|(&id, node)| (id, node.ins.len()))
            .collect();
        let mut ready: BinaryHeap<Reverse<TxnId>> = self
            .nodes_without_ins
            .iter()
            .map(|&id| Reverse(id))
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(Reverse(id)) = ready.pop() {
            order.push(id);
            if let Some(node) = self.nodes.get(&id) {
                for succ in &node.outs {
                    if let Some(degree) = in_degree.get_mut(succ) {
                        *degree -= 1;
                        if *degree == 0 {
                            ready.push(Reverse(*succ));
                        }
                    }
                }
            }
        }
        order
    }
}
