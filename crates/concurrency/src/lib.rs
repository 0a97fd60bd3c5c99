//! Transaction coordination for loadtxn
//!
//! This crate implements the load-transaction coordinator:
//! - TransactionIdGenerator: globally unique, logged id reservations
//! - TransactionGraph: publish-order dependencies between committed transactions
//! - DatabaseTransactionMgr: per-database indexes, admission, commit/publish/abort
//! - GlobalTransactionMgr: routing by database, watermarks, replay entry points
//! - Recovery: edit log replay and restart from checkpoint + log
//! - MemoryCatalog: in-memory table/tablet metadata

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod catalog;
pub mod database_mgr;
pub mod global_mgr;
pub mod graph;
pub mod id_generator;
pub mod recovery;

pub use catalog::MemoryCatalog;
pub use database_mgr::{DatabaseTransactionMgr, TxnInfo};
pub use global_mgr::GlobalTransactionMgr;
pub use graph::TransactionGraph;
pub use id_generator::{TransactionIdGenerator, BATCH_ID_INTERVAL, INITIAL_TXN_ID};
pub use recovery::{replay_edit_log, RecoveryCoordinator, RecoveryResult, ReplayStats};
