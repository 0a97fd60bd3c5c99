//! loadtxn - Load-transaction coordinator for a distributed analytical database
//!
//! Every data load (stream load, routine load task, insert, compaction) runs
//! as a transaction coordinated here:
//!
//! - **begin**: label-deduplicated, admission-controlled, globally unique id
//! - **commit**: quorum check per tablet, one version per partition written
//! - **publish**: committed transactions grouped into ordered batches and
//!   made visible together
//! - **abort / expiry**: rollback of running transactions, retention of
//!   finished ones
//!
//! Every mutation is appended to a replicated edit log before it takes
//! effect; followers and restarting leaders rebuild identical state by
//! replaying that log.
//!
//! # Quick Start
//!
//! ```ignore
//! use loadtxn::{
//!     GlobalTransactionMgr, LoadJobSourceType, MemoryCatalog, MemoryEditLog,
//!     TabletCommitInfo, TxnConfig, TxnCoordinator,
//! };
//! use std::sync::Arc;
//!
//! let catalog = Arc::new(MemoryCatalog::new());
//! catalog.add_partition(1, 10, 100, 1);
//! catalog.add_tablet(1, 10, 100, 1000, 1);
//!
//! let mgr = GlobalTransactionMgr::new(TxnConfig::default(), MemoryEditLog::shared(), catalog)?;
//! let txn = mgr.begin_transaction(
//!     1,
//!     vec![10],
//!     "load_20240101",
//!     TxnCoordinator::be("10.0.0.1"),
//!     LoadJobSourceType::BackendStreaming,
//!     600,
//! )?;
//! mgr.commit_transaction(1, txn, &[TabletCommitInfo::new(1000, 1)], &[], None)?;
//!
//! for batch in mgr.get_ready_to_publish_txn_list_batch() {
//!     mgr.finish_transaction_batch(1, &batch, &[])?;
//! }
//! ```
//!
//! # Architecture
//!
//! - [`loadtxn_core`]: data model, errors, configuration, catalog trait
//! - [`loadtxn_durability`]: edit log records, file log, checkpoints
//! - [`loadtxn_concurrency`]: id generation, per-database managers, publish
//!   ordering, replay and recovery

pub use loadtxn_concurrency::*;
pub use loadtxn_core::*;
pub use loadtxn_durability::*;
