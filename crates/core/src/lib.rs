//! Core types and traits for loadtxn
//!
//! This crate defines the foundational types used throughout the system:
//! - Id aliases: DbId, TableId, PartitionId, TabletId, BackendId, TxnId
//! - TxnCoordinator / LoadJobSourceType: who opened a transaction and how
//! - TransactionState: the replicated lifecycle record of one load transaction
//! - TxnError: Error taxonomy
//! - TxnConfig: Coordinator configuration
//! - Catalog: Table/tablet metadata consumed at commit and publish

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod traits;
pub mod txn_state;
pub mod types;

pub use config::{EditLogDurability, TxnConfig, CONFIG_FILE_NAME};
pub use error::{Result, TxnError};
pub use traits::{Catalog, PartitionVersion, TabletMeta};
pub use txn_state::{
    now_ms, PartitionCommitInfo, TableCommitInfo, TabletCommitInfo, TabletFailInfo,
    TransactionState, TransactionStateBatch, TransactionStatus, TxnCommitAttachment,
};
pub use types::{
    BackendId, DbId, LoadJobSourceType, PartitionId, TableId, TabletId, TxnCoordinator, TxnId,
    TxnSourceType,
};
