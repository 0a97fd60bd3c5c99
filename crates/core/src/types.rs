//! Core identifier and source types
//!
//! This module defines the foundational types:
//! - Id aliases for databases, tables, partitions, tablets, backends, transactions
//! - TxnCoordinator: who drives a transaction (a frontend or a backend host)
//! - LoadJobSourceType: which ingestion path opened the transaction

use serde::{Deserialize, Serialize};
use std::fmt;

/// Database identifier
pub type DbId = i64;
/// Table identifier
pub type TableId = i64;
/// Partition identifier
pub type PartitionId = i64;
/// Tablet identifier
pub type TabletId = i64;
/// Storage node (backend) identifier
pub type BackendId = i64;
/// Globally unique, monotonically increasing transaction identifier
pub type TxnId = i64;

/// Kind of node coordinating a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnSourceType {
    /// A frontend (metadata) node
    FE,
    /// A backend (storage) node, e.g. for stream load
    BE,
}

impl fmt::Display for TxnSourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnSourceType::FE => write!(f, "FE"),
            TxnSourceType::BE => write!(f, "BE"),
        }
    }
}

/// The node driving a transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnCoordinator {
    /// Node kind
    pub source_type: TxnSourceType,
    /// Host name or address
    pub host: String,
}

impl TxnCoordinator {
    /// Create a coordinator descriptor
    pub fn new(source_type: TxnSourceType, host: impl Into<String>) -> Self {
        Self {
            source_type,
            host: host.into(),
        }
    }

    /// Frontend coordinator
    pub fn fe(host: impl Into<String>) -> Self {
        Self::new(TxnSourceType::FE, host)
    }

    /// Backend coordinator
    pub fn be(host: impl Into<String>) -> Self {
        Self::new(TxnSourceType::BE, host)
    }
}

impl fmt::Display for TxnCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.source_type, self.host)
    }
}

/// Ingestion path that opened a transaction
///
/// Governs admission control: see [`LoadJobSourceType::is_exempt_from_running_limit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LoadJobSourceType {
    /// Load driven by a frontend (broker load, insert)
    Frontend,
    /// Stream load received by a backend
    BackendStreaming,
    /// Batch load job (e.g. spark load)
    BatchLoadJob,
    /// One task of a routine load job
    RoutineLoadTask,
    /// Streaming insert
    InsertStreaming,
    /// Frontend-coordinated streaming load
    FrontendStreaming,
    /// Delete statement
    Delete,
    /// Background compaction on shared-data tables
    LakeCompaction,
    /// Cross-cluster replication
    Replication,
}

/// Admission exemptions. Anything not listed counts against the cap.
const RUNNING_LIMIT_EXEMPT: &[LoadJobSourceType] = &[
    LoadJobSourceType::LakeCompaction,
    LoadJobSourceType::RoutineLoadTask,
];

impl LoadJobSourceType {
    /// All source types, in declaration order
    pub const ALL: [LoadJobSourceType; 9] = [
        LoadJobSourceType::Frontend,
        LoadJobSourceType::BackendStreaming,
        LoadJobSourceType::BatchLoadJob,
        LoadJobSourceType::RoutineLoadTask,
        LoadJobSourceType::InsertStreaming,
        LoadJobSourceType::FrontendStreaming,
        LoadJobSourceType::Delete,
        LoadJobSourceType::LakeCompaction,
        LoadJobSourceType::Replication,
    ];

    /// Whether transactions of this source bypass the per-database running cap
    pub fn is_exempt_from_running_limit(&self) -> bool {
        RUNNING_LIMIT_EXEMPT.contains(self)
    }

    /// Stable upper-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadJobSourceType::Frontend => "FRONTEND",
            LoadJobSourceType::BackendStreaming => "BACKEND_STREAMING",
            LoadJobSourceType::BatchLoadJob => "BATCH_LOAD_JOB",
            LoadJobSourceType::RoutineLoadTask => "ROUTINE_LOAD_TASK",
            LoadJobSourceType::InsertStreaming => "INSERT_STREAMING",
            LoadJobSourceType::FrontendStreaming => "FRONTEND_STREAMING",
            LoadJobSourceType::Delete => "DELETE",
            LoadJobSourceType::LakeCompaction => "LAKE_COMPACTION",
            LoadJobSourceType::Replication => "REPLICATION",
        }
    }
}

impl fmt::Display for LoadJobSourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exemption_table() {
        for source in LoadJobSourceType::ALL {
            let expected = matches!(
                source,
                LoadJobSourceType::LakeCompaction | LoadJobSourceType::RoutineLoadTask
            );
            assert_eq!(source.is_exempt_from_running_limit(), expected, "{}", source);
        }
    }

    #[test]
    fn test_coordinator_display() {
        assert_eq!(TxnCoordinator::fe("localfe").to_string(), "FE: localfe");
        assert_eq!(TxnCoordinator::be("be1").to_string(), "BE: be1");
    }

    #[test]
    fn test_source_type_serde() {
        let json = serde_json::to_string(&LoadJobSourceType::BackendStreaming).unwrap();
        let back: LoadJobSourceType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, LoadJobSourceType::BackendStreaming);
    }
}
