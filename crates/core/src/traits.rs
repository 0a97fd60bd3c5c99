//! Catalog abstraction consumed by the transaction managers
//!
//! The coordinator does not own table metadata. It needs just enough of the
//! catalog to validate write quorum at commit, assign partition versions and
//! advance visible versions at publish time. Everything else about tables and
//! tablets belongs to the storage layer.
//!
//! Thread safety: All methods must be safe to call concurrently from
//! multiple threads (requires Send + Sync).

use crate::error::Result;
use crate::types::{DbId, PartitionId, TableId, TabletId};

/// Placement of one tablet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TabletMeta {
    /// Owning database
    pub db_id: DbId,
    /// Owning table
    pub table_id: TableId,
    /// Owning partition
    pub partition_id: PartitionId,
    /// Number of replicas the tablet is configured with
    pub replica_num: usize,
}

impl TabletMeta {
    /// Successful replicas required for a write to count
    pub fn quorum(&self) -> usize {
        self.replica_num / 2 + 1
    }
}

/// Version counters of one partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionVersion {
    /// Newest version readers can see
    pub visible_version: i64,
    /// Version the next committed transaction receives
    pub next_version: i64,
}

/// Table/tablet metadata needed by commit and publish
pub trait Catalog: Send + Sync {
    /// Whether the table currently exists in the database
    fn table_exists(&self, db_id: DbId, table_id: TableId) -> bool;

    /// Placement of a tablet, None if the tablet is unknown
    fn tablet_meta(&self, tablet_id: TabletId) -> Option<TabletMeta>;

    /// Version counters of a partition
    ///
    /// # Errors
    ///
    /// `TableOrPartitionMissing` if the table or partition was dropped.
    fn partition_version(
        &self,
        db_id: DbId,
        table_id: TableId,
        partition_id: PartitionId,
    ) -> Result<PartitionVersion>;

    /// Record that `version` was handed to a committed transaction,
    /// advancing the partition's next version past it.
    ///
    /// # Errors
    ///
    /// `TableOrPartitionMissing` if the table or partition was dropped.
    fn commit_partition_version(
        &self,
        db_id: DbId,
        table_id: TableId,
        partition_id: PartitionId,
        version: i64,
    ) -> Result<()>;

    /// Make `version` visible on the partition. Never moves the visible
    /// version backwards.
    ///
    /// # Errors
    ///
    /// `TableOrPartitionMissing` if the table or partition was dropped.
    fn publish_partition_version(
        &self,
        db_id: DbId,
        table_id: TableId,
        partition_id: PartitionId,
        version: i64,
        version_time: i64,
    ) -> Result<()>;
}
