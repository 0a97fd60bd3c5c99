//! In-memory [`Catalog`]
//!
//! Holds just the table, partition and tablet metadata the transaction
//! managers consult. Used by embedded deployments, followers in tests and the
//! benchmarks.
//!
//! Version updates are monotonic (`max`), so replaying the same commit or
//! publish twice leaves the catalog unchanged.

use loadtxn_core::{
    Catalog, DbId, PartitionId, PartitionVersion, Result, TableId, TabletId, TabletMeta, TxnError,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Default)]
struct PartitionEntry {
    visible_version: i64,
    visible_version_time: i64,
    next_version: i64,
}

#[derive(Debug, Default)]
struct CatalogInner {
    tables: HashMap<(DbId, TableId), HashMap<PartitionId, PartitionEntry>>,
    tablets: HashMap<TabletId, TabletMeta>,
}

/// Thread-safe in-memory catalog
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    inner: RwLock<CatalogInner>,
}

impl MemoryCatalog {
    /// Empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table without partitions
    pub fn add_table(&self, db_id: DbId, table_id: TableId) {
        self.inner
            .write()
            .tables
            .entry((db_id, table_id))
            .or_default();
    }

    /// Register a partition (creating the table if needed)
    pub fn add_partition(
        &self,
        db_id: DbId,
        table_id: TableId,
        partition_id: PartitionId,
        visible_version: i64,
    ) {
        self.inner
            .write()
            .tables
            .entry((db_id, table_id))
            .or_default()
            .insert(
                partition_id,
                PartitionEntry {
                    visible_version,
                    visible_version_time: 0,
                    next_version: visible_version + 1,
                },
            );
    }

    /// Register a tablet of an existing partition
    pub fn add_tablet(
        &self,
        db_id: DbId,
        table_id: TableId,
        partition_id: PartitionId,
        tablet_id: TabletId,
        replica_num: usize,
    ) {
        self.inner.write().tablets.insert(
            tablet_id,
            TabletMeta {
                db_id,
                table_id,
                partition_id,
                replica_num,
            },
        );
    }

    /// Drop a table with its partitions and tablets
    pub fn drop_table(&self, db_id: DbId, table_id: TableId) -> bool {
        let mut inner = self.inner.write();
        inner
            .tablets
            .retain(|_, meta| !(meta.db_id == db_id && meta.table_id == table_id));
        let dropped = inner.tables.remove(&(db_id, table_id)).is_some();
        if dropped {
            debug!(target: "loadtxn::txn", db_id, table_id, "Dropped table from catalog");
        }
        dropped
    }

    /// Drop one partition with its tablets
    pub fn drop_partition(&self, db_id: DbId, table_id: TableId, partition_id: PartitionId) -> bool {
        let mut inner = self.inner.write();
        inner.tablets.retain(|_, meta| {
            !(meta.db_id == db_id && meta.table_id == table_id && meta.partition_id == partition_id)
        });
        inner
            .tables
            .get_mut(&(db_id, table_id))
            .map_or(false, |parts| parts.remove(&partition_id).is_some())
    }

    /// Visible version and its timestamp
    pub fn visible_version(
        &self,
        db_id: DbId,
        table_id: TableId,
        partition_id: PartitionId,
    ) -> Option<(i64, i64)> {
        let inner = self.inner.read();
        inner
            .tables
            .get(&(db_id, table_id))
            .and_then(|parts| parts.get(&partition_id))
            .map(|p| (p.visible_version, p.visible_version_time))
    }

    fn with_partition<T>(
        &self,
        db_id: DbId,
        table_id: TableId,
        partition_id: PartitionId,
        f: impl FnOnce(&mut PartitionEntry) -> T,
    ) -> Result<T> {
        let mut inner = self.inner.write();
        let parts = inner
            .tables
            .get_mut(&(db_id, table_id))
            .ok_or(TxnError::TableOrPartitionMissing {
                db_id,
                table_id,
                partition_id: None,
            })?;
        let entry = parts
            .get_mut(&partition_id)
            .ok_or(TxnError::TableOrPartitionMissing {
                db_id,
                table_id,
                partition_id: Some(partition_id),
            })?;
        Ok(f(entry))
    }
}

impl Catalog for MemoryCatalog {
    fn table_exists(&self, db_id: DbId, table_id: TableId) -> bool {
        self.inner.read().tables.contains_key(&(db_id, table_id))
    }

    fn tablet_meta(&self, tablet_id: TabletId) -> Option<TabletMeta> {
        self.inner.read().tablets.get(&tablet_id).copied()
    }

    fn partition_version(
        &self,
        db_id: DbId,
        table_id: TableId,
        partition_id: PartitionId,
    ) -> Result<PartitionVersion> {
        self.with_partition(db_id, table_id, partition_id, |p| PartitionVersion {
            visible_version: p.visible_version,
            next_version: p.next_version,
        })
    }

    fn commit_partition_version(
        &self,
        db_id: DbId,
        table_id: TableId,
        partition_id: PartitionId,
        version: i64,
    ) -> Result<()> {
        self.with_partition(db_id, table_id, partition_id, |p| {
            p.next_version = p.next_version.max(version + 1);
        })
    }

    fn publish_partition_version(
        &self,
        db_id: DbId,
        table_id: TableId,
        partition_id: PartitionId,
        version: i64,
        version_time: i64,
    ) -> Result<()> {
        self.with_partition(db_id, table_id, partition_id, |p| {
            if version > p.visible_version {
                p.visible_version = version;
                p.visible_version_time = version_time;
            }
            p.next_version = p.next_version.max(version + 1);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_are_monotonic() {
        let catalog = MemoryCatalog::new();
        catalog.add_partition(1, 10, 100, 1);
        assert_eq!(
            catalog.partition_version(1, 10, 100).unwrap(),
            PartitionVersion {
                visible_version: 1,
                next_version: 2
            }
        );

        catalog.commit_partition_version(1, 10, 100, 2).unwrap();
        catalog.commit_partition_version(1, 10, 100, 2).unwrap();
        assert_eq!(catalog.partition_version(1, 10, 100).unwrap().next_version, 3);

        catalog.publish_partition_version(1, 10, 100, 2, 77).unwrap();
        catalog.publish_partition_version(1, 10, 100, 1, 99).unwrap();
        assert_eq!(catalog.visible_version(1, 10, 100), Some((2, 77)));
    }

    #[test]
    fn test_missing_objects() {
        let catalog = MemoryCatalog::new();
        catalog.add_table(1, 10);
        assert!(catalog.table_exists(1, 10));
        assert!(!catalog.table_exists(2, 10));
        assert!(matches!(
            catalog.partition_version(1, 10, 100),
            Err(TxnError::TableOrPartitionMissing {
                partition_id: Some(100),
                ..
            })
        ));
        assert!(matches!(
            catalog.commit_partition_version(1, 11, 100, 2),
            Err(TxnError::TableOrPartitionMissing {
                partition_id: None,
                ..
            })
        ));
    }

    #[test]
    fn test_drop_removes_tablets() {
        let catalog = MemoryCatalog::new();
        catalog.add_partition(1, 10, 100, 1);
        catalog.add_partition(1, 10, 101, 1);
        catalog.add_tablet(1, 10, 100, 1000, 3);
        catalog.add_tablet(1, 10, 101, 1001, 3);
        assert_eq!(catalog.tablet_meta(1000).unwrap().quorum(), 2);

        assert!(catalog.drop_partition(1, 10, 100));
        assert!(catalog.tablet_meta(1000).is_none());
        assert!(catalog.tablet_meta(1001).is_some());

        assert!(catalog.drop_table(1, 10));
        assert!(!catalog.drop_table(1, 10));
        assert!(catalog.tablet_meta(1001).is_none());
        assert!(!catalog.table_exists(1, 10));
    }
}
