// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tracing::{debug, trace};

use permitgrid_types::identifiers::{PartitionId, WithPartitionKey};
use permitgrid_types::partition_table::{PartitionTable, ReplicaSet};
use permitgrid_types::{NodeId, Version, Versioned};

/// This node's view of the cluster: who it is and the latest partition table it has seen.
///
/// Cheap to clone, all clones observe the same updates.
#[derive(Clone)]
pub struct Metadata {
    inner: Arc<MetadataInner>,
}

struct MetadataInner {
    my_node_id: NodeId,
    partition_table: ArcSwap<PartitionTable>,
    version_watch: watch::Sender<Version>,
}

impl Metadata {
    pub fn new(my_node_id: NodeId, partition_table: PartitionTable) -> Self {
        let (version_watch, _) = watch::channel(partition_table.version());
        Self {
            inner: Arc::new(MetadataInner {
                my_node_id,
                partition_table: ArcSwap::from_pointee(partition_table),
                version_watch,
            }),
        }
    }

    pub fn my_node_id(&self) -> NodeId {
        self.inner.my_node_id
    }

    pub fn partition_table_snapshot(&self) -> Arc<PartitionTable> {
        self.inner.partition_table.load_full()
    }

    /// Watch the version of the partition table as it gets updated.
    pub fn watch_partition_table(&self) -> watch::Receiver<Version> {
        self.inner.version_watch.subscribe()
    }

    /// Installs `partition_table` if it is newer than the one currently known.
    ///
    /// Returns whether the table was installed.
    pub fn update_partition_table(&self, partition_table: PartitionTable) -> bool {
        let new_version = partition_table.version();
        let new_table = Arc::new(partition_table);
        let previous = self.inner.partition_table.rcu(|current| {
            if current.version() < new_version {
                Arc::clone(&new_table)
            } else {
                Arc::clone(current)
            }
        });

        if previous.version() < new_version {
            debug!(
                from = %previous.version(),
                to = %new_version,
                "Partition table updated"
            );
            self.inner.version_watch.send_replace(new_version);
            true
        } else {
            trace!(
                current = %previous.version(),
                ignored = %new_version,
                "Ignoring stale partition table"
            );
            false
        }
    }

    pub fn partition_id_for<K: WithPartitionKey + ?Sized>(&self, key: &K) -> Option<PartitionId> {
        self.inner.partition_table.load().partition_id_for(key).ok()
    }

    pub fn replicas_of(&self, partition_id: PartitionId) -> Option<ReplicaSet> {
        self.inner
            .partition_table
            .load()
            .replicas_of(partition_id)
            .cloned()
    }

    pub fn owner_of(&self, partition_id: PartitionId) -> Option<NodeId> {
        self.inner.partition_table.load().owner_of(partition_id)
    }

    /// Whether this node is the primary owner of `partition_id` in the latest table.
    pub fn is_owner(&self, partition_id: PartitionId) -> bool {
        self.owner_of(partition_id) == Some(self.inner.my_node_id)
    }
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;

    use permitgrid_types::partition_table::PartitionTableBuilder;

    use super::*;

    fn table(num_partitions: u64, nodes: &[NodeId]) -> PartitionTable {
        PartitionTable::with_round_robin_placement(Version::MIN, num_partitions, nodes, 2)
    }

    #[test]
    fn only_newer_tables_are_installed() {
        let n1 = NodeId::new(1);
        let n2 = NodeId::new(2);
        let metadata = Metadata::new(n1, table(4, &[n1, n2]));
        let mut watch = metadata.watch_partition_table();

        let mut builder =
            PartitionTableBuilder::from(metadata.partition_table_snapshot().as_ref().clone());
        builder
            .set_replicas(PartitionId::MIN, ReplicaSet::new([n2, n1]))
            .unwrap();
        let moved = builder.build();

        assert!(metadata.is_owner(PartitionId::MIN));
        assert!(metadata.update_partition_table(moved.clone()));
        assert!(!metadata.is_owner(PartitionId::MIN));
        assert_that!(metadata.owner_of(PartitionId::MIN), some(eq(n2)));
        assert!(watch.has_changed().unwrap());
        assert_that!(*watch.borrow_and_update(), eq(moved.version()));

        // same version again is ignored
        assert!(!metadata.update_partition_table(moved));
        assert!(!watch.has_changed().unwrap());
    }
}
