// Copyright (c) 2024 - Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;

use crate::identifiers::{PartitionId, PartitionKey, WithPartitionKey};
use crate::{NodeId, Version, Versioned};

#[derive(Debug, thiserror::Error)]
#[error("Cannot find partition for partition key '{0}'")]
pub struct PartitionTableError(PartitionKey);

pub trait FindPartition {
    fn find_partition_id(
        &self,
        partition_key: PartitionKey,
    ) -> Result<PartitionId, PartitionTableError>;
}

/// The nodes holding a copy of a partition. The replica at index `0` is the primary owner,
/// replica `n > 0` is the `n`-th backup.
#[derive(Debug, Clone, Default, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ReplicaSet(Vec<NodeId>);

impl ReplicaSet {
    pub fn new(replicas: impl IntoIterator<Item = NodeId>) -> Self {
        Self(replicas.into_iter().collect())
    }

    pub fn owner(&self) -> Option<NodeId> {
        self.0.first().copied()
    }

    /// Backup nodes in replica order.
    pub fn backups(&self) -> &[NodeId] {
        self.0.get(1..).unwrap_or_default()
    }

    /// Position of `node` in this replica set, if it holds a copy at all.
    pub fn replica_index_of(&self, node: NodeId) -> Option<usize> {
        self.0.iter().position(|n| *n == node)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PartitionTable {
    version: Version,
    partitions: BTreeMap<PartitionId, Partition>,
    // Interval-map like structure which maps the inclusive end partition key of a partition to its
    // [`PartitionId`]. To validate that a partition key falls into a partition one also needs to
    // verify that the start partition key is smaller or equal than the given key, because holes
    // are not visible from this index structure.
    partition_key_index: BTreeMap<PartitionKey, PartitionId>,
}

impl Default for PartitionTable {
    fn default() -> Self {
        Self {
            version: Version::INVALID,
            partitions: BTreeMap::default(),
            partition_key_index: BTreeMap::default(),
        }
    }
}

impl PartitionTable {
    pub fn with_equally_sized_partitions(version: Version, number_partitions: u64) -> Self {
        let partitioner = EqualSizedPartitionPartitioner::new(number_partitions);
        let mut builder = PartitionTableBuilder::new(version);

        for (partition_id, partition_key_range) in partitioner {
            builder
                .add_partition(partition_id, Partition::new(partition_key_range))
                .expect("partitions should not overlap");
        }

        builder.build_with_same_version()
    }

    /// Creates equally sized partitions and places `replication_factor` replicas of each of
    /// them on `nodes` in a round-robin fashion. Partition `i` is owned by `nodes[i % n]` and
    /// backed up by the nodes following it.
    pub fn with_round_robin_placement(
        version: Version,
        number_partitions: u64,
        nodes: &[NodeId],
        replication_factor: usize,
    ) -> Self {
        let mut table = Self::with_equally_sized_partitions(version, number_partitions);
        if nodes.is_empty() {
            return table;
        }

        let replication_factor = replication_factor.clamp(1, nodes.len());
        for (idx, (_, partition)) in table.partitions.iter_mut().enumerate() {
            partition.replicas = ReplicaSet::new(
                (0..replication_factor).map(|offset| nodes[(idx + offset) % nodes.len()]),
            );
        }
        table
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn partitions(&self) -> impl Iterator<Item = (&PartitionId, &Partition)> {
        self.partitions.iter()
    }

    /// Resolves the partition that is responsible for the given name.
    pub fn partition_id_for<K: WithPartitionKey + ?Sized>(
        &self,
        key: &K,
    ) -> Result<PartitionId, PartitionTableError> {
        self.find_partition_id(key.partition_key())
    }

    pub fn owner_of(&self, partition_id: PartitionId) -> Option<NodeId> {
        self.partitions
            .get(&partition_id)
            .and_then(|partition| partition.replicas.owner())
    }

    pub fn replicas_of(&self, partition_id: PartitionId) -> Option<&ReplicaSet> {
        self.partitions
            .get(&partition_id)
            .map(|partition| &partition.replicas)
    }
}

impl Versioned for PartitionTable {
    fn version(&self) -> Version {
        self.version
    }
}

impl FindPartition for PartitionTable {
    fn find_partition_id(
        &self,
        partition_key: PartitionKey,
    ) -> Result<PartitionId, PartitionTableError> {
        // partition key ranges are inclusive, so let's look for the next partition key boundary >=
        // partition_key to find the owning partition candidate
        let candidate = self
            .partition_key_index
            .range(partition_key..)
            .next()
            .map(|(_, partition_id)| *partition_id)
            .ok_or(PartitionTableError(partition_key))?;

        // next we validate that the partition key is actually contained within the partition
        self.partitions
            .get(&candidate)
            .and_then(|partition| {
                if partition.key_range.start() <= &partition_key {
                    Some(candidate)
                } else {
                    None
                }
            })
            .ok_or(PartitionTableError(partition_key))
    }
}

#[derive(Debug, Clone, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Partition {
    pub key_range: RangeInclusive<PartitionKey>,
    pub replicas: ReplicaSet,
}

impl Partition {
    pub fn new(key_range: RangeInclusive<PartitionKey>) -> Self {
        Self {
            key_range,
            replicas: ReplicaSet::default(),
        }
    }
}

/// Errors when building a [`PartitionTable`] via the [`PartitionTableBuilder`].
#[derive(Debug, thiserror::Error)]
pub enum BuilderError {
    #[error("the new partition overlaps with partition '{0}'")]
    Overlap(PartitionId),
    #[error("partition '{0}' already exists")]
    Duplicate(PartitionId),
    #[error("partition '{0}' does not exist")]
    Unknown(PartitionId),
}

#[derive(Debug, Default)]
pub struct PartitionTableBuilder {
    inner: PartitionTable,
}

impl PartitionTableBuilder {
    fn new(version: Version) -> Self {
        let inner = PartitionTable {
            version,
            ..Default::default()
        };
        Self { inner }
    }

    /// Adds a new partition to the partition table. The newly added partition must exist and must
    /// not intersect with any other partition. Otherwise, this operation fails.
    pub fn add_partition(
        &mut self,
        partition_id: PartitionId,
        partition: Partition,
    ) -> Result<(), BuilderError> {
        if self.inner.partitions.contains_key(&partition_id) {
            return Err(BuilderError::Duplicate(partition_id));
        }

        let start = *partition.key_range.start();
        let end = *partition.key_range.end();

        // the next partition ending at or after `end` overlaps if it starts before `end`
        let next = self
            .inner
            .partition_key_index
            .range(end..)
            .next()
            .and_then(|(_, id)| self.inner.partitions.get(id).map(|p| (*id, p)));
        if let Some((next_id, next)) = next {
            if *next.key_range.start() <= end {
                return Err(BuilderError::Overlap(next_id));
            }
        }

        if let Some((_, partition_id)) = self.inner.partition_key_index.range(start..end).next() {
            return Err(BuilderError::Overlap(*partition_id));
        }

        self.inner.partitions.insert(partition_id, partition);
        self.inner.partition_key_index.insert(end, partition_id);

        Ok(())
    }

    /// Replaces the replica placement of an existing partition. This is how a rebalancing
    /// decision (migration of ownership or backups) is expressed in the table.
    pub fn set_replicas(
        &mut self,
        partition_id: PartitionId,
        replicas: ReplicaSet,
    ) -> Result<(), BuilderError> {
        let partition = self
            .inner
            .partitions
            .get_mut(&partition_id)
            .ok_or(BuilderError::Unknown(partition_id))?;
        partition.replicas = replicas;
        Ok(())
    }

    /// Builds the new [`PartitionTable`] with an incremented version.
    pub fn build(mut self) -> PartitionTable {
        self.inner.version = Version::MIN.max(self.inner.version.next());
        self.inner
    }

    /// Builds the new [`PartitionTable`] with the same version.
    fn build_with_same_version(self) -> PartitionTable {
        self.inner
    }
}

impl From<PartitionTable> for PartitionTableBuilder {
    fn from(value: PartitionTable) -> Self {
        Self { inner: value }
    }
}

#[derive(Debug)]
pub struct EqualSizedPartitionPartitioner {
    num_partitions: u64,
    next_partition_id: PartitionId,
}

impl EqualSizedPartitionPartitioner {
    const PARTITION_KEY_RANGE_END: u128 = 1 << 64;

    fn new(num_partitions: u64) -> Self {
        Self {
            num_partitions,
            next_partition_id: PartitionId::MIN,
        }
    }

    fn partition_id_to_partition_range(
        num_partitions: u64,
        partition_id: PartitionId,
    ) -> RangeInclusive<PartitionKey> {
        let num_partitions = u128::from(num_partitions);
        let partition_id = u128::from(*partition_id);

        assert!(
            partition_id < num_partitions,
            "There cannot be a partition id which is larger than the number of partitions \
                '{num_partitions}', when using the fixed consecutive partitioning scheme."
        );

        // adding num_partitions - 1 to dividend is equivalent to applying ceil function to result
        let start =
            (partition_id * Self::PARTITION_KEY_RANGE_END + (num_partitions - 1)) / num_partitions;
        let end = ((partition_id + 1) * Self::PARTITION_KEY_RANGE_END + (num_partitions - 1))
            / num_partitions
            - 1;

        let start = u64::try_from(start)
            .expect("Resulting partition start '{start}' should be <= u64::MAX.");
        let end =
            u64::try_from(end).expect("Resulting partition end '{end}' should be <= u64::MAX.");

        start..=end
    }
}

impl Iterator for EqualSizedPartitionPartitioner {
    type Item = (PartitionId, RangeInclusive<PartitionKey>);

    fn next(&mut self) -> Option<Self::Item> {
        if u64::from(self.next_partition_id) < self.num_partitions {
            let partition_id = self.next_partition_id;
            self.next_partition_id = self.next_partition_id.next();

            let partition_range =
                Self::partition_id_to_partition_range(self.num_partitions, partition_id);

            Some((partition_id, partition_range))
        } else {
            None
        }
    }
}
