// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use permitgrid_core::service::MigrationAware;
use permitgrid_types::cluster::{
    MigrationEndpoint, PartitionMigrationEvent, PartitionReplicationEvent,
};
use permitgrid_types::identifiers::PartitionId;

use crate::permit::PermitState;
use crate::registry::PermitRegistry;

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("failed encoding migration payload: {0}")]
    Encode(#[from] flexbuffers::SerializationError),
    #[error("failed decoding migration payload: {0}")]
    Decode(#[from] flexbuffers::DeserializationError),
}

/// Full copies of the semaphores of one partition, shipped to a node that is going to own
/// or back up that partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPayload {
    entries: BTreeMap<String, PermitState>,
}

impl MigrationPayload {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&PermitState> {
        self.entries.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, PayloadError> {
        Ok(flexbuffers::to_vec(self)?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, PayloadError> {
        Ok(flexbuffers::from_slice(bytes)?)
    }
}

impl FromIterator<(String, PermitState)> for MigrationPayload {
    fn from_iter<T: IntoIterator<Item = (String, PermitState)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for MigrationPayload {
    type Item = (String, PermitState);
    type IntoIter = std::collections::btree_map::IntoIter<String, PermitState>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Moves semaphore state along with partition ownership.
///
/// Payloads are whole snapshots, the receiving side replaces whatever it holds for the same
/// names. Cleanup of a partition that holds nothing locally is a no-op.
pub struct MigrationCoordinator {
    registry: Arc<PermitRegistry>,
}

impl MigrationCoordinator {
    pub fn new(registry: Arc<PermitRegistry>) -> Self {
        Self { registry }
    }

    fn clear_partition(&self, partition_id: PartitionId, reason: &'static str) {
        let removed = self.registry.clear_for_partition(partition_id);
        if removed > 0 {
            info!(%partition_id, removed, reason, "Dropped semaphores of partition");
        } else {
            trace!(%partition_id, reason, "No semaphores to drop for partition");
        }
    }
}

impl MigrationAware for MigrationCoordinator {
    type Payload = MigrationPayload;

    fn before_migration(&self, event: &PartitionMigrationEvent) {
        trace!(
            partition_id = %event.partition_id,
            endpoint = %event.endpoint,
            peer = %event.peer,
            "Partition migration starting"
        );
    }

    fn prepare_replication(&self, event: &PartitionReplicationEvent) -> Option<MigrationPayload> {
        let payload = self
            .registry
            .entries_for_partition(event.partition_id, event.replica_index)?;
        debug!(
            partition_id = %event.partition_id,
            replica_index = event.replica_index,
            semaphores = payload.len(),
            "Prepared replication payload"
        );
        Some(payload)
    }

    fn insert_migration_data(&self, payload: MigrationPayload) {
        debug!(semaphores = payload.len(), "Installing migrated semaphores");
        self.registry.install_all(payload);
    }

    fn commit_migration(&self, event: &PartitionMigrationEvent) {
        if event.endpoint == MigrationEndpoint::Source {
            self.clear_partition(event.partition_id, "migrated away");
        }
    }

    fn rollback_migration(&self, event: &PartitionMigrationEvent) {
        if event.endpoint == MigrationEndpoint::Destination {
            self.clear_partition(event.partition_id, "migration rolled back");
        }
    }

    fn clear_partition_replica(&self, partition_id: PartitionId) {
        self.clear_partition(partition_id, "replica cleared");
    }
}
