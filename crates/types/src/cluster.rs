// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Events emitted by the membership and partition subsystems.

use crate::NodeId;
use crate::identifiers::{OwnerId, PartitionId};

/// Membership change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipEvent {
    MemberAdded { node: NodeId, member: OwnerId },
    MemberRemoved { node: NodeId, member: OwnerId },
    ClientDisconnected(OwnerId),
}

/// Which side of a partition migration the local node is on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, serde::Serialize, serde::Deserialize,
)]
#[strum(serialize_all = "snake_case")]
pub enum MigrationEndpoint {
    Source,
    Destination,
}

/// A partition changes hands (or a replica of it moves) between two nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionMigrationEvent {
    pub partition_id: PartitionId,
    pub endpoint: MigrationEndpoint,
    /// The node on the other side of the migration.
    pub peer: NodeId,
}

impl PartitionMigrationEvent {
    pub fn new(partition_id: PartitionId, endpoint: MigrationEndpoint, peer: NodeId) -> Self {
        Self {
            partition_id,
            endpoint,
            peer,
        }
    }
}

/// Request to build the data a replica at `replica_index` of `partition_id` should hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionReplicationEvent {
    pub partition_id: PartitionId,
    pub replica_index: usize,
}

impl PartitionReplicationEvent {
    pub fn new(partition_id: PartitionId, replica_index: usize) -> Self {
        Self {
            partition_id,
            replica_index,
        }
    }
}
