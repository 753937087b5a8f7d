// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Capabilities a service exposes to the node hosting it.
//!
//! Each concern is a separate trait so that a service can be composed from independent
//! components, and each component can be exercised on its own.

use permitgrid_types::NodeId;
use permitgrid_types::cluster::{
    MembershipEvent, PartitionMigrationEvent, PartitionReplicationEvent,
};
use permitgrid_types::identifiers::{OwnerId, PartitionId};

/// Lifecycle of a service instance on a node.
pub trait ManagedService: Send + Sync {
    type Options;

    fn service_name(&self) -> &'static str;

    /// (Re)initializes the service with the given options.
    fn init(&self, options: &Self::Options);

    /// Drops all state held by the service, e.g. when the node rejoins a cluster.
    fn reset(&self);

    /// `terminate` is set when the node is going down without a graceful handoff.
    fn shutdown(&self, terminate: bool);
}

/// Participation in partition migrations and replica maintenance.
pub trait MigrationAware: Send + Sync {
    type Payload;

    fn before_migration(&self, event: &PartitionMigrationEvent);

    /// Data to ship to the replica described by `event`, `None` if there is nothing to send.
    fn prepare_replication(&self, event: &PartitionReplicationEvent) -> Option<Self::Payload>;

    fn insert_migration_data(&self, payload: Self::Payload);

    fn commit_migration(&self, event: &PartitionMigrationEvent);

    fn rollback_migration(&self, event: &PartitionMigrationEvent);

    fn clear_partition_replica(&self, partition_id: PartitionId);
}

/// Reaction to members joining or leaving, and to clients disconnecting.
pub trait MembershipAware: Send + Sync {
    fn member_added(&self, _node: NodeId, _member: OwnerId) {}

    fn member_removed(&self, node: NodeId, member: OwnerId);

    fn client_disconnected(&self, client: OwnerId);

    fn on_membership_event(&self, event: &MembershipEvent) {
        match *event {
            MembershipEvent::MemberAdded { node, member } => self.member_added(node, member),
            MembershipEvent::MemberRemoved { node, member } => self.member_removed(node, member),
            MembershipEvent::ClientDisconnected(client) => self.client_disconnected(client),
        }
    }
}

/// Factory for the client-facing handles of named objects.
pub trait RemoteService: Send + Sync {
    type Proxy;

    fn create_distributed_object(&self, name: &str) -> Self::Proxy;

    fn destroy_distributed_object(&self, name: &str);
}
