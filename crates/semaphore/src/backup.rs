// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use permitgrid_types::NodeId;

use crate::permit::PermitState;

/// Ships the state of a semaphore to the nodes backing up its partition.
///
/// Called on the partition's executor after every mutation, implementations must not block.
/// Receivers install the state wholesale, see [`crate::SemaphoreService::install_backup`].
pub trait BackupReplicator: Send + Sync + 'static {
    fn replicate(&self, name: &str, state: &PermitState, targets: &[NodeId]);
}

/// For nodes without peers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReplicator;

impl BackupReplicator for NoopReplicator {
    fn replicate(&self, _name: &str, _state: &PermitState, _targets: &[NodeId]) {}
}

/// Nodes receiving a copy of the semaphore, the first `total_backup_count` backups of the
/// partition.
pub(crate) fn backup_targets(backups: &[NodeId], state: &PermitState) -> Vec<NodeId> {
    backups
        .iter()
        .take(usize::from(state.config().total_backup_count()))
        .copied()
        .collect()
}
