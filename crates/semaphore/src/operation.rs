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

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use permitgrid_core::{Metadata, PartitionScheduler, run_on_partition};
use permitgrid_types::identifiers::{OwnerId, PartitionId};

use crate::SemaphoreError;
use crate::backup::{BackupReplicator, backup_targets};
use crate::registry::PermitRegistry;

/// An action on semaphore state, executed on the node owning the target partition.
#[derive(Debug, Clone, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum PermitOperation {
    TryAcquire {
        name: String,
        owner: OwnerId,
        permits: u32,
        attach: bool,
    },
    Release {
        name: String,
        owner: OwnerId,
        permits: u32,
    },
    DrainPermits {
        name: String,
        owner: OwnerId,
    },
    Reduce {
        name: String,
        permits: u32,
    },
    AvailablePermits {
        name: String,
    },
    Init {
        name: String,
        permits: u32,
    },
    /// Undoes an acquire that succeeded after `owner` went away.
    AbandonAcquire {
        name: String,
        owner: OwnerId,
        permits: u32,
        attach: bool,
    },
    /// Returns everything `owner` holds on the semaphores of `partition_id`.
    ReclaimAttachments {
        partition_id: PartitionId,
        owner: OwnerId,
    },
}

impl PermitOperation {
    /// The semaphore the operation addresses, `None` for partition-wide operations.
    pub fn name(&self) -> Option<&str> {
        match self {
            PermitOperation::TryAcquire { name, .. }
            | PermitOperation::Release { name, .. }
            | PermitOperation::DrainPermits { name, .. }
            | PermitOperation::Reduce { name, .. }
            | PermitOperation::AvailablePermits { name }
            | PermitOperation::Init { name, .. }
            | PermitOperation::AbandonAcquire { name, .. } => Some(name),
            PermitOperation::ReclaimAttachments { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationOutcome {
    Acquired(bool),
    Released,
    Drained(u32),
    Reduced,
    Available(u32),
    Initialized(bool),
    Reclaimed(u32),
}

/// Routes operations to the executor of their partition and applies them there.
///
/// Applying an operation re-checks that this node still owns the partition, afterwards
/// waiting acquires are woken and the new state is handed to the backups.
pub struct OperationExecutor {
    registry: Arc<PermitRegistry>,
    metadata: Metadata,
    scheduler: Arc<dyn PartitionScheduler>,
    replicator: Arc<dyn BackupReplicator>,
    shutdown: CancellationToken,
}

impl OperationExecutor {
    pub fn new(
        registry: Arc<PermitRegistry>,
        metadata: Metadata,
        scheduler: Arc<dyn PartitionScheduler>,
        replicator: Arc<dyn BackupReplicator>,
    ) -> Self {
        Self {
            registry,
            metadata,
            scheduler,
            replicator,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &Arc<PermitRegistry> {
        &self.registry
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Fires once the service is shutting down.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn target_partition(
        &self,
        operation: &PermitOperation,
    ) -> Result<PartitionId, SemaphoreError> {
        match operation {
            PermitOperation::ReclaimAttachments { partition_id, .. } => Ok(*partition_id),
            other => {
                let name = other.name().unwrap_or_default();
                self.registry.partition_of(name)
            }
        }
    }

    /// Runs `operation` on its partition and waits for the outcome.
    pub async fn invoke(
        self: &Arc<Self>,
        operation: PermitOperation,
    ) -> Result<OperationOutcome, SemaphoreError> {
        if self.shutdown.is_cancelled() {
            return Err(SemaphoreError::Shutdown);
        }

        let partition_id = self.target_partition(&operation)?;
        let this = Arc::clone(self);
        run_on_partition(self.scheduler.as_ref(), partition_id, move || {
            this.apply(partition_id, operation)
        })
        .await?
    }

    /// Queues `operation` on its partition without waiting for it.
    pub fn submit(self: &Arc<Self>, operation: PermitOperation) -> Result<(), SemaphoreError> {
        if self.shutdown.is_cancelled() {
            return Err(SemaphoreError::Shutdown);
        }

        let partition_id = self.target_partition(&operation)?;
        let this = Arc::clone(self);
        self.scheduler.submit(
            partition_id,
            Box::new(move || {
                let kind: &'static str = (&operation).into();
                if let Err(err) = this.apply(partition_id, operation) {
                    warn!(%partition_id, operation = kind, %err, "Queued operation failed");
                }
            }),
        )?;
        Ok(())
    }

    /// Must only be called on the executor of `partition_id`.
    fn apply(
        &self,
        partition_id: PartitionId,
        operation: PermitOperation,
    ) -> Result<OperationOutcome, SemaphoreError> {
        if !self.metadata.is_owner(partition_id) {
            return Err(SemaphoreError::NotOwner {
                partition_id,
                node: self.metadata.my_node_id(),
            });
        }

        trace!(%partition_id, ?operation, "Applying operation");
        let outcome = match operation {
            PermitOperation::TryAcquire {
                name,
                owner,
                permits,
                attach,
            } => {
                let acquired = self
                    .registry
                    .with_permit_mut(&name, |state| state.try_acquire(owner, permits, attach))??;
                if acquired {
                    self.after_mutation(partition_id, &name);
                }
                OperationOutcome::Acquired(acquired)
            }
            PermitOperation::Release {
                name,
                owner,
                permits,
            } => {
                self.registry
                    .with_permit_mut(&name, |state| state.release(owner, permits))??;
                self.after_mutation(partition_id, &name);
                OperationOutcome::Released
            }
            PermitOperation::DrainPermits { name, owner } => {
                let drained = self
                    .registry
                    .with_permit_mut(&name, |state| state.drain_permits())?;
                debug!(%name, %owner, drained, "Drained permits");
                self.after_mutation(partition_id, &name);
                OperationOutcome::Drained(drained)
            }
            PermitOperation::Reduce { name, permits } => {
                self.registry
                    .with_permit_mut(&name, |state| state.reduce(permits))?;
                self.after_mutation(partition_id, &name);
                OperationOutcome::Reduced
            }
            PermitOperation::AvailablePermits { name } => OperationOutcome::Available(
                self.registry
                    .with_permit_mut(&name, |state| state.available_permits())?,
            ),
            PermitOperation::Init { name, permits } => {
                let initialized = self
                    .registry
                    .with_permit_mut(&name, |state| state.init(permits))?;
                self.after_mutation(partition_id, &name);
                OperationOutcome::Initialized(initialized)
            }
            PermitOperation::AbandonAcquire {
                name,
                owner,
                permits,
                attach,
            } => {
                let returned = self.registry.with_permit_mut(&name, |state| {
                    state.abandon_acquire(&owner, permits, attach)
                })?;
                debug!(%name, %owner, returned, "Abandoned acquire of departed owner");
                if returned > 0 {
                    self.after_mutation(partition_id, &name);
                }
                OperationOutcome::Reclaimed(returned)
            }
            PermitOperation::ReclaimAttachments { owner, .. } => {
                let mut reclaimed = 0u32;
                for name in self.names_in(partition_id) {
                    let released = self
                        .registry
                        .with_permit_mut(&name, |state| state.release_attachments_of(&owner))?;
                    if released > 0 {
                        debug!(%name, %owner, released, "Reclaimed attached permits");
                        reclaimed = reclaimed.saturating_add(released);
                        self.after_mutation(partition_id, &name);
                    }
                }
                OperationOutcome::Reclaimed(reclaimed)
            }
        };
        Ok(outcome)
    }

    fn names_in(&self, partition_id: PartitionId) -> Vec<String> {
        self.registry
            .names_per_partition()
            .remove(&partition_id)
            .unwrap_or_default()
    }

    fn after_mutation(&self, partition_id: PartitionId, name: &str) {
        self.registry.notify_waiters(name);

        let Some(state) = self.registry.get(name) else {
            return;
        };
        let Some(replicas) = self.metadata.replicas_of(partition_id) else {
            return;
        };
        let targets = backup_targets(replicas.backups(), &state);
        if !targets.is_empty() {
            self.replicator.replicate(name, &state, &targets);
        }
    }
}
