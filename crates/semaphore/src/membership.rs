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

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::Xxh3Builder;

use permitgrid_core::service::MembershipAware;
use permitgrid_types::NodeId;
use permitgrid_types::identifiers::OwnerId;

use crate::operation::{OperationExecutor, PermitOperation};

/// Cancellation handles of the blocking acquires in flight, per requesting owner.
#[derive(Default)]
pub struct PendingWaits {
    tokens: DashMap<OwnerId, PendingWait, Xxh3Builder>,
}

struct PendingWait {
    token: CancellationToken,
    acquires: usize,
}

impl PendingWaits {
    /// Registers a blocking acquire of `owner`. The returned registration is cancelled once
    /// `owner` goes away and unregisters itself when dropped.
    pub fn register(&self, owner: OwnerId) -> WaitRegistration<'_> {
        let mut pending = self.tokens.entry(owner).or_insert_with(|| PendingWait {
            token: CancellationToken::new(),
            acquires: 0,
        });
        pending.acquires += 1;
        WaitRegistration {
            waits: self,
            owner,
            token: pending.token.clone(),
        }
    }

    /// Drops every pending wait of `owner`. Returns whether there was any.
    pub fn cancel(&self, owner: &OwnerId) -> bool {
        // cancelled under the entry lock, see `WaitRegistration::drop`
        self.tokens
            .remove_if(owner, |_, pending| {
                pending.token.cancel();
                true
            })
            .is_some()
    }

    pub fn cancel_all(&self) {
        self.tokens.retain(|_, pending| {
            pending.token.cancel();
            false
        });
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// A blocking acquire registered in [`PendingWaits`].
pub struct WaitRegistration<'a> {
    waits: &'a PendingWaits,
    owner: OwnerId,
    token: CancellationToken,
}

impl WaitRegistration<'_> {
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}

impl Drop for WaitRegistration<'_> {
    fn drop(&mut self) {
        if let Entry::Occupied(mut entry) = self.waits.tokens.entry(self.owner) {
            // a cancelled token was already removed, the entry belongs to later acquires
            if self.token.is_cancelled() {
                return;
            }
            let pending = entry.get_mut();
            pending.acquires = pending.acquires.saturating_sub(1);
            if pending.acquires == 0 {
                entry.remove();
            }
        }
    }
}

/// Returns the permits of members and clients that left without releasing them.
///
/// Only semaphores of partitions this node owns are handled here, the owners of the other
/// partitions receive the same notification.
pub struct MembershipReactor {
    executor: Arc<OperationExecutor>,
    waits: Arc<PendingWaits>,
}

impl MembershipReactor {
    pub fn new(executor: Arc<OperationExecutor>, waits: Arc<PendingWaits>) -> Self {
        Self { executor, waits }
    }

    fn on_owner_gone(&self, owner: OwnerId) {
        if self.waits.cancel(&owner) {
            debug!(%owner, "Cancelled pending acquires");
        }

        let metadata = self.executor.metadata();
        let partitions = self.executor.registry().names_per_partition();
        for partition_id in partitions
            .into_keys()
            .filter(|partition_id| metadata.is_owner(*partition_id))
        {
            if let Err(err) = self
                .executor
                .submit(PermitOperation::ReclaimAttachments {
                    partition_id,
                    owner,
                })
            {
                warn!(%partition_id, %owner, %err, "Failed to schedule reclaiming of permits");
            }
        }
    }
}

impl MembershipAware for MembershipReactor {
    fn member_removed(&self, node: NodeId, member: OwnerId) {
        info!(%node, %member, "Member left, reclaiming its permits");
        self.on_owner_gone(member);
    }

    fn client_disconnected(&self, client: OwnerId) {
        debug!(%client, "Client disconnected, reclaiming its permits");
        self.on_owner_gone(client);
    }
}
