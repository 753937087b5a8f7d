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

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use permitgrid_types::config::SemaphoreOptions;
use permitgrid_types::identifiers::{OwnerId, PartitionId};

use crate::SemaphoreError;

/// State of a single named semaphore.
///
/// Only the node owning `partition_id` mutates it, copies held by backups are replaced
/// wholesale. As long as every release is matched by an acquire,
/// `available + attached_total() <= max_permits()` holds.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermitState {
    partition_id: PartitionId,
    config: SemaphoreOptions,
    available: u32,
    max_permits: u32,
    /// Never contains zero counts.
    #[serde_as(as = "Vec<(_, _)>")]
    attachments: BTreeMap<OwnerId, u32>,
}

impl PermitState {
    /// `config` is a copy, later changes of the configuration don't affect this semaphore.
    pub fn new(partition_id: PartitionId, config: SemaphoreOptions) -> Self {
        Self {
            partition_id,
            available: config.initial_permits,
            max_permits: config.initial_permits,
            config,
            attachments: BTreeMap::new(),
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn config(&self) -> &SemaphoreOptions {
        &self.config
    }

    pub fn available_permits(&self) -> u32 {
        self.available
    }

    /// Effective size of the pool.
    pub fn max_permits(&self) -> u32 {
        self.max_permits
    }

    pub fn attached_permits(&self, owner: &OwnerId) -> u32 {
        self.attachments.get(owner).copied().unwrap_or_default()
    }

    pub fn attached_total(&self) -> u32 {
        self.attachments
            .values()
            .fold(0u32, |total, held| total.saturating_add(*held))
    }

    pub fn attachments(&self) -> impl Iterator<Item = (&OwnerId, u32)> {
        self.attachments.iter().map(|(owner, held)| (owner, *held))
    }

    /// Takes `permits` if all of them are available. Returns whether they were taken.
    ///
    /// With `attach` set (and the semaphore being attachable), the permits are recorded
    /// against `owner` so they can be reclaimed if the owner goes away.
    pub fn try_acquire(
        &mut self,
        owner: OwnerId,
        permits: u32,
        attach: bool,
    ) -> Result<bool, SemaphoreError> {
        self.check_request(permits)?;
        if self.available < permits {
            return Ok(false);
        }

        self.available -= permits;
        if attach && self.config.attachable {
            let held = self.attachments.entry(owner).or_default();
            *held = held.saturating_add(permits);
        }
        Ok(true)
    }

    /// Returns `permits` to the pool. Surplus beyond the pool size is dropped, so duplicate
    /// releases are harmless.
    pub fn release(&mut self, owner: OwnerId, permits: u32) -> Result<(), SemaphoreError> {
        if permits == 0 {
            return Err(SemaphoreError::InvalidArgument(
                "permits to release must be positive".to_owned(),
            ));
        }

        if let Some(held) = self.attachments.get_mut(&owner) {
            *held = held.saturating_sub(permits);
            if *held == 0 {
                self.attachments.remove(&owner);
            }
        }
        self.credit(permits);
        Ok(())
    }

    /// Takes every available permit, returning how many there were.
    pub fn drain_permits(&mut self) -> u32 {
        std::mem::take(&mut self.available)
    }

    /// Shrinks the pool for good. Attachments are left alone.
    pub fn reduce(&mut self, permits: u32) {
        self.max_permits = self.max_permits.saturating_sub(permits);
        self.available = self.available.saturating_sub(permits).min(self.max_permits);
    }

    /// Re-seeds the semaphore with `permits` available. Attached permits come on top, they
    /// still return to the pool when released.
    pub fn init(&mut self, permits: u32) -> bool {
        self.available = permits;
        self.max_permits = permits.saturating_add(self.attached_total());
        true
    }

    /// Drops the attachment of `owner` and returns its permits to the pool.
    ///
    /// Returns the number of permits the owner held.
    pub fn release_attachments_of(&mut self, owner: &OwnerId) -> u32 {
        match self.attachments.remove(owner) {
            Some(held) => {
                self.credit(held);
                held
            }
            None => 0,
        }
    }

    /// Gives back the permits of an acquire whose owner went away while it was in flight.
    /// Attached permits return through the owner's attachment, so permits reclaimed in the
    /// meantime aren't credited twice.
    pub fn abandon_acquire(&mut self, owner: &OwnerId, permits: u32, attach: bool) -> u32 {
        if attach && self.config.attachable {
            self.release_attachments_of(owner)
        } else {
            self.credit(permits);
            permits
        }
    }

    fn credit(&mut self, permits: u32) {
        let ceiling = self.max_permits.saturating_sub(self.attached_total());
        let credited = self.available.saturating_add(permits).min(ceiling);
        self.available = self.available.max(credited);
    }

    fn check_request(&self, permits: u32) -> Result<(), SemaphoreError> {
        if permits == 0 {
            return Err(SemaphoreError::InvalidArgument(
                "permits to acquire must be positive".to_owned(),
            ));
        }
        if permits > self.max_permits {
            return Err(SemaphoreError::Capacity {
                requested: permits,
                max: self.max_permits,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;

    use super::*;

    fn permit(initial_permits: u32) -> PermitState {
        PermitState::new(
            PartitionId::MIN,
            SemaphoreOptions {
                initial_permits,
                ..Default::default()
            },
        )
    }

    fn accounted(state: &PermitState) -> u32 {
        state.available_permits() + state.attached_total()
    }

    #[test]
    fn acquire_is_all_or_nothing() {
        let mut state = permit(3);
        let owner = OwnerId::new();

        assert_that!(state.try_acquire(owner, 2, true), ok(eq(true)));
        assert_that!(state.try_acquire(owner, 2, true), ok(eq(false)));
        assert_that!(state.available_permits(), eq(1));
        assert_that!(state.attached_permits(&owner), eq(2));
    }

    #[test]
    fn acquire_validates_request() {
        let mut state = permit(3);
        let owner = OwnerId::new();

        assert_that!(
            state.try_acquire(owner, 0, false),
            err(matches_pattern!(SemaphoreError::InvalidArgument(anything())))
        );
        assert_that!(
            state.try_acquire(owner, 4, false),
            err(matches_pattern!(SemaphoreError::Capacity {
                requested: eq(4),
                max: eq(3)
            }))
        );
        assert_that!(state.available_permits(), eq(3));
    }

    #[test]
    fn unattached_acquire_leaves_no_attachment() {
        let mut state = permit(3);
        let owner = OwnerId::new();

        assert_that!(state.try_acquire(owner, 1, false), ok(eq(true)));
        assert_that!(state.attached_permits(&owner), eq(0));

        let mut detached = PermitState::new(
            PartitionId::MIN,
            SemaphoreOptions {
                initial_permits: 3,
                attachable: false,
                ..Default::default()
            },
        );
        assert_that!(detached.try_acquire(owner, 1, true), ok(eq(true)));
        assert_that!(detached.attachments().count(), eq(0));
    }

    #[test]
    fn pool_accounting_holds_across_acquire_and_release() {
        let mut state = permit(5);
        let a = OwnerId::new();
        let b = OwnerId::new();

        let steps: [(OwnerId, i32, bool); 8] = [
            (a, 2, true),
            (b, 2, false),
            (a, -1, false),
            (b, 3, true),
            (b, -2, false),
            (a, -5, false),
            (b, -9, false),
            (a, 5, true),
        ];
        for (owner, delta, attach) in steps {
            if delta > 0 {
                state.try_acquire(owner, delta.unsigned_abs(), attach).unwrap();
            } else {
                state.release(owner, delta.unsigned_abs()).unwrap();
            }
            assert_that!(accounted(&state), le(5));
            assert!(state.attachments().all(|(_, held)| held > 0));
        }
    }

    #[test]
    fn release_reduces_attachment_and_removes_it_at_zero() {
        let mut state = permit(4);
        let owner = OwnerId::new();
        state.try_acquire(owner, 3, true).unwrap();

        state.release(owner, 2).unwrap();
        assert_that!(state.attached_permits(&owner), eq(1));
        assert_that!(state.available_permits(), eq(3));

        state.release(owner, 5).unwrap();
        assert_that!(state.attached_permits(&owner), eq(0));
        assert_that!(state.attachments().count(), eq(0));
        assert_that!(state.available_permits(), eq(4));
    }

    #[test]
    fn release_by_stranger_does_not_touch_attachments() {
        let mut state = permit(4);
        let holder = OwnerId::new();
        state.try_acquire(holder, 2, true).unwrap();

        state.release(OwnerId::new(), 2).unwrap();

        assert_that!(state.attached_permits(&holder), eq(2));
        // capped, the holder's permits are still out
        assert_that!(state.available_permits(), eq(2));
    }

    #[test]
    fn reclaiming_attachments_restores_pool() {
        let mut state = permit(3);
        let owner = OwnerId::new();
        state.try_acquire(owner, 2, true).unwrap();

        assert_that!(state.release_attachments_of(&owner), eq(2));
        assert_that!(state.available_permits(), eq(3));
        assert_that!(state.attached_permits(&owner), eq(0));
        assert_that!(state.release_attachments_of(&owner), eq(0));
    }

    #[test]
    fn drain_twice_yields_zero() {
        let mut state = permit(3);
        let owner = OwnerId::new();
        state.try_acquire(owner, 1, true).unwrap();

        assert_that!(state.drain_permits(), eq(2));
        assert_that!(state.drain_permits(), eq(0));
        assert_that!(state.attached_permits(&owner), eq(1));
    }

    #[test]
    fn reduce_shrinks_pool_and_caps_release() {
        let mut state = permit(5);
        state.reduce(2);

        assert_that!(state.available_permits(), eq(3));
        assert_that!(state.max_permits(), eq(3));

        state.release(OwnerId::new(), 10).unwrap();
        assert_that!(state.available_permits(), eq(3));

        state.reduce(10);
        assert_that!(state.available_permits(), eq(0));
        assert_that!(state.max_permits(), eq(0));
    }

    #[test]
    fn init_reseeds_pool() {
        let mut state = permit(0);
        let owner = OwnerId::new();
        assert_that!(
            state.try_acquire(owner, 1, true),
            err(displays_as(contains_substring("at most 0")))
        );

        assert!(state.init(4));
        state.try_acquire(owner, 3, true).unwrap();
        assert!(state.init(2));

        assert_that!(state.available_permits(), eq(2));
        assert_that!(state.max_permits(), eq(5));

        state.release_attachments_of(&owner);
        assert_that!(state.available_permits(), eq(5));
    }

    #[test]
    fn disconnect_scenario() {
        let mut state = permit(3);
        let a = OwnerId::new();
        let b = OwnerId::new();

        assert_that!(state.try_acquire(a, 2, true), ok(eq(true)));
        assert_that!(state.available_permits(), eq(1));
        assert_that!(state.try_acquire(b, 2, true), ok(eq(false)));

        state.release_attachments_of(&a);
        assert_that!(state.available_permits(), eq(3));
        assert_that!(state.attachments().count(), eq(0));

        assert_that!(state.try_acquire(b, 2, true), ok(eq(true)));
        assert_that!(state.available_permits(), eq(1));
    }

    #[test]
    fn abandoned_acquire_is_not_credited_twice() {
        let mut state = permit(2);
        let gone = OwnerId::new();

        assert_that!(state.try_acquire(gone, 2, true), ok(eq(true)));
        assert_that!(state.release_attachments_of(&gone), eq(2));
        assert_that!(state.abandon_acquire(&gone, 2, true), eq(0));
        assert_that!(state.available_permits(), eq(2));

        assert_that!(state.try_acquire(gone, 1, true), ok(eq(true)));
        assert_that!(state.abandon_acquire(&gone, 1, true), eq(1));
        assert_that!(state.available_permits(), eq(2));
        assert_that!(state.attached_permits(&gone), eq(0));
    }

    #[test]
    fn abandoned_unattached_acquire_returns_its_permits() {
        let mut state = permit(3);
        let gone = OwnerId::new();

        assert_that!(state.try_acquire(gone, 2, false), ok(eq(true)));
        assert_that!(state.abandon_acquire(&gone, 2, false), eq(2));
        assert_that!(state.available_permits(), eq(3));
    }
}
