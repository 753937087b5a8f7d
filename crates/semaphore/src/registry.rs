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

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, trace};
use xxhash_rust::xxh3::Xxh3Builder;

use permitgrid_core::Metadata;
use permitgrid_types::config::SemaphoreServiceOptions;
use permitgrid_types::identifiers::PartitionId;

use crate::migration::MigrationPayload;
use crate::permit::PermitState;
use crate::SemaphoreError;

/// All semaphores known to this node, owned ones and backup copies alike.
///
/// Lookups and get-or-create are safe from any thread. Mutations of a semaphore's state are
/// only issued from the executor of the partition owning it.
pub struct PermitRegistry {
    metadata: Metadata,
    options: ArcSwap<SemaphoreServiceOptions>,
    permits: DashMap<String, PermitState, Xxh3Builder>,
    waiters: DashMap<String, Arc<Notify>, Xxh3Builder>,
}

impl PermitRegistry {
    pub fn new(metadata: Metadata, options: SemaphoreServiceOptions) -> Self {
        Self {
            metadata,
            options: ArcSwap::from_pointee(options),
            permits: DashMap::with_hasher(Xxh3Builder::default()),
            waiters: DashMap::with_hasher(Xxh3Builder::default()),
        }
    }

    pub fn options(&self) -> Arc<SemaphoreServiceOptions> {
        self.options.load_full()
    }

    /// Applies to semaphores created from now on.
    pub fn set_options(&self, options: SemaphoreServiceOptions) {
        self.options.store(Arc::new(options));
    }

    /// The partition responsible for `name`, derived from the hash of the name.
    pub fn partition_of(&self, name: &str) -> Result<PartitionId, SemaphoreError> {
        if let Some(state) = self.permits.get(name) {
            return Ok(state.partition_id());
        }
        self.metadata
            .partition_id_for(name)
            .ok_or_else(|| SemaphoreError::UnknownPartition(name.to_owned()))
    }

    /// Returns a snapshot of the semaphore, creating it first if it doesn't exist yet.
    pub fn get_or_create(&self, name: &str) -> Result<PermitState, SemaphoreError> {
        self.with_permit_mut(name, |state| state.clone())
    }

    /// Runs `f` against the semaphore, creating it first if it doesn't exist yet. Concurrent
    /// callers for the same name never create it twice.
    pub fn with_permit_mut<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut PermitState) -> R,
    ) -> Result<R, SemaphoreError> {
        if let Some(mut state) = self.permits.get_mut(name) {
            return Ok(f(&mut state));
        }

        let partition_id = self.partition_of(name)?;
        let mut state = self.permits.entry(name.to_owned()).or_insert_with(|| {
            let config = self.options.load().options_for(name);
            debug!(%name, %partition_id, ?config, "Creating semaphore");
            PermitState::new(partition_id, config)
        });
        Ok(f(&mut state))
    }

    pub fn get(&self, name: &str) -> Option<PermitState> {
        self.permits.get(name).map(|state| state.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.permits.contains_key(name)
    }

    pub fn destroy(&self, name: &str) {
        if self.permits.remove(name).is_some() {
            debug!(%name, "Destroyed semaphore");
        }
        self.drop_waiters(name);
    }

    pub fn reset(&self) {
        debug!(semaphores = self.permits.len(), "Resetting semaphore registry");
        self.permits.clear();
        self.drop_all_waiters();
    }

    pub fn shutdown(&self) {
        self.permits.clear();
        self.drop_all_waiters();
    }

    /// Snapshot of the semaphores of `partition_id` that keep at least `replica_index`
    /// backups. `None` if there is nothing to replicate.
    pub fn entries_for_partition(
        &self,
        partition_id: PartitionId,
        replica_index: usize,
    ) -> Option<MigrationPayload> {
        let payload: MigrationPayload = self
            .permits
            .iter()
            .filter(|entry| {
                entry.partition_id() == partition_id
                    && usize::from(entry.config().total_backup_count()) >= replica_index
            })
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        if payload.is_empty() {
            None
        } else {
            Some(payload)
        }
    }

    /// Installs every entry of `payload`, replacing local state of the same names.
    pub fn install_all(&self, payload: MigrationPayload) {
        for (name, state) in payload {
            self.install(name, state);
        }
    }

    pub fn install(&self, name: String, state: PermitState) {
        trace!(%name, partition_id = %state.partition_id(), "Installing semaphore state");
        self.permits.insert(name.clone(), state);
        self.notify_waiters(&name);
    }

    /// Removes every semaphore of `partition_id`, returning how many there were.
    pub fn clear_for_partition(&self, partition_id: PartitionId) -> usize {
        let mut removed = Vec::new();
        self.permits.retain(|name, state| {
            if state.partition_id() == partition_id {
                removed.push(name.clone());
                false
            } else {
                true
            }
        });

        for name in &removed {
            self.drop_waiters(name);
        }
        removed.len()
    }

    pub fn names_per_partition(&self) -> BTreeMap<PartitionId, Vec<String>> {
        let mut partitions: BTreeMap<PartitionId, Vec<String>> = BTreeMap::new();
        for entry in self.permits.iter() {
            partitions
                .entry(entry.partition_id())
                .or_default()
                .push(entry.key().clone());
        }
        partitions
    }

    pub fn len(&self) -> usize {
        self.permits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.permits.is_empty()
    }

    /// Signalled whenever the state of `name` changes in a way that may let a waiting
    /// acquire make progress.
    ///
    /// Dropping the semaphore retires its `Notify` after a final wake-up. A waiter must
    /// check [`Self::is_current_waiter`] after registering, a retired `Notify` is never
    /// signalled again.
    pub fn waiter(&self, name: &str) -> Arc<Notify> {
        if let Some(notify) = self.waiters.get(name) {
            return Arc::clone(&notify);
        }
        Arc::clone(self.waiters.entry(name.to_owned()).or_default().value())
    }

    pub fn notify_waiters(&self, name: &str) {
        if let Some(notify) = self.waiters.get(name) {
            notify.notify_waiters();
        }
    }

    pub fn is_current_waiter(&self, name: &str, notify: &Arc<Notify>) -> bool {
        self.waiters
            .get(name)
            .is_some_and(|current| Arc::ptr_eq(&current, notify))
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    // removed before waking, woken waiters must find the retired `Notify` gone
    fn drop_waiters(&self, name: &str) {
        if let Some((_, notify)) = self.waiters.remove(name) {
            notify.notify_waiters();
        }
    }

    fn drop_all_waiters(&self) {
        self.waiters.retain(|_, notify| {
            notify.notify_waiters();
            false
        });
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use futures::FutureExt;
    use googletest::prelude::*;

    use permitgrid_types::config::SemaphoreOptions;
    use permitgrid_types::identifiers::OwnerId;
    use permitgrid_types::partition_table::PartitionTable;
    use permitgrid_types::{NodeId, Version};

    use super::*;

    fn registry(options: SemaphoreServiceOptions) -> PermitRegistry {
        let metadata = Metadata::new(
            NodeId::new(1),
            PartitionTable::with_round_robin_placement(Version::MIN, 8, &[NodeId::new(1)], 1),
        );
        PermitRegistry::new(metadata, options)
    }

    fn options(initial_permits: u32, backup_count: u8) -> SemaphoreOptions {
        SemaphoreOptions {
            initial_permits,
            backup_count,
            ..Default::default()
        }
    }

    /// Finds `count` names hashing to the same partition.
    fn names_in_same_partition(registry: &PermitRegistry, count: usize) -> Vec<String> {
        let target = registry.partition_of("sem-0").unwrap();
        (0..)
            .map(|i| format!("sem-{i}"))
            .filter(|name| registry.partition_of(name).unwrap() == target)
            .take(count)
            .collect()
    }

    #[test]
    fn get_or_create_copies_config() {
        let mut config = SemaphoreServiceOptions::default();
        config.semaphores.insert("jobs-*".to_owned(), options(4, 1));
        let registry = registry(config.clone());

        let created = registry.get_or_create("jobs-1").unwrap();
        assert_that!(created.available_permits(), eq(4));

        config.semaphores.insert("jobs-*".to_owned(), options(9, 1));
        registry.set_options(config);

        assert_that!(
            registry.get_or_create("jobs-1").unwrap().config().initial_permits,
            eq(4)
        );
        assert_that!(
            registry.get_or_create("jobs-2").unwrap().available_permits(),
            eq(9)
        );
    }

    #[test]
    fn concurrent_get_or_create_constructs_once() {
        let mut config = SemaphoreServiceOptions::default();
        config.defaults = options(100, 1);
        let registry = Arc::new(registry(config));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for _ in 0..10 {
                        registry
                            .with_permit_mut("shared", |state| {
                                state.try_acquire(OwnerId::new(), 1, true).unwrap()
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let state = registry.get("shared").unwrap();
        assert_that!(registry.len(), eq(1));
        assert_that!(state.available_permits(), eq(20));
        assert_that!(state.attachments().count(), eq(80));
    }

    #[test]
    fn destroy_is_idempotent() {
        let registry = registry(SemaphoreServiceOptions::default());
        registry.get_or_create("gone").unwrap();

        registry.destroy("gone");
        registry.destroy("gone");

        assert!(!registry.contains("gone"));
        assert!(registry.is_empty());
    }

    #[test]
    fn entries_for_partition_filters_by_partition_and_backups() {
        let mut config = SemaphoreServiceOptions::default();
        config.defaults = options(2, 1);
        let registry = registry(config);

        let names = names_in_same_partition(&registry, 2);
        let partition_id = registry.partition_of(&names[0]).unwrap();
        registry.get_or_create(&names[0]).unwrap();
        registry.set_options(SemaphoreServiceOptions {
            defaults: options(2, 3),
            ..Default::default()
        });
        registry.get_or_create(&names[1]).unwrap();

        let other = (0..)
            .map(|i| format!("other-{i}"))
            .find(|name| registry.partition_of(name).unwrap() != partition_id)
            .unwrap();
        registry.get_or_create(&other).unwrap();

        let primary = registry.entries_for_partition(partition_id, 0).unwrap();
        assert_that!(primary.len(), eq(2));
        assert!(!primary.contains(&other));

        let third_replica = registry.entries_for_partition(partition_id, 3).unwrap();
        assert_that!(
            third_replica.names().collect::<Vec<_>>(),
            elements_are![eq(names[1].as_str())]
        );

        assert_that!(registry.entries_for_partition(partition_id, 4), none());
    }

    #[test]
    fn install_then_clear_leaves_partition_empty() {
        let source = registry(SemaphoreServiceOptions {
            defaults: options(3, 1),
            ..Default::default()
        });
        let names = names_in_same_partition(&source, 3);
        let partition_id = source.partition_of(&names[0]).unwrap();
        for name in &names {
            source
                .with_permit_mut(name, |state| state.try_acquire(OwnerId::new(), 1, true))
                .unwrap()
                .unwrap();
        }

        let destination = registry(SemaphoreServiceOptions::default());
        let payload = source.entries_for_partition(partition_id, 0).unwrap();
        destination.install_all(payload);

        for name in &names {
            assert_that!(destination.get(name), eq(source.get(name)));
        }

        assert_that!(destination.clear_for_partition(partition_id), eq(3));
        assert!(destination.is_empty());
        assert_that!(destination.clear_for_partition(partition_id), eq(0));
    }

    #[test]
    fn names_are_grouped_per_partition() {
        let registry = registry(SemaphoreServiceOptions::default());
        let names = names_in_same_partition(&registry, 2);
        let partition_id = registry.partition_of(&names[0]).unwrap();
        for name in &names {
            registry.get_or_create(name).unwrap();
        }

        let grouped = registry.names_per_partition();
        assert_that!(grouped.len(), eq(1));
        assert_that!(grouped.get(&partition_id).map(Vec::len), some(eq(2)));
    }

    #[test]
    fn dropping_semaphores_retires_their_waiters() {
        let registry = registry(SemaphoreServiceOptions::default());
        let names = names_in_same_partition(&registry, 2);
        let partition_id = registry.partition_of(&names[0]).unwrap();
        let elsewhere = (0..)
            .map(|i| format!("elsewhere-{i}"))
            .find(|name| registry.partition_of(name).unwrap() != partition_id)
            .unwrap();
        for name in &names {
            registry.get_or_create(name).unwrap();
        }

        let notify = registry.waiter(&names[0]);
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        registry.waiter(&names[1]);
        registry.waiter(&elsewhere);
        assert!(registry.is_current_waiter(&names[0], &notify));
        assert_that!(registry.waiter_count(), eq(3));

        registry.destroy(&names[0]);
        assert!(notified.as_mut().now_or_never().is_some());
        assert!(!registry.is_current_waiter(&names[0], &notify));
        assert_that!(registry.waiter_count(), eq(2));

        registry.clear_for_partition(partition_id);
        assert_that!(registry.waiter_count(), eq(1));

        registry.reset();
        assert_that!(registry.waiter_count(), eq(0));
    }
}
