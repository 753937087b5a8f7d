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
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use permitgrid_core::service::{ManagedService, MembershipAware, MigrationAware, RemoteService};
use permitgrid_core::{Metadata, PartitionScheduler};
use permitgrid_types::NodeId;
use permitgrid_types::cluster::{PartitionMigrationEvent, PartitionReplicationEvent};
use permitgrid_types::config::SemaphoreServiceOptions;
use permitgrid_types::identifiers::{OwnerId, PartitionId};

use crate::SemaphoreError;
use crate::backup::BackupReplicator;
use crate::membership::{MembershipReactor, PendingWaits};
use crate::migration::{MigrationCoordinator, MigrationPayload};
use crate::operation::{OperationExecutor, OperationOutcome, PermitOperation};
use crate::permit::PermitState;
use crate::proxy::{SemaphoreInvoker, SemaphoreProxy, SemaphoreRequest};
use crate::registry::PermitRegistry;

pub const SERVICE_NAME: &str = "permitgrid:impl:semaphoreService";

/// The semaphore service of a node.
///
/// Composes the registry with the components reacting to the cluster: operations run on
/// the owning partition's executor, migrations move state along with the partitions, and
/// membership changes reclaim the permits of departed owners. Cheap to clone.
#[derive(Clone)]
pub struct SemaphoreService {
    inner: Arc<Inner>,
}

struct Inner {
    executor: Arc<OperationExecutor>,
    migration: MigrationCoordinator,
    membership: MembershipReactor,
    waits: Arc<PendingWaits>,
}

impl SemaphoreService {
    pub fn new(
        metadata: Metadata,
        scheduler: Arc<dyn PartitionScheduler>,
        replicator: Arc<dyn BackupReplicator>,
        options: SemaphoreServiceOptions,
    ) -> Self {
        let registry = Arc::new(PermitRegistry::new(metadata.clone(), options));
        let executor = Arc::new(OperationExecutor::new(
            Arc::clone(&registry),
            metadata,
            scheduler,
            replicator,
        ));
        let waits = Arc::new(PendingWaits::default());

        Self {
            inner: Arc::new(Inner {
                migration: MigrationCoordinator::new(registry),
                membership: MembershipReactor::new(Arc::clone(&executor), Arc::clone(&waits)),
                executor,
                waits,
            }),
        }
    }

    pub fn registry(&self) -> &PermitRegistry {
        self.inner.executor.registry()
    }

    pub fn metadata(&self) -> &Metadata {
        self.inner.executor.metadata()
    }

    pub async fn invoke(
        &self,
        operation: PermitOperation,
    ) -> Result<OperationOutcome, SemaphoreError> {
        self.inner.executor.invoke(operation).await
    }

    /// Takes `permits` of `name` as soon as they're available.
    ///
    /// The partition's executor is only occupied while checking, in between this waits for
    /// the semaphore to change. Fails with [`SemaphoreError::Timeout`] once `deadline`
    /// passed, or with [`SemaphoreError::Cancelled`] if `owner` disconnects meanwhile. A
    /// cancelled acquire leaves no permits behind.
    pub async fn acquire(
        &self,
        name: &str,
        owner: OwnerId,
        permits: u32,
        attach: bool,
        deadline: Option<Instant>,
    ) -> Result<(), SemaphoreError> {
        let registration = self.inner.waits.register(owner);
        let shutdown = self.inner.executor.shutdown_token().clone();
        let started = Instant::now();

        loop {
            if shutdown.is_cancelled() {
                return Err(SemaphoreError::Shutdown);
            }
            if registration.is_cancelled() {
                return Err(SemaphoreError::Cancelled);
            }

            let notify = self.registry().waiter(name);
            let notified = notify.notified();
            tokio::pin!(notified);
            // register before checking, changes in between must not get lost
            notified.as_mut().enable();
            if !self.registry().is_current_waiter(name, &notify) {
                continue;
            }

            let outcome = self
                .invoke(PermitOperation::TryAcquire {
                    name: name.to_owned(),
                    owner,
                    permits,
                    attach,
                })
                .await?;
            if outcome == OperationOutcome::Acquired(true) {
                if registration.is_cancelled() {
                    self.abandon(name, owner, permits, attach).await;
                    return Err(SemaphoreError::Cancelled);
                }
                return Ok(());
            }

            trace!(%name, %owner, permits, "Waiting for permits");
            let expired = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Err(SemaphoreError::Shutdown),
                _ = registration.cancelled() => return Err(SemaphoreError::Cancelled),
                _ = &mut notified => {},
                _ = expired => return Err(SemaphoreError::Timeout(started.elapsed())),
            }
        }
    }

    /// The owner went away while its acquire was in flight, the reclaim triggered by its
    /// departure may have run before the permits were taken.
    async fn abandon(&self, name: &str, owner: OwnerId, permits: u32, attach: bool) {
        let result = self
            .invoke(PermitOperation::AbandonAcquire {
                name: name.to_owned(),
                owner,
                permits,
                attach,
            })
            .await;
        if let Err(err) = result {
            warn!(%name, %owner, %err, "Failed to return permits of cancelled acquire");
        }
    }

    pub async fn acquire_timeout(
        &self,
        name: &str,
        owner: OwnerId,
        permits: u32,
        attach: bool,
        timeout: Option<Duration>,
    ) -> Result<(), SemaphoreError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        self.acquire(name, owner, permits, attach, deadline).await
    }

    /// Installs a copy pushed by the owner of the semaphore's partition. Ignored if this
    /// node owns the partition itself.
    pub fn install_backup(&self, name: String, state: PermitState) {
        if self.metadata().is_owner(state.partition_id()) {
            debug!(
                %name,
                partition_id = %state.partition_id(),
                "Ignoring backup of owned semaphore"
            );
            return;
        }
        self.registry().install(name, state);
    }
}

#[async_trait::async_trait]
impl SemaphoreInvoker for SemaphoreService {
    async fn invoke(&self, request: SemaphoreRequest) -> Result<OperationOutcome, SemaphoreError> {
        match request {
            SemaphoreRequest::Acquire {
                name,
                owner,
                permits,
                attach,
                deadline,
            } => {
                self.acquire(&name, owner, permits, attach, deadline).await?;
                Ok(OperationOutcome::Acquired(true))
            }
            SemaphoreRequest::Operation(operation) => {
                SemaphoreService::invoke(self, operation).await
            }
        }
    }
}

impl ManagedService for SemaphoreService {
    type Options = SemaphoreServiceOptions;

    fn service_name(&self) -> &'static str {
        SERVICE_NAME
    }

    fn init(&self, options: &SemaphoreServiceOptions) {
        debug!(named = options.semaphores.len(), "Initializing semaphore service");
        self.registry().set_options(options.clone());
    }

    fn reset(&self) {
        self.registry().reset();
    }

    fn shutdown(&self, terminate: bool) {
        info!(
            terminate,
            semaphores = self.registry().len(),
            "Shutting down semaphore service"
        );
        self.inner.executor.shutdown_token().cancel();
        self.inner.waits.cancel_all();
        self.registry().shutdown();
    }
}

impl RemoteService for SemaphoreService {
    type Proxy = SemaphoreProxy;

    fn create_distributed_object(&self, name: &str) -> SemaphoreProxy {
        SemaphoreProxy::new(
            name,
            Arc::new(self.clone()),
            self.registry().options().not_owner_retry_policy.clone(),
        )
    }

    fn destroy_distributed_object(&self, name: &str) {
        self.registry().destroy(name);
    }
}

impl MigrationAware for SemaphoreService {
    type Payload = MigrationPayload;

    fn before_migration(&self, event: &PartitionMigrationEvent) {
        self.inner.migration.before_migration(event)
    }

    fn prepare_replication(&self, event: &PartitionReplicationEvent) -> Option<MigrationPayload> {
        self.inner.migration.prepare_replication(event)
    }

    fn insert_migration_data(&self, payload: MigrationPayload) {
        self.inner.migration.insert_migration_data(payload)
    }

    fn commit_migration(&self, event: &PartitionMigrationEvent) {
        self.inner.migration.commit_migration(event)
    }

    fn rollback_migration(&self, event: &PartitionMigrationEvent) {
        self.inner.migration.rollback_migration(event)
    }

    fn clear_partition_replica(&self, partition_id: PartitionId) {
        self.inner.migration.clear_partition_replica(partition_id)
    }
}

impl MembershipAware for SemaphoreService {
    fn member_removed(&self, node: NodeId, member: OwnerId) {
        self.inner.membership.member_removed(node, member)
    }

    fn client_disconnected(&self, client: OwnerId) {
        self.inner.membership.client_disconnected(client)
    }
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;

    use tokio_util::sync::CancellationToken;

    use permitgrid_core::{InlineScheduler, PartitionTask, PartitionWorkers, ScheduleError};
    use permitgrid_types::config::SemaphoreOptions;
    use permitgrid_types::partition_table::PartitionTable;
    use permitgrid_types::Version;

    use super::*;
    use crate::backup::NoopReplicator;

    fn service(initial_permits: u32) -> SemaphoreService {
        let me = NodeId::new(1);
        SemaphoreService::new(
            Metadata::new(
                me,
                PartitionTable::with_round_robin_placement(Version::MIN, 4, &[me], 1),
            ),
            Arc::new(InlineScheduler::new()),
            Arc::new(NoopReplicator),
            SemaphoreServiceOptions {
                defaults: SemaphoreOptions {
                    initial_permits,
                    ..Default::default()
                },
                ..Default::default()
            },
        )
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn blocking_acquire_is_woken_by_release() {
        let service = service(1);
        let holder = OwnerId::new();
        let waiter = OwnerId::new();
        service
            .acquire_timeout("jobs", holder, 1, true, None)
            .await
            .unwrap();

        let pending = tokio::spawn({
            let service = service.clone();
            async move {
                service
                    .acquire_timeout("jobs", waiter, 1, true, Some(Duration::from_secs(10)))
                    .await
            }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!pending.is_finished());

        let proxy = service.create_distributed_object("jobs");
        proxy.release(holder, 1).await.unwrap();

        assert_that!(pending.await.unwrap(), ok(anything()));
        let state = service.registry().get("jobs").unwrap();
        assert_that!(state.attached_permits(&waiter), eq(1));
        assert_that!(state.attached_permits(&holder), eq(0));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn blocking_acquire_times_out() {
        let service = service(2);
        let owner = OwnerId::new();
        service
            .acquire_timeout("jobs", owner, 2, false, None)
            .await
            .unwrap();

        let timeout = Some(Duration::from_millis(500));
        let result = service
            .acquire_timeout("jobs", OwnerId::new(), 1, false, timeout)
            .await;

        assert_that!(
            result,
            err(matches_pattern!(SemaphoreError::Timeout(ge(Duration::from_millis(500)))))
        );
        assert_that!(
            service.registry().get("jobs").unwrap().available_permits(),
            eq(0)
        );
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn blocking_acquire_is_cancelled_when_owner_disconnects() {
        let service = service(1);
        let holder = OwnerId::new();
        let waiter = OwnerId::new();
        service
            .acquire_timeout("jobs", holder, 1, true, None)
            .await
            .unwrap();

        let pending = tokio::spawn({
            let service = service.clone();
            async move { service.acquire_timeout("jobs", waiter, 1, true, None).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        service.client_disconnected(waiter);

        assert_that!(
            pending.await.unwrap(),
            err(displays_as(eq("waiting for permits was cancelled")))
        );
        let state = service.registry().get("jobs").unwrap();
        assert_that!(state.attached_permits(&holder), eq(1));
        assert_that!(state.available_permits(), eq(0));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn departed_owner_never_keeps_released_permits() {
        for _ in 0..20 {
            let service = service(1);
            let holder = OwnerId::new();
            let waiter = OwnerId::new();
            service
                .acquire_timeout("jobs", holder, 1, true, None)
                .await
                .unwrap();

            let pending = tokio::spawn({
                let service = service.clone();
                async move { service.acquire_timeout("jobs", waiter, 1, true, None).await }
            });
            tokio::time::sleep(Duration::from_millis(10)).await;

            // both happen before the waiter gets polled again
            service.client_disconnected(waiter);
            service
                .invoke(PermitOperation::Release {
                    name: "jobs".to_owned(),
                    owner: holder,
                    permits: 1,
                })
                .await
                .unwrap();

            assert_that!(
                pending.await.unwrap(),
                err(matches_pattern!(SemaphoreError::Cancelled))
            );
            let state = service.registry().get("jobs").unwrap();
            assert_that!(state.attached_permits(&waiter), eq(0));
            assert_that!(state.available_permits(), eq(1));
            assert!(service.inner.waits.is_empty());
        }
    }

    /// Runs `hook` right before the next task reaches its partition.
    #[derive(Default)]
    struct Interleaved {
        inner: InlineScheduler,
        hook: parking_lot::Mutex<Option<PartitionTask>>,
    }

    impl PartitionScheduler for Interleaved {
        fn submit(
            &self,
            partition_id: PartitionId,
            task: PartitionTask,
        ) -> std::result::Result<(), ScheduleError> {
            let hook = self.hook.lock().take();
            if let Some(hook) = hook {
                hook();
            }
            self.inner.submit(partition_id, task)
        }
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn acquire_taken_after_disconnect_is_given_back() {
        let me = NodeId::new(1);
        let scheduler = Arc::new(Interleaved::default());
        let service = SemaphoreService::new(
            Metadata::new(
                me,
                PartitionTable::with_round_robin_placement(Version::MIN, 4, &[me], 1),
            ),
            Arc::clone(&scheduler) as _,
            Arc::new(NoopReplicator),
            SemaphoreServiceOptions {
                defaults: SemaphoreOptions {
                    initial_permits: 2,
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        let owner = OwnerId::new();
        service.registry().get_or_create("jobs").unwrap();

        // the reclaim runs before the acquire reaches the partition
        *scheduler.hook.lock() = Some(Box::new({
            let service = service.clone();
            move || service.client_disconnected(owner)
        }));
        let result = service.acquire_timeout("jobs", owner, 2, true, None).await;

        assert_that!(result, err(matches_pattern!(SemaphoreError::Cancelled)));
        let state = service.registry().get("jobs").unwrap();
        assert_that!(state.attached_permits(&owner), eq(0));
        assert_that!(state.available_permits(), eq(2));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn finished_acquires_leave_no_pending_waits() {
        let service = service(2);
        let owner = OwnerId::new();

        service
            .acquire_timeout("jobs", owner, 1, true, None)
            .await
            .unwrap();
        let result = service
            .acquire_timeout("jobs", owner, 2, true, Some(Duration::from_millis(50)))
            .await;

        assert_that!(result, err(matches_pattern!(SemaphoreError::Timeout(anything()))));
        assert!(service.inner.waits.is_empty());
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
    async fn blocking_acquire_is_woken_through_partition_workers() {
        let me = NodeId::new(1);
        let workers = Arc::new(PartitionWorkers::current(CancellationToken::new()));
        let service = SemaphoreService::new(
            Metadata::new(
                me,
                PartitionTable::with_round_robin_placement(Version::MIN, 4, &[me], 1),
            ),
            Arc::clone(&workers) as _,
            Arc::new(NoopReplicator),
            SemaphoreServiceOptions {
                defaults: SemaphoreOptions {
                    initial_permits: 1,
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        let holder = OwnerId::new();
        let waiter = OwnerId::new();
        let proxy = service.create_distributed_object("jobs");
        proxy.acquire(holder, 1, true, None).await.unwrap();

        let pending = tokio::spawn({
            let proxy = proxy.clone();
            async move {
                proxy
                    .acquire(waiter, 1, true, Some(Duration::from_secs(10)))
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!pending.is_finished());

        proxy.release(holder, 1).await.unwrap();

        assert_that!(pending.await.unwrap(), ok(anything()));
        let state = service.registry().get("jobs").unwrap();
        assert_that!(state.attached_permits(&waiter), eq(1));
        assert_that!(state.available_permits(), eq(0));

        workers.shutdown();
        workers.wait_stopped().await;
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn member_removal_reclaims_and_unblocks_waiters() {
        let service = service(3);
        let member = OwnerId::new();
        let client = OwnerId::new();
        let proxy = service.create_distributed_object("jobs");

        proxy.acquire(member, 2, true, None).await.unwrap();
        assert_that!(proxy.try_acquire(client, 2, true).await, ok(eq(false)));

        let pending = tokio::spawn({
            let proxy = proxy.clone();
            async move { proxy.acquire(client, 2, true, None).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        service.member_removed(NodeId::new(7), member);

        assert_that!(pending.await.unwrap(), ok(anything()));
        assert_that!(proxy.available_permits().await, ok(eq(1)));
    }

    #[test_log::test(tokio::test)]
    async fn operations_on_foreign_partitions_are_rejected() {
        let me = NodeId::new(1);
        let other = NodeId::new(2);
        let service = SemaphoreService::new(
            Metadata::new(
                me,
                PartitionTable::with_round_robin_placement(Version::MIN, 1, &[other, me], 2),
            ),
            Arc::new(InlineScheduler::new()),
            Arc::new(NoopReplicator),
            SemaphoreServiceOptions::default(),
        );

        let result = service
            .invoke(PermitOperation::AvailablePermits {
                name: "jobs".to_owned(),
            })
            .await;

        assert_that!(
            result,
            err(matches_pattern!(SemaphoreError::NotOwner {
                partition_id: eq(PartitionId::MIN),
                node: eq(me)
            }))
        );
        assert!(service.registry().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn shutdown_clears_state_and_rejects_operations() {
        let service = service(1);
        let proxy = service.create_distributed_object("jobs");
        assert_that!(proxy.init(5).await, ok(eq(true)));
        assert_that!(proxy.drain_permits(OwnerId::new()).await, ok(eq(5)));

        service.shutdown(false);

        assert!(service.registry().is_empty());
        assert_that!(
            proxy.available_permits().await,
            err(displays_as(eq("semaphore service is shutting down")))
        );
    }

    #[test]
    fn exposes_service_name() {
        assert_that!(service(0).service_name(), eq("permitgrid:impl:semaphoreService"));
    }
}
