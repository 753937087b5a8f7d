// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};
use xxhash_rust::xxh3::Xxh3Builder;

use permitgrid_types::identifiers::PartitionId;

use crate::scheduler::{PartitionScheduler, PartitionTask};
use crate::{ScheduleError, ShutdownError};

/// Runs one worker task per partition on a tokio runtime.
///
/// Workers are started lazily on the first task for their partition and stop once the
/// cancellation token fires. Tasks still queued at that point are dropped.
pub struct PartitionWorkers {
    runtime: Handle,
    cancellation: CancellationToken,
    queues: DashMap<PartitionId, mpsc::UnboundedSender<PartitionTask>, Xxh3Builder>,
    tasks: TaskTracker,
}

impl PartitionWorkers {
    pub fn new(runtime: Handle, cancellation: CancellationToken) -> Self {
        Self {
            runtime,
            cancellation,
            queues: DashMap::with_hasher(Xxh3Builder::default()),
            tasks: TaskTracker::new(),
        }
    }

    /// Uses the runtime of the calling context.
    ///
    /// # Panics
    /// If called outside of a tokio runtime.
    pub fn current(cancellation: CancellationToken) -> Self {
        Self::new(Handle::current(), cancellation)
    }

    pub fn shutdown(&self) {
        debug!(workers = self.queues.len(), "Stopping partition workers");
        self.cancellation.cancel();
        self.queues.clear();
        self.tasks.close();
    }

    /// Completes once every worker stopped after [`Self::shutdown`].
    pub async fn wait_stopped(&self) {
        self.tasks.wait().await;
    }

    fn spawn_worker(&self, partition_id: PartitionId) -> mpsc::UnboundedSender<PartitionTask> {
        let (tx, mut rx) = mpsc::unbounded_channel::<PartitionTask>();
        let cancellation = self.cancellation.clone();
        let worker = async move {
            trace!(%partition_id, "Partition worker started");
            loop {
                tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => break,
                    task = rx.recv() => match task {
                        Some(task) => task(),
                        None => break,
                    },
                }
            }
            trace!(%partition_id, "Partition worker stopped");
        };
        self.tasks.spawn_on(worker, &self.runtime);
        tx
    }
}

impl PartitionScheduler for PartitionWorkers {
    fn submit(&self, partition_id: PartitionId, task: PartitionTask) -> Result<(), ScheduleError> {
        if self.cancellation.is_cancelled() {
            return Err(ShutdownError.into());
        }

        let queue = self
            .queues
            .entry(partition_id)
            .or_insert_with(|| self.spawn_worker(partition_id));
        queue.send(task).map_err(|_| ShutdownError.into())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use googletest::prelude::*;
    use parking_lot::Mutex;

    use super::*;
    use crate::scheduler::run_on_partition;

    #[test_log::test(tokio::test)]
    async fn tasks_of_a_partition_run_in_submission_order() {
        let workers = PartitionWorkers::current(CancellationToken::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let seen = Arc::clone(&seen);
            workers
                .submit(
                    PartitionId::MIN,
                    Box::new(move || {
                        // later tasks are faster, they still must not overtake
                        std::thread::sleep(Duration::from_millis(10 - i));
                        seen.lock().push(i);
                    }),
                )
                .unwrap();
        }

        let last = run_on_partition(&workers, PartitionId::MIN, || "done").await;
        assert_that!(last, ok(eq("done")));
        assert_that!(seen.lock().clone(), eq(vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9]));
    }

    #[test_log::test(tokio::test)]
    async fn rejects_tasks_after_shutdown() {
        let workers = PartitionWorkers::current(CancellationToken::new());
        assert_that!(
            run_on_partition(&workers, PartitionId::MIN, || 1).await,
            ok(eq(1))
        );

        workers.shutdown();
        workers.wait_stopped().await;

        assert_that!(
            run_on_partition(&workers, PartitionId::MIN, || 1).await,
            err(displays_as(eq("system is shutting down")))
        );
    }
}
