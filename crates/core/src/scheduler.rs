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

use tokio::sync::oneshot;

use permitgrid_types::identifiers::PartitionId;

use crate::ScheduleError;

pub type PartitionTask = Box<dyn FnOnce() + Send + 'static>;

/// Executes tasks on behalf of partitions.
///
/// Implementations must run the tasks submitted for the same partition one at a time and in
/// submission order. Tasks of different partitions may run concurrently. Everything that
/// mutates partition-owned state relies on this to be atomic.
pub trait PartitionScheduler: Send + Sync + 'static {
    fn submit(&self, partition_id: PartitionId, task: PartitionTask) -> Result<(), ScheduleError>;
}

impl<T: PartitionScheduler + ?Sized> PartitionScheduler for Arc<T> {
    fn submit(&self, partition_id: PartitionId, task: PartitionTask) -> Result<(), ScheduleError> {
        (**self).submit(partition_id, task)
    }
}

/// Runs `f` on the partition's executor and waits for its result.
pub async fn run_on_partition<S, F, R>(
    scheduler: &S,
    partition_id: PartitionId,
    f: F,
) -> Result<R, ScheduleError>
where
    S: PartitionScheduler + ?Sized,
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    scheduler.submit(
        partition_id,
        Box::new(move || {
            // receiver went away, nobody is interested in the result
            let _ = tx.send(f());
        }),
    )?;
    rx.await.map_err(|_| ScheduleError::Dropped(partition_id))
}
