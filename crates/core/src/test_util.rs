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
use parking_lot::Mutex;
use xxhash_rust::xxh3::Xxh3Builder;

use permitgrid_types::identifiers::PartitionId;

use crate::scheduler::{PartitionScheduler, PartitionTask};
use crate::ScheduleError;

/// Runs every task synchronously on the submitting thread, holding a per-partition lock.
///
/// Deterministic stand-in for [`crate::PartitionWorkers`] in tests.
#[derive(Default)]
pub struct InlineScheduler {
    locks: DashMap<PartitionId, Arc<Mutex<()>>, Xxh3Builder>,
}

impl InlineScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PartitionScheduler for InlineScheduler {
    fn submit(&self, partition_id: PartitionId, task: PartitionTask) -> Result<(), ScheduleError> {
        // the map guard must be released before running the task
        let lock = Arc::clone(self.locks.entry(partition_id).or_default().value());
        let _guard = lock.lock();
        task();
        Ok(())
    }
}
