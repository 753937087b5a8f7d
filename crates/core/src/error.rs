// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use permitgrid_types::identifiers::PartitionId;

#[derive(Debug, thiserror::Error)]
#[error("system is shutting down")]
pub(crate) struct ShutdownSourceErr;

#[derive(Debug, Clone, Copy)]
pub struct ShutdownError;

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("system is shutting down")
    }
}

impl std::error::Error for ShutdownError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&ShutdownSourceErr)
    }
}

/// Failure to hand a task to, or get its result back from, a partition's executor.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
    #[error("task submitted to partition {0} was dropped before completing")]
    Dropped(PartitionId),
}
