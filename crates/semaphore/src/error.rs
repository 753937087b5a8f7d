// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::time::Duration;

use permitgrid_core::ScheduleError;
use permitgrid_types::NodeId;
use permitgrid_types::identifiers::PartitionId;

use crate::operation::OperationOutcome;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SemaphoreError {
    #[error("requested {requested} permits, but the semaphore holds at most {max}")]
    Capacity { requested: u32, max: u32 },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no permits became available within {0:?}")]
    Timeout(Duration),
    #[error("waiting for permits was cancelled")]
    Cancelled,
    /// The operation reached a node that doesn't own the partition (anymore). Clients
    /// resubmit once their routing information caught up.
    #[error("partition {partition_id} is not owned by node {node}")]
    NotOwner {
        partition_id: PartitionId,
        node: NodeId,
    },
    #[error("no partition is responsible for semaphore '{0}'")]
    UnknownPartition(String),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error("semaphore service is shutting down")]
    Shutdown,
    #[error("operation answered with unexpected outcome {0:?}")]
    UnexpectedOutcome(OperationOutcome),
}

impl SemaphoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SemaphoreError::NotOwner { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("command {command} is missing argument '{argument}'")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },
    #[error("invalid value '{value}' for argument '{argument}': {reason}")]
    InvalidArgument {
        argument: &'static str,
        value: String,
        reason: String,
    },
    #[error(transparent)]
    Semaphore(#[from] SemaphoreError),
}
