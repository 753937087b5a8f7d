// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Partitioned counting semaphores.
//!
//! Every named semaphore lives in the partition its name hashes to. The node owning that
//! partition serializes all operations on it, keeps its backups up to date and hands the
//! state over when the partition migrates.

mod backup;
pub mod commands;
mod error;
mod membership;
mod migration;
mod operation;
mod permit;
mod proxy;
mod registry;
mod service;

pub use backup::{BackupReplicator, NoopReplicator};
pub use error::{CommandError, SemaphoreError};
pub use membership::{MembershipReactor, PendingWaits, WaitRegistration};
pub use migration::{MigrationCoordinator, MigrationPayload, PayloadError};
pub use operation::{OperationExecutor, OperationOutcome, PermitOperation};
pub use permit::PermitState;
pub use proxy::{SemaphoreInvoker, SemaphoreProxy, SemaphoreRequest};
pub use registry::PermitRegistry;
pub use service::{SERVICE_NAME, SemaphoreService};
