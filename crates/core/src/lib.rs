// Copyright (c) 2024 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

mod error;
mod metadata;
pub mod scheduler;
pub mod service;
mod workers;

pub use error::*;
pub use metadata::Metadata;
pub use scheduler::{PartitionScheduler, PartitionTask, run_on_partition};
pub use workers::PartitionWorkers;

#[cfg(any(test, feature = "test-util"))]
mod test_util;

#[cfg(any(test, feature = "test-util"))]
pub use test_util::InlineScheduler;
