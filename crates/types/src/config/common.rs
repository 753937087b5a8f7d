// Copyright (c) 2024 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::num::NonZeroU16;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::NodeId;

const DEFAULT_NODE_NAME: &str = "permitgrid-node";

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, derive_builder::Builder)]
#[serde(rename_all = "kebab-case")]
#[builder(default)]
pub struct CommonOptions {
    /// # Node Name
    ///
    /// Unique name for this node in the cluster.
    node_name: String,

    /// # Node id
    ///
    /// Numeric identity of this node in the partition table.
    pub node_id: NodeId,

    /// # Partitions
    ///
    /// Number of partitions the keyspace of semaphore names is split into.
    ///
    /// Cannot be higher than `65535` (You should almost never need as many partitions anyway)
    pub bootstrap_num_partitions: NonZeroU16,

    /// # Shutdown grace timeout
    ///
    /// This timeout is used when shutting down the various components to drain all the internal queues.
    ///
    /// Can be configured using the [`humantime`](https://docs.rs/humantime/latest/humantime/fn.parse_duration.html) format.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub shutdown_timeout: humantime::Duration,

    /// # Logging Filter
    ///
    /// Log filter configuration. Can be overridden by the `RUST_LOG` environment variable.
    /// Check the [`RUST_LOG` documentation](https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html) for more details how to configure it.
    pub log_filter: String,

    /// # Logging format
    ///
    /// Format to use when logging.
    pub log_format: LogFormat,

    /// # Disable ANSI in log output
    ///
    /// Disable ANSI terminal codes for logs. This is useful when the log collector doesn't support processing ANSI terminal codes.
    pub log_disable_ansi_codes: bool,
}

impl CommonOptions {
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        self.shutdown_timeout.into()
    }
}

impl Default for CommonOptions {
    fn default() -> Self {
        Self {
            node_name: DEFAULT_NODE_NAME.to_owned(),
            node_id: NodeId::new(1),
            // 271 is a prime, which spreads hashed names evenly
            bootstrap_num_partitions: NonZeroU16::new(271).expect("is not zero"),
            shutdown_timeout: Duration::from_secs(60).into(),
            log_filter: "info".to_owned(),
            log_format: Default::default(),
            log_disable_ansi_codes: false,
        }
    }
}

/// # Log format
#[derive(Debug, Clone, Copy, Hash, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    /// # Pretty
    ///
    /// Enables verbose logging. Not recommended in production.
    #[default]
    Pretty,
    /// # Compact
    ///
    /// Enables compact logging.
    Compact,
    /// # Json
    ///
    /// Enables json logging. You can use a json log collector to ingest these logs and further process them.
    Json,
}
