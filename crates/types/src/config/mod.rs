// Copyright (c) 2024 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

mod common;
mod semaphore;

pub use common::*;
pub use semaphore::*;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum InvalidConfigurationError {
    #[error(
        "semaphore '{name}' is configured with {total} backups, at most {max} are supported"
    )]
    TooManyBackups { name: String, total: u8, max: u8 },
    #[error("semaphore pattern '{0}' contains more than one '*' wildcard")]
    InvalidPattern(String),
    #[error("node-name must not be empty")]
    EmptyNodeName,
}

/// # permitgrid configuration file
///
/// Configuration for a permitgrid node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, derive_builder::Builder)]
#[builder(default)]
#[serde(rename_all = "kebab-case")]
pub struct Configuration {
    #[serde(flatten)]
    pub common: CommonOptions,
    pub semaphore: SemaphoreServiceOptions,
}

impl Configuration {
    pub fn node_name(&self) -> &str {
        self.common.node_name()
    }

    pub fn validate(&self) -> Result<(), InvalidConfigurationError> {
        if self.common.node_name().is_empty() {
            return Err(InvalidConfigurationError::EmptyNodeName);
        }
        self.semaphore.validate()
    }

    /// Dumps the configuration to a string
    pub fn dump(&self) -> Result<String, anyhow::Error> {
        Ok(toml::to_string_pretty(self)?)
    }
}
