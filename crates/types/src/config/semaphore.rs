// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::InvalidConfigurationError;
use crate::retries::RetryPolicy;

/// Sync plus async backups can never exceed this number of copies.
pub const MAX_BACKUP_COUNT: u8 = 6;

/// # Semaphore options
///
/// Per-name configuration of a semaphore. A copy of these options is captured when the
/// semaphore is first referenced, later configuration updates don't affect it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_builder::Builder)]
#[serde(rename_all = "kebab-case", default)]
#[builder(default)]
pub struct SemaphoreOptions {
    /// # Initial permits
    ///
    /// Number of permits available when the semaphore is created.
    pub initial_permits: u32,

    /// # Backup count
    ///
    /// Number of backup replicas updated after every mutation of the semaphore.
    pub backup_count: u8,

    /// # Async backup count
    ///
    /// Number of additional backup replicas, updated without waiting for them.
    pub async_backup_count: u8,

    /// # Attachable
    ///
    /// Track permits per holder so they can be reclaimed when the holder leaves the
    /// cluster or disconnects.
    pub attachable: bool,
}

impl SemaphoreOptions {
    pub fn total_backup_count(&self) -> u8 {
        self.backup_count.saturating_add(self.async_backup_count)
    }
}

impl Default for SemaphoreOptions {
    fn default() -> Self {
        Self {
            initial_permits: 0,
            backup_count: 1,
            async_backup_count: 0,
            attachable: true,
        }
    }
}

/// # Semaphore service options
#[derive(Debug, Clone, Serialize, Deserialize, derive_builder::Builder)]
#[serde(rename_all = "kebab-case", default)]
#[builder(default)]
pub struct SemaphoreServiceOptions {
    /// # Defaults
    ///
    /// Options for semaphores that don't match any configured name.
    pub defaults: SemaphoreOptions,

    /// # Named semaphores
    ///
    /// Options per semaphore name. A name may contain a single `*` wildcard, e.g.
    /// `orders-*`. Exact names take precedence over patterns; among patterns the longest
    /// match wins.
    pub semaphores: HashMap<String, SemaphoreOptions>,

    /// # Not-owner retry policy
    ///
    /// Retry policy applied by clients when an operation reaches a node that doesn't own the
    /// semaphore's partition anymore.
    pub not_owner_retry_policy: RetryPolicy,
}

impl Default for SemaphoreServiceOptions {
    fn default() -> Self {
        Self {
            defaults: SemaphoreOptions::default(),
            semaphores: HashMap::default(),
            not_owner_retry_policy: RetryPolicy::exponential(
                Duration::from_millis(10),
                2.0,
                Some(10),
                Some(Duration::from_millis(500)),
            ),
        }
    }
}

impl SemaphoreServiceOptions {
    /// Returns a copy of the options that apply to `name`.
    pub fn options_for(&self, name: &str) -> SemaphoreOptions {
        if let Some(options) = self.semaphores.get(name) {
            return options.clone();
        }

        self.semaphores
            .iter()
            .filter(|(pattern, _)| matches_pattern(pattern, name))
            .max_by_key(|(pattern, _)| pattern.len())
            .map(|(_, options)| options.clone())
            .unwrap_or_else(|| self.defaults.clone())
    }

    pub fn validate(&self) -> Result<(), InvalidConfigurationError> {
        let named = self
            .semaphores
            .iter()
            .map(|(name, options)| (name.as_str(), options));
        for (name, options) in std::iter::once(("defaults", &self.defaults)).chain(named) {
            if name.matches('*').count() > 1 {
                return Err(InvalidConfigurationError::InvalidPattern(name.to_owned()));
            }
            let total = options.total_backup_count();
            if total > MAX_BACKUP_COUNT {
                return Err(InvalidConfigurationError::TooManyBackups {
                    name: name.to_owned(),
                    total,
                    max: MAX_BACKUP_COUNT,
                });
            }
        }
        Ok(())
    }
}

fn matches_pattern(pattern: &str, name: &str) -> bool {
    match pattern.split_once('*') {
        Some((prefix, suffix)) => {
            name.len() >= prefix.len() + suffix.len()
                && name.starts_with(prefix)
                && name.ends_with(suffix)
        }
        None => false,
    }
}
