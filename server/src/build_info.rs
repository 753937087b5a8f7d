// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Build information

pub const PERMITGRID_SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");
/// Pre-release suffix, empty for releases.
pub const PERMITGRID_SERVER_VERSION_PRE: &str = env!("CARGO_PKG_VERSION_PRE");

pub fn build_info() -> String {
    if PERMITGRID_SERVER_VERSION_PRE.is_empty() {
        format!("v{PERMITGRID_SERVER_VERSION}")
    } else {
        format!("v{PERMITGRID_SERVER_VERSION} (pre-release)")
    }
}
