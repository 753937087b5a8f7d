// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

#[cfg(unix)]
mod platform {
    use std::io::Write;

    use tokio::signal::unix::{SignalKind, signal};
    use tracing::{info, warn};

    use permitgrid_tracing_instrumentation::TracingGuard;
    use permitgrid_types::config::Configuration;
    use permitgrid_types::config_loader::ConfigLoader;

    pub async fn shutdown() -> std::io::Result<&'static str> {
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let signal = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        };

        info!(%signal, "Received signal, starting shutdown.");
        Ok(signal)
    }

    /// Dumps the configuration to stderr on SIGUSR1.
    pub async fn sigusr1_dump_config(config: &Configuration) -> std::io::Result<()> {
        let mut stream = signal(SignalKind::user_defined1())?;

        loop {
            stream.recv().await;
            warn!("Received SIGUSR1, dumping configuration");
            match config.dump() {
                Err(e) => warn!("Failed to dump configuration: {}", e),
                Ok(config) => {
                    let mut stderr = std::io::stderr().lock();
                    let _ = writeln!(&mut stderr, "{config}");
                }
            }
        }
    }

    /// Re-reads the configuration on SIGHUP and applies its log filter.
    pub async fn sighup_reload_log_filter(
        config_loader: &ConfigLoader,
        tracing_guard: &TracingGuard,
    ) -> std::io::Result<()> {
        let mut stream = signal(SignalKind::hangup())?;

        loop {
            stream.recv().await;
            info!("Received SIGHUP, reloading log filter");
            match config_loader.load_once() {
                Ok(config) => {
                    if let Err(err) = tracing_guard.reload_log_filter(&config.common) {
                        warn!(%err, "Failed to reload log filter");
                    }
                }
                Err(err) => warn!(%err, "Failed to reload configuration"),
            }
        }
    }
}

#[cfg(windows)]
mod platform {
    use tracing::info;

    use permitgrid_tracing_instrumentation::TracingGuard;
    use permitgrid_types::config::Configuration;
    use permitgrid_types::config_loader::ConfigLoader;

    pub async fn shutdown() -> std::io::Result<&'static str> {
        tokio::signal::ctrl_c().await?;
        info!("Received CTRL_C, starting shutdown.");
        Ok("CTRL_C")
    }

    /// SIGUSR1 doesn't exist on Windows.
    pub async fn sigusr1_dump_config(_config: &Configuration) -> std::io::Result<()> {
        std::future::pending().await
    }

    /// SIGHUP doesn't exist on Windows.
    pub async fn sighup_reload_log_filter(
        _config_loader: &ConfigLoader,
        _tracing_guard: &TracingGuard,
    ) -> std::io::Result<()> {
        std::future::pending().await
    }
}

pub(super) use platform::*;
