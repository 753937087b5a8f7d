// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::path::PathBuf;

use clap::Parser;
use tokio::io::BufReader;
use tracing::{error, info, warn};

use permitgrid_server::{Node, build_info};
use permitgrid_tracing_instrumentation::init_tracing_and_logging;
use permitgrid_types::config_loader::ConfigLoaderBuilder;

mod signal;

#[derive(Debug, clap::Parser)]
#[command(author, version, about)]
struct PermitgridArguments {
    /// Set a configuration file to use for permitgrid.
    #[arg(
        short,
        long = "config-file",
        env = "PERMITGRID_CONFIG",
        value_name = "FILE"
    )]
    config_file: Option<PathBuf>,

    /// Dumps the loaded configuration (or default if no config-file is set) to stdout and exits.
    /// Defaults will include any values overridden by environment variables.
    #[clap(long)]
    dump_config: bool,
}

const EXIT_CODE_FAILURE: i32 = 1;

fn main() {
    let cli_args = PermitgridArguments::parse();

    let config_loader = ConfigLoaderBuilder::default()
        .load_env(true)
        .path(cli_args.config_file.clone())
        .build()
        .unwrap_or_default();

    let config = match config_loader.load_once() {
        Ok(c) => c,
        Err(e) => {
            // tracing is not configured yet
            eprintln!("{e}");
            std::process::exit(EXIT_CODE_FAILURE);
        }
    };
    if cli_args.dump_config {
        match config.dump() {
            Ok(dump) => println!("{dump}"),
            Err(e) => {
                eprintln!("Failed to serialize configuration: {e}");
                std::process::exit(EXIT_CODE_FAILURE);
            }
        }
        return;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("permitgrid")
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to build tokio runtime: {e}");
            std::process::exit(EXIT_CODE_FAILURE);
        }
    };

    let exit_code = runtime.block_on(async move {
        let tracing_guard = match init_tracing_and_logging(&config.common, "permitgrid-server") {
            Ok(guard) => guard,
            Err(e) => {
                eprintln!("Failed to configure logging: {e}");
                return EXIT_CODE_FAILURE;
            }
        };

        info!("Starting permitgrid server {}", build_info::build_info());
        match &cli_args.config_file {
            Some(path) => info!("Loading configuration file from {}", path.display()),
            None => info!("Loading default built-in configuration"),
        }

        let node = Node::new(&config);
        let console = node.run_console(
            BufReader::new(tokio::io::stdin()),
            tokio::io::stdout(),
        );

        let dump_config = async {
            if let Err(err) = signal::sigusr1_dump_config(&config).await {
                warn!(%err, "Failed to listen for SIGUSR1");
            }
            std::future::pending::<()>().await
        };
        let reload_log_filter = async {
            let result = signal::sighup_reload_log_filter(&config_loader, &tracing_guard).await;
            if let Err(err) = result {
                warn!(%err, "Failed to listen for SIGHUP");
            }
            std::future::pending::<()>().await
        };

        let exit_code = tokio::select! {
            signal_name = signal::shutdown() => {
                match signal_name {
                    Ok(signal_name) => info!(signal = signal_name, "Shutting down"),
                    Err(err) => error!(%err, "Failed to listen for shutdown signals"),
                }
                0
            }
            result = console => match result {
                Ok(()) => {
                    info!("Console input closed, shutting down");
                    0
                }
                Err(err) => {
                    error!(%err, "Console failed");
                    EXIT_CODE_FAILURE
                }
            },
            () = dump_config => 0,
            () = reload_log_filter => 0,
        };

        node.shutdown(false);
        let stopped =
            tokio::time::timeout(config.common.shutdown_grace_period(), node.stopped()).await;
        if stopped.is_err() {
            warn!("Could not gracefully shut down permitgrid, terminating now.");
        } else {
            info!("permitgrid has been gracefully shut down.");
        }
        exit_code
    });

    std::process::exit(exit_code);
}
