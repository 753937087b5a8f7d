// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use permitgrid_core::service::ManagedService;
use permitgrid_core::{Metadata, PartitionWorkers};
use permitgrid_semaphore::{NoopReplicator, SemaphoreService, commands};
use permitgrid_types::Version;
use permitgrid_types::config::Configuration;
use permitgrid_types::partition_table::PartitionTable;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("console i/o failed: {0}")]
    Console(#[from] std::io::Error),
}

/// A single permitgrid node owning every partition.
pub struct Node {
    metadata: Metadata,
    workers: Arc<PartitionWorkers>,
    semaphores: SemaphoreService,
    cancellation: CancellationToken,
}

impl Node {
    /// # Panics
    /// If called outside of a tokio runtime.
    pub fn new(config: &Configuration) -> Self {
        let node_id = config.common.node_id;
        let partition_table = PartitionTable::with_round_robin_placement(
            Version::MIN,
            u64::from(config.common.bootstrap_num_partitions.get()),
            &[node_id],
            1,
        );
        let metadata = Metadata::new(node_id, partition_table);
        let cancellation = CancellationToken::new();
        let workers = Arc::new(PartitionWorkers::current(cancellation.child_token()));

        let semaphores = SemaphoreService::new(
            metadata.clone(),
            Arc::clone(&workers) as _,
            Arc::new(NoopReplicator),
            config.semaphore.clone(),
        );
        semaphores.init(&config.semaphore);
        info!(
            %node_id,
            partitions = config.common.bootstrap_num_partitions.get(),
            service = semaphores.service_name(),
            "Node started"
        );

        Self {
            metadata,
            workers,
            semaphores,
            cancellation,
        }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn semaphores(&self) -> &SemaphoreService {
        &self.semaphores
    }

    /// Runs one command line, failures are rendered as `ERR <reason>`.
    pub async fn execute(&self, line: &str) -> String {
        match commands::execute(&self.semaphores, line).await {
            Ok(reply) => reply,
            Err(err) => {
                debug!(%line, %err, "Command failed");
                format!("ERR {err}")
            }
        }
    }

    /// Answers the commands read from `input` line by line until the input ends or the node
    /// shuts down.
    pub async fn run_console<R, W>(&self, input: R, mut output: W) -> Result<(), NodeError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        loop {
            let line = tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => break,
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }

            let reply = tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => break,
                reply = self.execute(&line) => reply,
            };
            output.write_all(reply.as_bytes()).await?;
            output.write_all(b"\n").await?;
            output.flush().await?;
        }
        Ok(())
    }

    /// `terminate` skips the graceful parts of the shutdown.
    pub fn shutdown(&self, terminate: bool) {
        self.semaphores.shutdown(terminate);
        self.workers.shutdown();
        self.cancellation.cancel();
    }

    /// Completes once the partition workers stopped after [`Self::shutdown`].
    pub async fn stopped(&self) {
        self.workers.wait_stopped().await;
    }
}
