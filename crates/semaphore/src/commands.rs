// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Textual client commands, e.g. `SEM_TRY_ACQUIRE orders <owner-uuid> 2 true`.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use strum::IntoEnumIterator;

use permitgrid_core::service::RemoteService;
use permitgrid_types::identifiers::OwnerId;

use crate::{CommandError, SemaphoreService};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::EnumString,
    strum::EnumIter,
    strum::IntoStaticStr,
    strum::Display,
)]
pub enum SemaphoreCommand {
    #[strum(serialize = "SEM_ACQUIRE")]
    Acquire,
    #[strum(serialize = "SEM_TRY_ACQUIRE")]
    TryAcquire,
    #[strum(serialize = "SEM_RELEASE")]
    Release,
    #[strum(serialize = "SEM_DRAIN_PERMITS")]
    DrainPermits,
    #[strum(serialize = "SEM_AVAILABLE_PERMITS")]
    AvailablePermits,
    #[strum(serialize = "SEM_INIT")]
    Init,
}

pub type CommandHandler = for<'a> fn(
    &'a SemaphoreService,
    &'a [&'a str],
) -> BoxFuture<'a, Result<String, CommandError>>;

impl SemaphoreCommand {
    pub fn handler(self) -> CommandHandler {
        match self {
            SemaphoreCommand::Acquire => acquire,
            SemaphoreCommand::TryAcquire => try_acquire,
            SemaphoreCommand::Release => release,
            SemaphoreCommand::DrainPermits => drain_permits,
            SemaphoreCommand::AvailablePermits => available_permits,
            SemaphoreCommand::Init => init,
        }
    }
}

/// Handlers of all semaphore commands, keyed by command name.
pub fn commands() -> HashMap<&'static str, CommandHandler> {
    SemaphoreCommand::iter()
        .map(|command| (command.into(), command.handler()))
        .collect()
}

/// Parses `line` and runs the command against `service`.
pub async fn execute(service: &SemaphoreService, line: &str) -> Result<String, CommandError> {
    let mut words = line.split_whitespace();
    let command = words.next().unwrap_or_default();
    let command = SemaphoreCommand::from_str(command)
        .map_err(|_| CommandError::UnknownCommand(command.to_owned()))?;
    let args: Vec<&str> = words.collect();

    (command.handler())(service, &args).await
}

struct Args<'a> {
    command: &'static str,
    args: &'a [&'a str],
}

impl<'a> Args<'a> {
    fn new(command: SemaphoreCommand, args: &'a [&'a str]) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    fn str(&self, position: usize, argument: &'static str) -> Result<&'a str, CommandError> {
        self.args
            .get(position)
            .copied()
            .ok_or(CommandError::MissingArgument {
                command: self.command,
                argument,
            })
    }

    fn parse<T>(&self, position: usize, argument: &'static str) -> Result<T, CommandError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let value = self.str(position, argument)?;
        value.parse().map_err(|err: T::Err| CommandError::InvalidArgument {
            argument,
            value: value.to_owned(),
            reason: err.to_string(),
        })
    }

    fn parse_opt<T>(
        &self,
        position: usize,
        argument: &'static str,
    ) -> Result<Option<T>, CommandError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if position < self.args.len() {
            self.parse(position, argument).map(Some)
        } else {
            Ok(None)
        }
    }
}

fn acquire<'a>(
    service: &'a SemaphoreService,
    args: &'a [&'a str],
) -> BoxFuture<'a, Result<String, CommandError>> {
    async move {
        let args = Args::new(SemaphoreCommand::Acquire, args);
        let name = args.str(0, "name")?;
        let owner: OwnerId = args.parse(1, "owner")?;
        let permits: u32 = args.parse(2, "permits")?;
        let attach: bool = args.parse(3, "attach")?;
        let timeout = args
            .parse_opt::<u64>(4, "timeout_ms")?
            .map(Duration::from_millis);

        service
            .create_distributed_object(name)
            .acquire(owner, permits, attach, timeout)
            .await?;
        Ok("OK".to_owned())
    }
    .boxed()
}

fn try_acquire<'a>(
    service: &'a SemaphoreService,
    args: &'a [&'a str],
) -> BoxFuture<'a, Result<String, CommandError>> {
    async move {
        let args = Args::new(SemaphoreCommand::TryAcquire, args);
        let name = args.str(0, "name")?;
        let owner: OwnerId = args.parse(1, "owner")?;
        let permits: u32 = args.parse(2, "permits")?;
        let attach: bool = args.parse(3, "attach")?;

        let acquired = service
            .create_distributed_object(name)
            .try_acquire(owner, permits, attach)
            .await?;
        Ok(acquired.to_string())
    }
    .boxed()
}

fn release<'a>(
    service: &'a SemaphoreService,
    args: &'a [&'a str],
) -> BoxFuture<'a, Result<String, CommandError>> {
    async move {
        let args = Args::new(SemaphoreCommand::Release, args);
        let name = args.str(0, "name")?;
        let owner: OwnerId = args.parse(1, "owner")?;
        let permits: u32 = args.parse(2, "permits")?;

        service
            .create_distributed_object(name)
            .release(owner, permits)
            .await?;
        Ok("OK".to_owned())
    }
    .boxed()
}

fn drain_permits<'a>(
    service: &'a SemaphoreService,
    args: &'a [&'a str],
) -> BoxFuture<'a, Result<String, CommandError>> {
    async move {
        let args = Args::new(SemaphoreCommand::DrainPermits, args);
        let name = args.str(0, "name")?;
        let owner: OwnerId = args.parse(1, "owner")?;

        let drained = service
            .create_distributed_object(name)
            .drain_permits(owner)
            .await?;
        Ok(drained.to_string())
    }
    .boxed()
}

fn available_permits<'a>(
    service: &'a SemaphoreService,
    args: &'a [&'a str],
) -> BoxFuture<'a, Result<String, CommandError>> {
    async move {
        let args = Args::new(SemaphoreCommand::AvailablePermits, args);
        let name = args.str(0, "name")?;

        let available = service
            .create_distributed_object(name)
            .available_permits()
            .await?;
        Ok(available.to_string())
    }
    .boxed()
}

fn init<'a>(
    service: &'a SemaphoreService,
    args: &'a [&'a str],
) -> BoxFuture<'a, Result<String, CommandError>> {
    async move {
        let args = Args::new(SemaphoreCommand::Init, args);
        let name = args.str(0, "name")?;
        let permits: u32 = args.parse(1, "permits")?;

        let initialized = service.create_distributed_object(name).init(permits).await?;
        Ok(initialized.to_string())
    }
    .boxed()
}
