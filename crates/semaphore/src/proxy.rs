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
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use permitgrid_types::identifiers::OwnerId;
use permitgrid_types::retries::RetryPolicy;

use crate::SemaphoreError;
use crate::operation::{OperationOutcome, PermitOperation};

/// A client request against a named semaphore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SemaphoreRequest {
    /// Waits for the permits until `deadline`, forever if unset.
    Acquire {
        name: String,
        owner: OwnerId,
        permits: u32,
        attach: bool,
        deadline: Option<Instant>,
    },
    Operation(PermitOperation),
}

impl SemaphoreRequest {
    pub fn name(&self) -> Option<&str> {
        match self {
            SemaphoreRequest::Acquire { name, .. } => Some(name),
            SemaphoreRequest::Operation(operation) => operation.name(),
        }
    }
}

/// Delivers requests to a node able to process them.
#[async_trait::async_trait]
pub trait SemaphoreInvoker: Send + Sync + 'static {
    async fn invoke(&self, request: SemaphoreRequest) -> Result<OperationOutcome, SemaphoreError>;
}

/// Client handle of a named semaphore.
///
/// Requests that hit a node not owning the semaphore's partition are resubmitted according
/// to the retry policy, callers never observe [`SemaphoreError::NotOwner`] unless the
/// retries are exhausted.
#[derive(Clone)]
pub struct SemaphoreProxy {
    name: String,
    invoker: Arc<dyn SemaphoreInvoker>,
    retry_policy: RetryPolicy,
}

impl SemaphoreProxy {
    pub fn new(
        name: impl Into<String>,
        invoker: Arc<dyn SemaphoreInvoker>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            invoker,
            retry_policy,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits until `permits` are available and takes them. Without `timeout` this waits
    /// until the permits become available or the owner disconnects.
    pub async fn acquire(
        &self,
        owner: OwnerId,
        permits: u32,
        attach: bool,
        timeout: Option<Duration>,
    ) -> Result<(), SemaphoreError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        self.call(SemaphoreRequest::Acquire {
            name: self.name.clone(),
            owner,
            permits,
            attach,
            deadline,
        })
        .await
        .map(|_| ())
    }

    pub async fn try_acquire(
        &self,
        owner: OwnerId,
        permits: u32,
        attach: bool,
    ) -> Result<bool, SemaphoreError> {
        match self
            .operation(PermitOperation::TryAcquire {
                name: self.name.clone(),
                owner,
                permits,
                attach,
            })
            .await?
        {
            OperationOutcome::Acquired(acquired) => Ok(acquired),
            other => unexpected(other),
        }
    }

    pub async fn release(&self, owner: OwnerId, permits: u32) -> Result<(), SemaphoreError> {
        self.operation(PermitOperation::Release {
            name: self.name.clone(),
            owner,
            permits,
        })
        .await
        .map(|_| ())
    }

    pub async fn drain_permits(&self, owner: OwnerId) -> Result<u32, SemaphoreError> {
        match self
            .operation(PermitOperation::DrainPermits {
                name: self.name.clone(),
                owner,
            })
            .await?
        {
            OperationOutcome::Drained(drained) => Ok(drained),
            other => unexpected(other),
        }
    }

    pub async fn reduce(&self, permits: u32) -> Result<(), SemaphoreError> {
        self.operation(PermitOperation::Reduce {
            name: self.name.clone(),
            permits,
        })
        .await
        .map(|_| ())
    }

    pub async fn available_permits(&self) -> Result<u32, SemaphoreError> {
        match self
            .operation(PermitOperation::AvailablePermits {
                name: self.name.clone(),
            })
            .await?
        {
            OperationOutcome::Available(available) => Ok(available),
            other => unexpected(other),
        }
    }

    pub async fn init(&self, permits: u32) -> Result<bool, SemaphoreError> {
        match self
            .operation(PermitOperation::Init {
                name: self.name.clone(),
                permits,
            })
            .await?
        {
            OperationOutcome::Initialized(initialized) => Ok(initialized),
            other => unexpected(other),
        }
    }

    async fn operation(
        &self,
        operation: PermitOperation,
    ) -> Result<OperationOutcome, SemaphoreError> {
        self.call(SemaphoreRequest::Operation(operation)).await
    }

    async fn call(&self, request: SemaphoreRequest) -> Result<OperationOutcome, SemaphoreError> {
        self.retry_policy
            .clone()
            .retry_if(
                || {
                    let invoker = Arc::clone(&self.invoker);
                    let request = request.clone();
                    async move { invoker.invoke(request).await }
                },
                |err: &SemaphoreError| {
                    let retry = err.is_retryable();
                    if retry {
                        trace!(name = %self.name, %err, "Resubmitting request");
                    }
                    retry
                },
            )
            .await
    }
}

fn unexpected<T>(outcome: OperationOutcome) -> Result<T, SemaphoreError> {
    Err(SemaphoreError::UnexpectedOutcome(outcome))
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;

    use super::*;

    struct AnswersWith(OperationOutcome);

    #[async_trait::async_trait]
    impl SemaphoreInvoker for AnswersWith {
        async fn invoke(
            &self,
            _request: SemaphoreRequest,
        ) -> std::result::Result<OperationOutcome, SemaphoreError> {
            Ok(self.0)
        }
    }

    #[test_log::test(tokio::test)]
    async fn mismatched_outcome_is_an_error() {
        let proxy = SemaphoreProxy::new(
            "jobs",
            Arc::new(AnswersWith(OperationOutcome::Released)),
            RetryPolicy::None,
        );

        assert_that!(
            proxy.available_permits().await,
            err(matches_pattern!(SemaphoreError::UnexpectedOutcome(eq(
                OperationOutcome::Released
            ))))
        );
        assert_that!(proxy.release(OwnerId::new(), 1).await, ok(anything()));
    }
}
