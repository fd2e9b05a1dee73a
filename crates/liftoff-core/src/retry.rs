//! The one bounded poll/retry combinator.
//!
//! Build status, promote copy status, and release readiness all poll through
//! [`poll_until`]; one-shot provider calls go through [`retry`]. Both retry
//! transient errors a bounded number of times at a fixed interval and stop
//! early on cancellation.

use crate::CoreError;
use liftoff_runtime::{OperationStatus, RuntimeError};
use liftoff_schema::Settings;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
    /// Consecutive transient errors tolerated before giving up.
    pub transient_retries: u32,
}

impl PollPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            transient_retries: 3,
        }
    }

    #[must_use]
    pub fn with_retries(mut self, transient_retries: u32) -> Self {
        self.transient_retries = transient_retries;
        self
    }

    pub fn for_builds(settings: &Settings) -> Self {
        Self::new(settings.poll_interval(), settings.build_timeout())
            .with_retries(settings.transient_retries)
    }

    pub fn for_releases(settings: &Settings) -> Self {
        Self::new(settings.poll_interval(), settings.release_timeout())
            .with_retries(settings.transient_retries)
    }
}

async fn pause(interval: Duration, deadline: Instant, cancel: &CancellationToken) -> Result<(), CoreError> {
    let wake = (Instant::now() + interval).min(deadline);
    tokio::select! {
        () = cancel.cancelled() => Err(CoreError::Cancelled),
        () = tokio::time::sleep_until(wake) => Ok(()),
    }
}

/// Poll until the operation is terminal, the timeout elapses, or `cancel`
/// fires.
///
/// `Failed` becomes [`CoreError::OperationFailed`]; callers rewrap it in
/// their own failure kind. Running out of time is always
/// [`CoreError::Timeout`].
pub async fn poll_until<T, F, Fut>(
    operation: &str,
    policy: &PollPolicy,
    cancel: &CancellationToken,
    mut poll: F,
) -> Result<T, CoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<OperationStatus<T>, RuntimeError>>,
{
    let deadline = Instant::now() + policy.timeout;
    let timeout = || CoreError::Timeout {
        operation: operation.to_owned(),
        after: policy.timeout,
    };
    let mut transient = 0;
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        attempt += 1;
        let status = tokio::select! {
            () = cancel.cancelled() => return Err(CoreError::Cancelled),
            polled = tokio::time::timeout_at(deadline, poll()) => polled.map_err(|_| timeout())?,
        };
        match status {
            Ok(OperationStatus::Done(value)) => {
                debug!(operation, attempt, "operation finished");
                return Ok(value);
            }
            Ok(OperationStatus::Failed { reason, log_url }) => {
                return Err(CoreError::OperationFailed {
                    operation: operation.to_owned(),
                    reason,
                    log_ref: log_url,
                });
            }
            Ok(OperationStatus::Pending { detail }) => {
                transient = 0;
                debug!(operation, attempt, detail = detail.as_deref().unwrap_or(""), "still pending");
            }
            Err(e) if e.is_transient() && transient < policy.transient_retries => {
                transient += 1;
                warn!(operation, attempt, error = %e, "transient error while polling, retrying");
            }
            Err(e) => return Err(e.into()),
        }
        if Instant::now() >= deadline {
            return Err(timeout());
        }
        pause(policy.interval, deadline, cancel).await?;
    }
}

/// Call `f` until it succeeds, retrying transient errors up to
/// `policy.transient_retries` times at `policy.interval`.
pub async fn retry<T, F, Fut>(
    operation: &str,
    policy: &PollPolicy,
    cancel: &CancellationToken,
    mut f: F,
) -> Result<T, CoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RuntimeError>>,
{
    let mut failures = 0;
    loop {
        let result = tokio::select! {
            () = cancel.cancelled() => return Err(CoreError::Cancelled),
            result = f() => result,
        };
        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && failures < policy.transient_retries => {
                failures += 1;
                warn!(operation, failures, error = %e, "transient error, retrying");
                tokio::select! {
                    () = cancel.cancelled() => return Err(CoreError::Cancelled),
                    () = tokio::time::sleep(policy.interval) => {}
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}
