//! Retry and timeout combinators used by every polling component.
//!
//! Polling is always expressed as `with_timeout(retry_forever(operation))`:
//! the outer timeout wraps the inner retry loop, so a hanging attempt is
//! cancelled together with the loop and no wait can outlive its budget.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{debug, trace};

use crate::error::{HarnessError, Result};

/// A fixed-interval, infinite retry bounded by an overall timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Pause between two attempts
    pub interval: Duration,
    /// Budget for the whole retry loop, attempts included
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Polling used while waiting for a freshly started project: every second
    /// for ten seconds.
    pub fn health() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(10))
    }

    /// Polling used while looking for a round-trip artifact: every 200ms for
    /// one minute.
    pub fn round_trip() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_secs(60))
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs `operation` until it succeeds or the policy's timeout elapses.
    ///
    /// Any failure is retried. On expiry the error is
    /// [`HarnessError::TimeoutExpired`] carrying `what`, `guidance` and the
    /// last failure that was observed.
    pub async fn execute<T, E, F, Fut>(
        &self,
        what: &str,
        guidance: &str,
        operation: F,
    ) -> Result<T>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let mut last_failure = None;
        let outcome = with_timeout(
            self.timeout,
            retry_forever(self.interval, operation, &mut last_failure),
        )
        .await;

        match outcome {
            Some(value) => Ok(value),
            None => {
                debug!(what, timeout = ?self.timeout, "retry budget exhausted");
                Err(HarnessError::TimeoutExpired {
                    what: what.to_string(),
                    timeout: self.timeout,
                    guidance: guidance.to_string(),
                    last_failure,
                })
            }
        }
    }
}

/// Awaits `future` for at most `total`; `None` means the budget ran out.
pub async fn with_timeout<T>(total: Duration, future: impl Future<Output = T>) -> Option<T> {
    timeout(total, future).await.ok()
}

/// Calls `operation` until it returns `Ok`, sleeping `interval` after every
/// failure. Never returns on its own if the operation keeps failing; wrap it
/// in [`with_timeout`].
///
/// The most recent failure is written to `last_failure` so that a caller
/// whose timeout fired can still report why.
pub async fn retry_forever<T, E, F, Fut>(
    interval: Duration,
    mut operation: F,
    last_failure: &mut Option<String>,
) -> T
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return value,
            Err(e) => {
                trace!(attempt, error = %e, "attempt failed, retrying in {:?}", interval);
                *last_failure = Some(e.to_string());
            }
        }
        sleep(interval).await;
    }
}
