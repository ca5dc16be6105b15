//! Bounded, cancellable polling
//!
//! Every "wait until deleted / ready" loop in the operator goes through [`Poll::until`],
//! so each one ends in success, a [`Error::Timeout`], or an [`Error::Cancelled`] when the
//! owning controller group is stopped.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::metrics;

/// Polling schedule
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Poll {
    /// Delay between checks
    pub interval: Duration,
    /// Overall budget, including the time spent inside checks
    pub timeout: Duration,
    /// Check once before the first delay
    pub immediate: bool,
    /// Multiplier applied to the delay after every check
    pub factor: u32,
    /// Upper bound for the delay when backing off
    pub max_interval: Duration,
}

impl Poll {
    /// Check immediately, then every `interval` until `timeout`
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            immediate: true,
            factor: 1,
            max_interval: interval,
        }
    }

    /// Check `tries` times, `interval` apart
    pub const fn tries(interval: Duration, tries: u32) -> Self {
        Self::new(interval, Duration::from_secs(interval.as_secs() * tries as u64))
    }

    /// Wait one interval before the first check
    pub const fn delayed(mut self) -> Self {
        self.immediate = false;
        self
    }

    /// Grow the delay geometrically up to `max_interval`
    pub const fn with_backoff(mut self, factor: u32, max_interval: Duration) -> Self {
        self.factor = factor;
        self.max_interval = max_interval;
        self
    }

    /// Run `check` until it reports `true`
    ///
    /// A check error aborts the wait and is returned as is.
    pub async fn until<F, Fut>(
        &self,
        cancel: &CancellationToken,
        what: &str,
        mut check: F,
    ) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let deadline = Instant::now() + self.timeout;
        let mut delay = self.interval;
        let mut first = self.immediate;

        loop {
            if !first {
                let now = Instant::now();
                if now >= deadline {
                    return Err(self.timed_out(what));
                }
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled(what.to_string())),
                    _ = sleep(delay.min(deadline - now)) => {}
                }
                delay = (delay * self.factor.max(1)).min(self.max_interval.max(self.interval));
            }
            first = false;

            if cancel.is_cancelled() {
                return Err(Error::Cancelled(what.to_string()));
            }

            match timeout_at(deadline, check()).await {
                Ok(Ok(true)) => return Ok(()),
                Ok(Ok(false)) => debug!(what = %what, "Condition not met yet"),
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(self.timed_out(what)),
            }
        }
    }

    fn timed_out(&self, what: &str) -> Error {
        metrics::POLL_TIMEOUTS.inc();
        Error::timeout(what, self.timeout)
    }
}
