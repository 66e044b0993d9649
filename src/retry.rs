//! Retry with linear backoff.
//!
//! Both relay tiers and both direct-copy directions go through
//! [`RetryPolicy::run`].

use std::time::Duration;

use crate::{Result, TransferError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero means "never try".
    pub max_attempts: u32,
    /// Delay before attempt `k` (1-indexed) is `step * (k - 1)`.
    pub step: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, step: Duration) -> Self {
        Self { max_attempts, step }
    }

    /// Delay slept before `attempt` (1-indexed). Zero for the first attempt.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        self.step * attempt.saturating_sub(1)
    }

    /// Run `body` until it succeeds and `verify` accepts its output.
    ///
    /// A body error or a rejected result is logged and counts as a failed
    /// attempt. `what` names the artifact in logs and in the exhaustion error.
    pub fn run<T>(
        &self,
        what: &str,
        body: impl FnMut(u32) -> Result<T>,
        verify: impl FnMut(&T) -> bool,
    ) -> Result<T> {
        self.run_with_sleep(what, body, verify, std::thread::sleep)
    }

    /// [`run`](Self::run) with an injectable sleep, for tests.
    pub fn run_with_sleep<T>(
        &self,
        what: &str,
        mut body: impl FnMut(u32) -> Result<T>,
        mut verify: impl FnMut(&T) -> bool,
        mut sleep: impl FnMut(Duration),
    ) -> Result<T> {
        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                let delay = self.delay_before(attempt);
                tracing::info!(what, attempt, delay_secs = delay.as_secs(), "retrying");
                sleep(delay);
            }

            tracing::debug!(what, attempt, max = self.max_attempts, "attempt starting");
            match body(attempt) {
                Ok(value) if verify(&value) => return Ok(value),
                Ok(_) => {
                    tracing::warn!(what, attempt, max = self.max_attempts, "verification failed")
                }
                Err(e) => {
                    tracing::warn!(what, attempt, max = self.max_attempts, error = %e, "attempt failed")
                }
            }
        }

        Err(TransferError::RetriesExhausted {
            what: what.to_string(),
            attempts: self.max_attempts,
        })
    }
}
