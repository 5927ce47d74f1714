use std::time::Duration;

use tracing::{info, warn};

use super::ExtractorError;
use crate::cancel::CancelToken;
use crate::cli::Backoff;

const MAX_BACKOFF_DOUBLINGS: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Wait before retry number `attempt + 1`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential => self
                .delay
                .saturating_mul(1_u32 << attempt.min(MAX_BACKOFF_DOUBLINGS)),
        }
    }
}

/// Runs `call` until it succeeds, fails permanently, or transient failures
/// exhaust `policy.max_retries`. Backoff sleeps are cut short by cancellation.
pub fn call_with_retry<T, F>(
    policy: &RetryPolicy,
    cancel: &CancelToken,
    label: &str,
    mut call: F,
) -> Result<T, ExtractorError>
where
    F: FnMut() -> Result<T, ExtractorError>,
{
    let mut attempt = 0_u32;
    loop {
        match call() {
            Ok(value) => {
                if attempt > 0 {
                    info!(extractor = %label, retries = attempt, "extractor call recovered");
                }
                return Ok(value);
            }
            Err(err) if err.is_transient() && attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                warn!(
                    extractor = %label,
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    delay_sec = delay.as_secs_f64(),
                    error = %err,
                    "transient extractor failure, backing off"
                );
                if !cancel.sleep(delay) {
                    return Err(ExtractorError::Cancelled);
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
