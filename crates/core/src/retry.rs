//! Retry policy: exponential backoff with a per-job ceiling.

use std::time::Duration;

/// What to do with a job whose attempt just failed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Persist `pending` with `retries = attempt`, requeue after `backoff`.
    Retry { attempt: u32, backoff: Duration },
    /// Retry budget exhausted; dead-letter the job.
    DeadLetter,
}

impl RetryDecision {
    /// `retries < max_retries` retries, anything else dead-letters.
    pub fn after_failure(retries: u32, max_retries: u32) -> Self {
        if retries < max_retries {
            let attempt = retries + 1;
            RetryDecision::Retry {
                attempt,
                backoff: backoff_for_attempt(attempt),
            }
        } else {
            RetryDecision::DeadLetter
        }
    }
}

/// Backoff before retry `attempt` (1-indexed): `2^attempt` seconds.
///
/// There is no ceiling; large attempts saturate instead of overflowing.
pub fn backoff_for_attempt(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt))
}
