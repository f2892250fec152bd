//! Bounded retry with exponential backoff for compensating writes.

use std::thread;

use tracing::warn;

use crate::config::RetryPolicy;
use crate::error::StoreError;

/// Outcome of an exhausted retry loop.
#[derive(Debug)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last_error: StoreError,
}

/// Run `op` until it succeeds or the policy runs out of attempts.
///
/// Non-transient errors stop the loop immediately.
pub fn with_backoff<T, F>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, RetryExhausted>
where
    F: FnMut() -> Result<T, StoreError>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        let delay = policy.delay_before(attempt);
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts || !e.is_transient() => {
                return Err(RetryExhausted { attempts: attempt, last_error: e });
            }
            Err(e) => {
                warn!(what, attempt, error = %e, "retrying after failure");
                attempt += 1;
            }
        }
    }
}
