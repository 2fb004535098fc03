//! Bounded retry with a fixed delay.

use std::thread;
use std::time::Duration;

use crate::error::{RecoveryError, Result};
use crate::journal::Journal;

/// How often and how patiently to re-run a failed operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total number of invocations allowed, including the first.
    pub attempts: u32,
    /// Fixed pause between attempts. No backoff, no jitter.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// The policy used for flashing: the whole method chain is re-run up to
    /// ten times.
    pub fn flashing() -> Self {
        Self {
            attempts: 10,
            ..Self::default()
        }
    }
}

/// Re-invokes `op` until it succeeds, fails permanently, or the policy's
/// attempts are exhausted.
///
/// Only failures for which [`RecoveryError::is_retryable`] holds are retried;
/// anything else is returned to the caller untouched on the spot. Each
/// retried failure is journalled as a warning and followed by the fixed
/// delay (no pause after the final attempt). Exhaustion is journalled as an
/// error and reported as [`RecoveryError::RetryExhausted`].
pub fn retry<T, F>(journal: &Journal, policy: RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    for attempt in 1..=policy.attempts {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) if attempt < policy.attempts => {
                journal.warn(format!(
                    "{label} attempt {attempt}/{} failed: {e}; retrying in {:?}",
                    policy.attempts, policy.delay
                ));
                thread::sleep(policy.delay);
            }
            Err(e) => {
                journal.warn(format!(
                    "{label} attempt {attempt}/{} failed: {e}",
                    policy.attempts
                ));
            }
        }
    }

    journal.error(format!(
        "{label} failed after {} attempts",
        policy.attempts
    ));
    Err(RecoveryError::RetryExhausted {
        attempts: policy.attempts,
    })
}
