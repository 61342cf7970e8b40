use std::time::Duration;

/// How many times to try an operation and how long to back off in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Zero behaves like one.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for every further attempt.
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub const fn once() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    pub(crate) fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Retry a function with exponential backoff.
///
/// Errors rejected by `should_retry` are returned immediately.
///
/// # Arguments
/// * `f` - The function to retry
/// * `policy` - Attempt count and base delay
/// * `operation_name` - Human-readable name for logging
/// * `should_retry` - Whether a given error is worth another attempt
pub fn retry_with_backoff<F, T, E, P>(
    mut f: F,
    policy: &RetryPolicy,
    operation_name: &str,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        let e = match f() {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        attempt += 1;
        if attempt >= max_attempts || !should_retry(&e) {
            if max_attempts > 1 {
                tracing::error!(
                    "{} failed after {} attempt(s): {}",
                    operation_name,
                    attempt,
                    e
                );
            }
            return Err(e);
        }

        let delay = policy.delay_for_attempt(attempt - 1);
        tracing::warn!(
            "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
            operation_name,
            attempt,
            max_attempts,
            e,
            delay
        );
        std::thread::sleep(delay);
    }
}
