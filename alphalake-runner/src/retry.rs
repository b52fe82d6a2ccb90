//! Bounded retry with exponential backoff for transient upstream failures.

use alphalake_core::data::DataError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts. Used in tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
        }
    }

    /// Delay before attempt `attempt + 1`, doubling from `base_delay_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts are exhausted. The last error is returned.
    pub fn run<T>(&self, what: &str, mut op: impl FnMut() -> Result<T, DataError>) -> Result<T, DataError> {
        let max = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < max => {
                    let delay = self.backoff(attempt);
                    warn!(
                        op = what,
                        attempt,
                        max_attempts = max,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn backoff_doubles() {
        let p = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
        };
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(400));
    }

    #[test]
    fn retries_unavailable_then_succeeds() {
        let calls = Cell::new(0);
        let result = RetryPolicy::immediate(3).run("sh.600519", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(DataError::unavailable("eastmoney", "timeout"))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let calls = Cell::new(0);
        let result: Result<(), _> = RetryPolicy::immediate(2).run("sh.600519", || {
            calls.set(calls.get() + 1);
            Err(DataError::unavailable("eastmoney", "HTTP 502"))
        });
        assert!(result.unwrap_err().is_retryable());
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn not_found_is_never_retried() {
        let calls = Cell::new(0);
        let result: Result<(), _> = RetryPolicy::immediate(5).run("sh.688999", || {
            calls.set(calls.get() + 1);
            Err(DataError::not_found("sh.688999"))
        });
        assert!(matches!(result, Err(DataError::AssetNotFound { .. })));
        assert_eq!(calls.get(), 1);
    }
}
