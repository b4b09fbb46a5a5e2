use std::time::Duration;

use crate::defaults::TransportDefaults;
use crate::error::Result;

/// Bounded exponential backoff for transient transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
        }
    }

    pub fn from_defaults(defaults: &TransportDefaults) -> Self {
        Self::new(
            defaults.retry_attempts,
            Duration::from_millis(defaults.backoff_base_millis),
        )
    }

    /// Delay before retry number `retry` (1-based): base, 2*base, 4*base, ...
    pub fn delay_before(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    /// `op` receives the 1-based attempt number. Only errors whose code is
    /// transient are retried; authentication and command failures surface
    /// immediately.
    pub fn run<T>(&self, label: &str, mut op: impl FnMut(u32) -> Result<T>) -> Result<T> {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.attempts => {
                    let delay = self.delay_before(attempt);
                    log_status!(
                        "ssh",
                        "{} failed (attempt {}/{}): {}; retrying in {}ms",
                        label,
                        attempt,
                        self.attempts,
                        err.message,
                        delay.as_millis()
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_defaults(&TransportDefaults::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, TargetDetails};
    use std::cell::Cell;

    fn instant(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::ZERO)
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::new(3, Duration::from_millis(500));
        assert_eq!(policy.delay_before(1), Duration::from_millis(500));
        assert_eq!(policy.delay_before(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_before(3), Duration::from_millis(2000));
    }

    #[test]
    fn transient_errors_retry_until_attempts_exhausted() {
        let calls = Cell::new(0);
        let result: Result<()> = instant(3).run("connect", |_| {
            calls.set(calls.get() + 1);
            Err(Error::ssh_unreachable(TargetDetails::default(), calls.get(), "connection refused"))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn auth_errors_are_not_retried() {
        let calls = Cell::new(0);
        let result: Result<()> = instant(3).run("connect", |_| {
            calls.set(calls.get() + 1);
            Err(Error::ssh_auth_failed(TargetDetails::default(), "Permission denied"))
        });
        assert_eq!(result.unwrap_err().code, crate::ErrorCode::SshAuthFailed);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn recovers_after_transient_failure() {
        let value = instant(3)
            .run("connect", |attempt| {
                if attempt < 2 {
                    Err(Error::ssh_timeout(TargetDetails::default(), attempt))
                } else {
                    Ok(attempt)
                }
            })
            .unwrap();
        assert_eq!(value, 2);
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).attempts, 1);
    }
}
