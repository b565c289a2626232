//! Small shared utilities.

use std::time::Duration;

/// Exponential backoff policy for retried operations.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// First delay.
    pub base: Duration,
    /// Multiplier between attempts.
    pub factor: u32,
    /// Upper bound on any single delay.
    pub cap: Duration,
    /// Total attempts before giving up.
    pub max_attempts: u32,
}

impl Backoff {
    /// The reload policy: base 250 ms, factor 2, cap 10 s, max 8 attempts.
    pub fn reload() -> Self {
        Self {
            base: Duration::from_millis(250),
            factor: 2,
            cap: Duration::from_secs(10),
            max_attempts: 8,
        }
    }

    /// The delay to sleep after a failed attempt (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.factor.saturating_pow(attempt);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Run `op` until it succeeds or attempts are exhausted, sleeping the
    /// policy's delay between attempts. Returns the last error on
    /// exhaustion.
    ///
    /// Blocking: intended for use inside `spawn_blocking` driver cycles.
    pub fn retry<T, E>(&self, mut op: impl FnMut() -> Result<T, E>) -> Result<T, E> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt + 1 >= self.max_attempts => return Err(e),
                Err(_) => {
                    std::thread::sleep(self.delay(attempt));
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_grow_and_cap() {
        let backoff = Backoff::reload();
        assert_eq!(backoff.delay(0), Duration::from_millis(250));
        assert_eq!(backoff.delay(1), Duration::from_millis(500));
        assert_eq!(backoff.delay(2), Duration::from_secs(1));
        // Capped at 10s well before attempt 8
        assert_eq!(backoff.delay(7), Duration::from_secs(10));
    }

    #[test]
    fn test_retry_succeeds_after_failures() {
        let fast = Backoff {
            base: Duration::from_millis(1),
            factor: 2,
            cap: Duration::from_millis(4),
            max_attempts: 5,
        };
        let mut calls = 0;
        let result: Result<u32, &str> = fast.retry(|| {
            calls += 1;
            if calls < 3 { Err("not yet") } else { Ok(42) }
        });
        assert_eq!(result, Ok(42));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_retry_exhausts() {
        let fast = Backoff {
            base: Duration::from_millis(1),
            factor: 1,
            cap: Duration::from_millis(1),
            max_attempts: 3,
        };
        let mut calls = 0;
        let result: Result<(), &str> = fast.retry(|| {
            calls += 1;
            Err("always")
        });
        assert_eq!(result, Err("always"));
        assert_eq!(calls, 3);
    }
}
