use std::time::Duration;

/// Wait before the next attempt after `failures` consecutive failures:
/// `min(base * 2^failures, max)`, saturating instead of overflowing.
pub fn delay_for(base: Duration, max: Duration, failures: u32) -> Duration {
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    let factor = 2u64.saturating_pow(failures);
    Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
}

/// Consecutive-failure counter for stream reconnects
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, failures: 0 }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Wait for the current failure count
    pub fn delay(&self) -> Duration {
        delay_for(self.base, self.max, self.failures)
    }

    /// Count one more failure and return the wait before the next attempt
    pub fn record_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.delay()
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}
