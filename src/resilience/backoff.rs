//! Delay between accept retries.

use std::time::Duration;

use rand::Rng;

use crate::config::AcceptRetryConfig;

/// Streak of consecutive accept failures and the wait it calls for.
#[derive(Debug)]
pub struct AcceptBackoff {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl AcceptBackoff {
    pub fn new(config: &AcceptRetryConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_delay_ms),
            max: Duration::from_millis(config.max_delay_ms),
            failures: 0,
        }
    }

    /// Count one more failure and return how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        delay_for(self.failures, self.base, self.max)
    }

    /// A connection was accepted; the next failure starts from `base` again.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// `base` doubled per failure, capped at `max`, plus up to 10% jitter.
fn delay_for(failures: u32, base: Duration, max: Duration) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
    let capped = base.saturating_mul(factor).min(max);

    let jitter_ms = (capped.as_millis() / 10) as u64;
    let jitter = if jitter_ms > 0 {
        rand::thread_rng().gen_range(0..jitter_ms)
    } else {
        0
    };
    capped + Duration::from_millis(jitter)
}
