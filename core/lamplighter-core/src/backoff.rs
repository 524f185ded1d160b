use std::cmp;
use std::time::Duration;

const DEFAULT_ATTEMPTS: u32 = 3;
const DEFAULT_STEP_MS: u64 = 500;
const DEFAULT_MAX_MS: u64 = 5_000;

/// Bounded linear backoff: the delay after failed attempt `n` is
/// `step * n`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub step: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            step: Duration::from_millis(DEFAULT_STEP_MS),
            max: Duration::from_millis(DEFAULT_MAX_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, step: Duration, max: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            step,
            max,
        }
    }

    /// No waiting between attempts. Useful for tests and store access.
    pub fn immediate(attempts: u32) -> Self {
        Self::new(attempts, Duration::ZERO, Duration::ZERO)
    }

    /// Delay to wait after `failed_attempt` (1-based) before retrying, or
    /// `None` once the budget is spent.
    pub fn delay_after(&self, failed_attempt: u32) -> Option<Duration> {
        if failed_attempt >= self.attempts {
            return None;
        }
        let backoff = self.step.saturating_mul(failed_attempt);
        Some(cmp::min(backoff, self.max))
    }

    /// Runs `op` until it succeeds or the attempt budget is spent,
    /// calling `pause` between attempts. Returns the last error.
    pub fn run<T, E>(
        &self,
        mut pause: impl FnMut(Duration),
        mut op: impl FnMut(u32) -> Result<T, E>,
    ) -> Result<T, E> {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) => match self.delay_after(attempt) {
                    Some(delay) => {
                        if !delay.is_zero() {
                            pause(delay);
                        }
                        attempt += 1;
                    }
                    None => return Err(err),
                },
            }
        }
    }
}
