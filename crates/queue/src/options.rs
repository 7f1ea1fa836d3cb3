use std::time::Duration;

/// Queue-wide scheduling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    /// Settle delay applied when a call doesn't supply its own.
    pub delay: Duration,
    /// Maximum number of operations running at the same time.
    pub concurrency: usize,
    /// Additional attempts after the first failure.
    pub retries: u32,
    pub backoff: Backoff,
}

impl Default for Options {
    fn default() -> Self {
        Self { delay: Duration::ZERO, concurrency: 1, retries: 0, backoff: Backoff::default() }
    }
}

impl Options {
    pub fn new(delay: Duration, concurrency: usize, retries: u32) -> Self {
        Self { delay, concurrency, retries, ..Self::default() }
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Exponential wait between failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: u32,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { initial: Duration::from_secs(1), factor: 2, max: Duration::from_secs(30) }
    }
}

impl Backoff {
    /// Wait after the given (1-based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let multiplier = self.factor.checked_pow(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial.checked_mul(multiplier).map_or(self.max, |delay| delay.min(self.max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, 1_000)]
    #[case(2, 2_000)]
    #[case(3, 4_000)]
    #[case(5, 16_000)]
    #[case(6, 30_000)]
    #[case(40, 30_000)]
    fn test_backoff_delay(#[case] attempt: u32, #[case] expected_ms: u64) {
        assert_eq!(Backoff::default().delay(attempt), Duration::from_millis(expected_ms));
    }
}
