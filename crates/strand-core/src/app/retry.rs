//! Retry policy: decides backoff delays for failing background processes.

use std::time::Duration;

/// Exponential backoff with an upper bound.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,

    pub multiplier: f64,

    /// No delay ever exceeds this.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next run, given `failures` consecutive failures (1-indexed).
    ///
    /// `base_delay * multiplier^(failures - 1)`, capped at `max_delay`.
    pub fn next_delay(&self, failures: u32) -> Duration {
        let exponent = i32::try_from(failures.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::first(1, 1)]
    #[case::second(2, 2)]
    #[case::third(3, 4)]
    #[case::capped(7, 60)]
    #[case::far_past_the_cap(10_000, 60)]
    fn backoff_doubles_up_to_the_cap(#[case] failures: u32, #[case] expected_secs: u64) {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(failures), Duration::from_secs(expected_secs));
    }

    #[test]
    fn zero_failures_uses_the_base_delay() {
        assert_eq!(RetryPolicy::default().next_delay(0), Duration::from_secs(1));
    }
}
