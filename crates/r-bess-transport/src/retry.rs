//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "UDP device transport."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use rand::Rng;

/// Retry budget with exponential backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    /// Delay after the first failed attempt; doubles with each further failure.
    pub base_delay: Duration,
    /// Upper bound of the random extra delay added to each backoff.
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32, base_delay: Duration, jitter: Duration) -> Self {
        Self {
            retries,
            base_delay,
            jitter,
        }
    }

    /// Total attempts, including the first.
    pub fn attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Delay after failed attempt `attempt` (1-indexed).
    pub fn backoff_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let exponent = attempt.saturating_sub(1).min(8);
        let base = self.base_delay.saturating_mul(2u32.pow(exponent));
        if self.jitter.is_zero() {
            base
        } else {
            let jitter_ms = rng.gen_range(0..=self.jitter.as_millis().max(1)) as u64;
            base + Duration::from_millis(jitter_ms)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn delays_double_per_attempt() {
        let policy = RetryPolicy::new(3, Duration::from_millis(500), Duration::ZERO);
        let mut rng = StdRng::seed_from_u64(7);
        let delays: Vec<_> = (1..=3).map(|n| policy.backoff_delay(n, &mut rng)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_millis(1000),
                Duration::from_millis(2000)
            ]
        );
        assert_eq!(policy.attempts(), 4);
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = RetryPolicy::new(2, Duration::from_millis(100), Duration::from_millis(50));
        let mut rng = StdRng::seed_from_u64(0xBE55);
        for _ in 0..100 {
            let delay = policy.backoff_delay(1, &mut rng);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn exponent_is_capped() {
        let policy = RetryPolicy::new(20, Duration::from_millis(1), Duration::ZERO);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(policy.backoff_delay(20, &mut rng), Duration::from_millis(256));
    }
}
