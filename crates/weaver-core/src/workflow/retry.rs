//! Retry controller: attempt bounds and backoff delays.
//!
//! Stateless. The scheduler owns attempt counters and asks the controller
//! whether another attempt is allowed and how long to wait before it.
//! Attempts are 1-based: the first execution is attempt 1, so a policy with
//! `maxRetries = 2` allows attempts 1, 2 and 3.

use std::time::Duration;

use rand::Rng;
use weaver_types::workflow::{BackoffStrategy, RetryPolicy};

/// Stateless retry decisions.
pub struct RetryController;

impl RetryController {
    /// Whether a retry may follow the failed attempt `failed_attempt`.
    pub fn should_retry(policy: &RetryPolicy, failed_attempt: u32) -> bool {
        failed_attempt <= policy.max_retries
    }

    /// Total attempts the policy allows.
    pub fn max_attempts(policy: &RetryPolicy) -> u32 {
        policy.max_retries.saturating_add(1)
    }

    /// Delay before the retry that follows failed attempt `attempt`.
    pub fn next_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
        Self::next_delay_with_rng(attempt, policy, &mut rand::thread_rng())
    }

    /// Same as `next_delay` with a caller-supplied RNG (only `Jitter` draws from it).
    ///
    /// - Fixed: `base`
    /// - Linear: `attempt * base`
    /// - Exponential: `base * 2^(attempt-1)`
    /// - Jitter: uniform in `[0, exponential]`
    ///
    /// `maxDelayMilliseconds`, when set, caps the result. Attempt 0 is treated as 1.
    pub fn next_delay_with_rng<R: Rng + ?Sized>(
        attempt: u32,
        policy: &RetryPolicy,
        rng: &mut R,
    ) -> Duration {
        let attempt = attempt.max(1);
        let base = policy.delay_milliseconds;
        let cap = policy.max_delay_milliseconds.unwrap_or(u64::MAX);

        let millis = match policy.backoff_strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base.saturating_mul(u64::from(attempt)),
            BackoffStrategy::Exponential => exponential(base, attempt),
            BackoffStrategy::Jitter => {
                let ceiling = exponential(base, attempt).min(cap);
                rng.gen_range(0..=ceiling)
            }
        };

        Duration::from_millis(millis.min(cap))
    }

    /// Every delay the policy can produce, one per allowed retry.
    pub fn delay_sequence_with_rng<R: Rng + ?Sized>(
        policy: &RetryPolicy,
        rng: &mut R,
    ) -> Vec<Duration> {
        (1..=policy.max_retries)
            .map(|attempt| Self::next_delay_with_rng(attempt, policy, rng))
            .collect()
    }
}

fn exponential(base: u64, attempt: u32) -> u64 {
    let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
    base.saturating_mul(factor)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn policy(strategy: BackoffStrategy, max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff_strategy: strategy,
            delay_milliseconds: 1000,
            max_delay_milliseconds: None,
        }
    }

    fn millis(delays: &[Duration]) -> Vec<u64> {
        delays.iter().map(|d| d.as_millis() as u64).collect()
    }

    #[test]
    fn test_should_retry_bounds() {
        let p = policy(BackoffStrategy::Fixed, 2);
        assert!(RetryController::should_retry(&p, 1));
        assert!(RetryController::should_retry(&p, 2));
        assert!(!RetryController::should_retry(&p, 3));
        assert_eq!(RetryController::max_attempts(&p), 3);
    }

    #[test]
    fn test_zero_retries_means_single_attempt() {
        let p = policy(BackoffStrategy::Fixed, 0);
        assert!(!RetryController::should_retry(&p, 1));
        assert!(RetryController::delay_sequence_with_rng(&p, &mut StdRng::seed_from_u64(1)).is_empty());
    }

    #[test]
    fn test_fixed_linear_exponential_sequences() {
        let mut rng = StdRng::seed_from_u64(7);
        let fixed = RetryController::delay_sequence_with_rng(&policy(BackoffStrategy::Fixed, 4), &mut rng);
        assert_eq!(millis(&fixed), vec![1000, 1000, 1000, 1000]);

        let linear = RetryController::delay_sequence_with_rng(&policy(BackoffStrategy::Linear, 4), &mut rng);
        assert_eq!(millis(&linear), vec![1000, 2000, 3000, 4000]);

        let exp = RetryController::delay_sequence_with_rng(&policy(BackoffStrategy::Exponential, 4), &mut rng);
        assert_eq!(millis(&exp), vec![1000, 2000, 4000, 8000]);
    }

    #[test]
    fn test_sequences_are_monotonic() {
        for strategy in [BackoffStrategy::Fixed, BackoffStrategy::Linear, BackoffStrategy::Exponential] {
            let mut rng = StdRng::seed_from_u64(42);
            let seq = RetryController::delay_sequence_with_rng(&policy(strategy, 10), &mut rng);
            assert!(seq.windows(2).all(|w| w[0] <= w[1]), "{strategy:?} not monotonic");
        }
    }

    #[test]
    fn test_jitter_bounded_by_exponential() {
        let p = policy(BackoffStrategy::Jitter, 8);
        let ceiling = policy(BackoffStrategy::Exponential, 8);
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let jitter = RetryController::delay_sequence_with_rng(&p, &mut rng);
            let exp = RetryController::delay_sequence_with_rng(&ceiling, &mut rng);
            for (j, e) in jitter.iter().zip(exp.iter()) {
                assert!(j <= e);
            }
        }
    }

    #[test]
    fn test_jitter_is_deterministic_for_a_seed() {
        let p = policy(BackoffStrategy::Jitter, 5);
        let a = RetryController::delay_sequence_with_rng(&p, &mut StdRng::seed_from_u64(9));
        let b = RetryController::delay_sequence_with_rng(&p, &mut StdRng::seed_from_u64(9));
        assert_eq!(a, b);
    }

    #[test]
    fn test_max_delay_caps_every_strategy() {
        let mut p = policy(BackoffStrategy::Exponential, 6);
        p.max_delay_milliseconds = Some(5000);
        let seq = RetryController::delay_sequence_with_rng(&p, &mut StdRng::seed_from_u64(3));
        assert_eq!(millis(&seq), vec![1000, 2000, 4000, 5000, 5000, 5000]);

        p.backoff_strategy = BackoffStrategy::Jitter;
        let seq = RetryController::delay_sequence_with_rng(&p, &mut StdRng::seed_from_u64(3));
        assert!(seq.iter().all(|d| d.as_millis() <= 5000));
    }

    #[test]
    fn test_large_attempt_saturates() {
        let p = policy(BackoffStrategy::Exponential, 10);
        let delay = RetryController::next_delay(200, &p);
        assert_eq!(delay, Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_attempt_zero_treated_as_first() {
        let p = policy(BackoffStrategy::Linear, 3);
        assert_eq!(RetryController::next_delay(0, &p), Duration::from_millis(1000));
    }
}
