//! Backoff computation for step retries (spec §4.3 "Retry").

use crate::model::BackoffPolicy;
use rand::Rng;
use std::time::Duration;

/// Compute the delay before attempt number `attempt` (1-based; the delay
/// before the *second* attempt is `attempt = 1`), applying the configured
/// multiplier, cap, and jitter.
#[must_use]
pub fn backoff_delay(policy: &BackoffPolicy, attempt: u32, rng: &mut impl Rng) -> Duration {
    let base = policy.initial_ms as f64 * policy.multiplier.powi(attempt.saturating_sub(1) as i32);
    let capped = base.min(policy.cap_ms as f64);
    let jitter_span = capped * policy.jitter.clamp(0.0, 1.0);
    let jittered = if jitter_span > 0.0 {
        capped - jitter_span + rng.gen::<f64>() * (2.0 * jitter_span)
    } else {
        capped
    };
    Duration::from_millis(jittered.max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn backoff_grows_with_attempt_and_respects_cap() {
        let policy = BackoffPolicy {
            initial_ms: 100,
            multiplier: 2.0,
            jitter: 0.0,
            cap_ms: 500,
        };
        let mut rng = StepRng::new(0, 1);
        assert_eq!(backoff_delay(&policy, 1, &mut rng), Duration::from_millis(100));
        assert_eq!(backoff_delay(&policy, 2, &mut rng), Duration::from_millis(200));
        assert_eq!(backoff_delay(&policy, 10, &mut rng), Duration::from_millis(500));
    }
}
