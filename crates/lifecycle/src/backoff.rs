//! Retry backoff for failed renewals.
//!
//! The base interval grows exponentially with the number of consecutive
//! failures and is capped at `max_interval`:
//!
//! ```text
//! interval(n) = min(initial * multiplier^(n-1), max_interval)    n >= 1
//! ```
//!
//! Jitter is added on top of the base interval, never subtracted, so the
//! scheduled delay is always at least the base interval. The jittered delay
//! is clamped to `max_interval` as well.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct BackoffPolicy {
    /// Interval after the first failure, in seconds
    #[serde(default = "default_initial_secs")]
    #[validate(range(min = 1))]
    pub initial_secs: u64,

    /// Upper bound on the base interval, in seconds
    #[serde(default = "default_max_secs")]
    #[validate(range(min = 1))]
    pub max_secs: u64,

    /// Growth factor per consecutive failure
    #[serde(default = "default_multiplier")]
    #[validate(range(min = 1.0, max = 16.0))]
    pub multiplier: f64,

    /// Maximum jitter as a fraction of the base interval (0.0 disables jitter)
    #[serde(default = "default_jitter_ratio")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub jitter_ratio: f64,
}

fn default_initial_secs() -> u64 {
    60
}
fn default_max_secs() -> u64 {
    6 * 3600
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_jitter_ratio() -> f64 {
    0.2
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_secs: default_initial_secs(),
            max_secs: default_max_secs(),
            multiplier: default_multiplier(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

impl BackoffPolicy {
    pub fn initial(&self) -> Duration {
        Duration::from_secs(self.initial_secs)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_secs(self.max_secs.max(self.initial_secs))
    }

    /// Base (unjittered) interval after `failures` consecutive failures.
    ///
    /// Non-decreasing in `failures` and never above [`max_interval`](Self::max_interval).
    pub fn interval(&self, failures: u32) -> Duration {
        let cap = self.max_interval();
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (failures - 1).min(i32::MAX as u32) as i32;
        let secs = self.initial_secs as f64 * self.multiplier.max(1.0).powi(exponent);
        if !secs.is_finite() || secs >= cap.as_secs_f64() {
            return cap;
        }
        Duration::from_secs_f64(secs)
    }

    /// Interval with jitter drawn from `rng`, in
    /// `[interval, min(interval * (1 + jitter_ratio), max_interval)]`.
    pub fn jittered_with<R: Rng + ?Sized>(&self, failures: u32, rng: &mut R) -> Duration {
        let base = self.interval(failures);
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        if ratio == 0.0 || base.is_zero() {
            return base;
        }
        let factor: f64 = rng.gen_range(0.0..=ratio);
        (base + base.mul_f64(factor)).min(self.max_interval())
    }

    /// Interval with jitter from the thread-local generator.
    pub fn jittered(&self, failures: u32) -> Duration {
        self.jittered_with(failures, &mut rand::thread_rng())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            initial_secs: 10,
            max_secs: 100,
            multiplier: 2.0,
            jitter_ratio: 0.0,
        }
    }

    #[test]
    fn test_exponential_growth_and_cap() {
        let p = policy();
        assert_eq!(p.interval(0), Duration::ZERO);
        assert_eq!(p.interval(1), Duration::from_secs(10));
        assert_eq!(p.interval(2), Duration::from_secs(20));
        assert_eq!(p.interval(3), Duration::from_secs(40));
        assert_eq!(p.interval(4), Duration::from_secs(80));
        // Should cap at max
        assert_eq!(p.interval(5), Duration::from_secs(100));
        assert_eq!(p.interval(u32::MAX), Duration::from_secs(100));
    }

    #[test]
    fn test_no_jitter_is_exact() {
        let p = policy();
        assert_eq!(p.jittered(3), Duration::from_secs(40));
    }

    #[test]
    fn test_jitter_never_exceeds_cap() {
        let p = BackoffPolicy {
            jitter_ratio: 1.0,
            ..policy()
        };
        let mut rng = StdRng::seed_from_u64(7);
        for failures in 1..8 {
            for _ in 0..200 {
                assert!(p.jittered_with(failures, &mut rng) <= Duration::from_secs(100));
            }
        }
        // At the cap there is no room left for jitter
        assert_eq!(p.jittered_with(6, &mut rng), Duration::from_secs(100));
    }

    #[test]
    fn test_max_below_initial_uses_initial() {
        let p = BackoffPolicy {
            initial_secs: 50,
            max_secs: 10,
            ..policy()
        };
        assert_eq!(p.interval(1), Duration::from_secs(50));
        assert_eq!(p.interval(9), Duration::from_secs(50));
    }

    #[test]
    fn test_default_policy_validates() {
        assert!(BackoffPolicy::default().validate().is_ok());
        let bad = BackoffPolicy {
            jitter_ratio: 1.5,
            ..BackoffPolicy::default()
        };
        assert!(bad.validate().is_err());
    }

    proptest! {
        #[test]
        fn prop_interval_non_decreasing(
            initial in 1u64..3600,
            max in 1u64..86_400,
            multiplier in 1.0f64..8.0,
            failures in 1u32..64,
        ) {
            let p = BackoffPolicy { initial_secs: initial, max_secs: max, multiplier, jitter_ratio: 0.0 };
            let current = p.interval(failures);
            let next = p.interval(failures + 1);
            prop_assert!(next >= current);
            prop_assert!(next <= p.max_interval());
        }

        #[test]
        fn prop_jitter_within_bounds(
            failures in 1u32..32,
            ratio in 0.0f64..=1.0,
            seed in any::<u64>(),
        ) {
            let p = BackoffPolicy { jitter_ratio: ratio, ..policy() };
            let mut rng = StdRng::seed_from_u64(seed);
            let base = p.interval(failures);
            let jittered = p.jittered_with(failures, &mut rng);
            prop_assert!(jittered >= base);
            prop_assert!(jittered.as_secs_f64() <= base.as_secs_f64() * (1.0 + ratio) + 1e-6);
            prop_assert!(jittered <= p.max_interval());
        }
    }
}
