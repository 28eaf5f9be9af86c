//! Timeout policy derived from a single base value.
//!
//! Every time bound in the engine is a fixed multiple of
//! [`DEFAULT_TIMEOUT_SECONDS`] (or of a configured replacement base):
//!
//! | Bound                      | Multiple | Default |
//! |----------------------------|----------|---------|
//! | Store operation            | 1x       | 30s     |
//! | Renewal attempt            | 4x       | 2m      |
//! | Liveness sweep threshold   | 20x      | 10m     |
//!
//! The liveness threshold must stay well above the attempt timeout so the
//! sweep never reclaims an attempt that is still legitimately waiting on the
//! certificate authority.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::trace;

/// Default timeout duration for certificate operations, in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// Store operation timeout as a multiple of the base.
pub const STORE_TIMEOUT_MULTIPLIER: u32 = 1;

/// Renewal attempt timeout as a multiple of the base.
pub const RENEWAL_TIMEOUT_MULTIPLIER: u32 = 4;

/// Liveness sweep threshold as a multiple of the base.
pub const LIVENESS_MULTIPLIER: u32 = 20;

/// Concrete time bounds used by the lifecycle engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    /// Upper bound for a single store call
    pub store_operation: Duration,
    /// Upper bound for one call to the certificate authority
    pub renewal_attempt: Duration,
    /// Age after which a `RenewalInFlight` record is considered stuck
    pub liveness_threshold: Duration,
}

impl TimeoutPolicy {
    /// Derive all bounds from a base timeout.
    ///
    /// Bounds saturate at `Duration::MAX` rather than overflow.
    pub fn from_base(base: Duration) -> Self {
        let policy = Self {
            store_operation: base.saturating_mul(STORE_TIMEOUT_MULTIPLIER),
            renewal_attempt: base.saturating_mul(RENEWAL_TIMEOUT_MULTIPLIER),
            liveness_threshold: base.saturating_mul(LIVENESS_MULTIPLIER),
        };
        trace!(
            base_secs = base.as_secs(),
            store_operation_ms = policy.store_operation.as_millis() as u64,
            renewal_attempt_ms = policy.renewal_attempt.as_millis() as u64,
            liveness_threshold_ms = policy.liveness_threshold.as_millis() as u64,
            "Derived timeout policy"
        );
        policy
    }

    /// Derive all bounds from a base timeout in whole seconds.
    pub fn from_base_secs(base_secs: u64) -> Self {
        Self::from_base(Duration::from_secs(base_secs))
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::from_base_secs(DEFAULT_TIMEOUT_SECONDS)
    }
}
