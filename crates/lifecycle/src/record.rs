//! Certificate lifecycle record and state machine.
//!
//! ```text
//!                  request in window          slot acquired
//!   Active ───────────────────────▶ RenewalPending ─────────▶ RenewalInFlight
//!     ▲                                  ▲                      │        │
//!     │            success (count reset) │ backoff elapsed      │        │
//!     └──────────────────────────────────┼──────────────────────┘        │
//!                                        │                               │ failure / timeout
//!                                   RenewalFailed ◀──────────────────────┘
//!
//!   any non-terminal ──revocation──▶ Revoked
//!   Active | RenewalPending | RenewalFailed ──now > not_after──▶ Expired
//! ```

use std::fmt;

use autocert_common::{CertificateId, ProviderRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LifecycleError;

/// Lifecycle status of a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateStatus {
    /// Valid and not currently being renewed
    Active,
    /// Queued for renewal, waiting for a worker slot
    RenewalPending,
    /// A renewal attempt is outstanding with the provider
    RenewalInFlight,
    /// The last attempt failed; retried after backoff unless attempts are exhausted
    RenewalFailed,
    /// Revoked by the provider (terminal)
    Revoked,
    /// Validity window has passed (terminal, never auto-deleted)
    Expired,
}

impl CertificateStatus {
    pub const ALL: [CertificateStatus; 6] = [
        CertificateStatus::Active,
        CertificateStatus::RenewalPending,
        CertificateStatus::RenewalInFlight,
        CertificateStatus::RenewalFailed,
        CertificateStatus::Revoked,
        CertificateStatus::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CertificateStatus::Active => "active",
            CertificateStatus::RenewalPending => "renewal_pending",
            CertificateStatus::RenewalInFlight => "renewal_in_flight",
            CertificateStatus::RenewalFailed => "renewal_failed",
            CertificateStatus::Revoked => "revoked",
            CertificateStatus::Expired => "expired",
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CertificateStatus::Revoked | CertificateStatus::Expired)
    }

    /// Whether `self -> next` is an edge of the lifecycle state machine.
    pub fn can_transition_to(&self, next: CertificateStatus) -> bool {
        use CertificateStatus::*;
        match (self, next) {
            (Revoked, _) => false,
            (Expired, Revoked) => true,
            (Expired, _) => false,
            (_, Revoked) => true,
            (Active, RenewalPending) => true,
            (RenewalPending, RenewalInFlight) => true,
            (RenewalInFlight, Active) => true,
            (RenewalInFlight, RenewalFailed) => true,
            (RenewalFailed, RenewalPending) => true,
            (Active | RenewalPending | RenewalFailed, Expired) => true,
            _ => false,
        }
    }
}

impl fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable lifecycle state of one certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRecord {
    /// Stable identity, unique key
    pub id: CertificateId,
    /// Start of the validity window
    pub not_before: DateTime<Utc>,
    /// End of the validity window
    pub not_after: DateTime<Utc>,
    /// Current lifecycle status
    pub status: CertificateStatus,
    /// When the last renewal attempt started
    #[serde(default)]
    pub last_renewal_attempt_at: Option<DateTime<Utc>>,
    /// Consecutive failed renewal attempts
    #[serde(default)]
    pub renewal_attempt_count: u32,
    /// Correlation token of the current (or most recent) provider interaction
    #[serde(default)]
    pub provider_ref: Option<ProviderRef>,
    /// Earliest time a failed renewal may be retried
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Reason for the last failure
    #[serde(default)]
    pub last_error: Option<String>,
    /// When the certificate was revoked (drives retention)
    #[serde(default)]
    pub revoked_at: Option<DateTime<Utc>>,
    /// Write counter maintained by the store
    #[serde(default)]
    pub revision: u64,
}

impl CertificateRecord {
    /// Create an `Active` record as produced by enrollment.
    pub fn enrolled(
        id: impl Into<CertificateId>,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
        provider_ref: Option<ProviderRef>,
    ) -> Self {
        Self {
            id: id.into(),
            not_before,
            not_after,
            status: CertificateStatus::Active,
            last_renewal_attempt_at: None,
            renewal_attempt_count: 0,
            provider_ref,
            next_attempt_at: None,
            last_error: None,
            revoked_at: None,
            revision: 0,
        }
    }

    /// Time left until `not_after` (negative once expired).
    pub fn time_to_expiry(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.not_after - now
    }

    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        now > self.not_after
    }

    /// Whether the record's current provider token equals `provider_ref`.
    pub fn matches_provider_ref(&self, provider_ref: &ProviderRef) -> bool {
        self.provider_ref.as_ref() == Some(provider_ref)
    }

    /// Copy of this record moved to `next`, validated against the state machine.
    ///
    /// The revision is left untouched; the store checks it on write.
    pub fn transitioned(&self, next: CertificateStatus) -> Result<Self, LifecycleError> {
        if !self.status.can_transition_to(next) {
            return Err(LifecycleError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        let mut record = self.clone();
        record.status = next;
        Ok(record)
    }
}
