//! Certificate authority seam.
//!
//! The wire protocol (ACME or vendor-specific) lives behind
//! [`CertificateAuthority`]. The engine only needs to submit a renewal for a
//! record and learn whether it completed immediately or will be confirmed
//! later through a webhook.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::record::CertificateRecord;

/// Validity window of a newly issued certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validity {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// Result of submitting a renewal to the certificate authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    /// The authority issued the certificate synchronously.
    Issued(Validity),
    /// The authority accepted the order; the result arrives by webhook.
    Accepted,
}

/// Client for the certificate authority that renews certificates.
///
/// `record.provider_ref` carries the token generated for this attempt. The
/// authority must echo it in any webhook it sends about the attempt.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    async fn submit_renewal(
        &self,
        record: &CertificateRecord,
    ) -> Result<SubmissionOutcome, ProviderError>;
}
