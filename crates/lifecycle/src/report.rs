//! Operator-facing reporting of terminal lifecycle events.
//!
//! Transient failures stay inside the engine (logged and retried). Events
//! that halt automation for a certificate are pushed to a
//! [`LifecycleReporter`] so they reach a human.

use tracing::{error, warn};

use crate::record::CertificateRecord;

/// Why automation stopped for a certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Escalation {
    /// Automatic retries are exhausted.
    MaxAttemptsExceeded { attempts: u32, last_error: Option<String> },
    /// The provider revoked the certificate.
    Revoked,
    /// The certificate expired before it could be renewed.
    Expired,
}

/// Sink for terminal lifecycle events.
pub trait LifecycleReporter: Send + Sync {
    fn escalate(&self, record: &CertificateRecord, escalation: &Escalation);
}

/// Reporter that writes escalations to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl LifecycleReporter for TracingReporter {
    fn escalate(&self, record: &CertificateRecord, escalation: &Escalation) {
        match escalation {
            Escalation::MaxAttemptsExceeded { attempts, last_error } => {
                error!(
                    certificate_id = %record.id,
                    attempts = attempts,
                    last_error = ?last_error,
                    not_after = %record.not_after,
                    "Certificate renewal failed permanently; manual intervention required"
                );
            }
            Escalation::Revoked => {
                warn!(
                    certificate_id = %record.id,
                    provider_ref = ?record.provider_ref,
                    "Certificate revoked by provider"
                );
            }
            Escalation::Expired => {
                error!(
                    certificate_id = %record.id,
                    not_after = %record.not_after,
                    "Certificate expired before renewal completed"
                );
            }
        }
    }
}
