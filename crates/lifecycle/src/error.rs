//! Error types for the certificate lifecycle engine.

use std::time::Duration;

use autocert_common::{CertificateId, ProviderRef};
use thiserror::Error;

use crate::record::CertificateStatus;

/// Result type for lifecycle operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Errors returned by a [`CertificateStore`](crate::store::CertificateStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record exists for the identity.
    #[error("certificate not found: {0}")]
    NotFound(CertificateId),

    /// Compare-and-swap lost: the stored record changed since it was read.
    #[error("conflict on {id}: expected {expected} (revision {expected_revision}), found {actual} (revision {actual_revision})")]
    Conflict {
        id: CertificateId,
        expected: CertificateStatus,
        actual: CertificateStatus,
        expected_revision: u64,
        actual_revision: u64,
    },

    /// Enrollment attempted to create a record for an identity already in use.
    #[error("certificate already exists: {0}")]
    AlreadyExists(CertificateId),

    /// The record itself is unusable (e.g. empty identity).
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// Store call exceeded the store operation timeout.
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    /// Filesystem error in a persistent store.
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be encoded or decoded.
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether the error is a lost compare-and-swap race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Errors reported by a [`CertificateAuthority`](crate::provider::CertificateAuthority).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The attempt exceeded the renewal timeout.
    #[error("provider timed out after {0:?}")]
    Timeout(Duration),

    /// The authority declined the renewal.
    #[error("provider rejected renewal: {0}")]
    Rejected(String),

    /// The authority could not be reached or failed transiently.
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by the lifecycle engine.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Unknown certificate identity.
    #[error("certificate not found: {0}")]
    NotFound(CertificateId),

    /// Store failure other than a resolvable conflict.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Certificate authority failure.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Automatic retries are exhausted; an operator must intervene.
    #[error("renewal of {id} failed {attempts} times; automatic retries halted")]
    MaxAttemptsExceeded { id: CertificateId, attempts: u32 },

    /// The certificate has been revoked.
    #[error("certificate revoked: {0}")]
    Revoked(CertificateId),

    /// Concurrent writers kept winning the compare-and-swap race.
    #[error("certificate {0} is being modified concurrently; retry later")]
    Contended(CertificateId),

    /// The requested status change is not part of the lifecycle state machine.
    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: CertificateId,
        from: CertificateStatus,
        to: CertificateStatus,
    },

    /// A webhook payload could not be decoded.
    #[error("invalid webhook payload: {0}")]
    InvalidWebhook(String),

    /// A webhook referenced a provider token with no live attempt.
    #[error("stale webhook for provider reference {0}")]
    StaleWebhook(ProviderRef),

    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// The operation was cancelled before completion.
    #[error("operation cancelled")]
    Cancelled,
}

impl From<validator::ValidationErrors> for LifecycleError {
    fn from(err: validator::ValidationErrors) -> Self {
        LifecycleError::Config(err.to_string())
    }
}
