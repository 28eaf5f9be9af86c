//! Certificate store implementations.
//!
//! The store is the only shared mutable resource of the engine. All
//! lifecycle transitions go through [`CertificateStore::compare_and_swap`],
//! which serializes writes per identity without any in-process lock held
//! across components.

mod file;
mod memory;

pub use file::FileCertificateStore;
pub use memory::MemoryCertificateStore;

use async_trait::async_trait;
use autocert_common::CertificateId;

use crate::error::StoreError;
use crate::record::{CertificateRecord, CertificateStatus};

/// Durable mapping from certificate identity to lifecycle record.
#[async_trait]
pub trait CertificateStore: Send + Sync {
    /// Fetch one record.
    async fn get(&self, id: &CertificateId) -> Result<CertificateRecord, StoreError>;

    /// Snapshot of all records, ordered by identity.
    async fn list(&self) -> Result<Vec<CertificateRecord>, StoreError>;

    /// Atomically replace a record if it has not changed since it was read.
    ///
    /// Succeeds only when the stored status equals `expected` and the stored
    /// revision equals `new_record.revision`. On success the stored copy
    /// (with its revision incremented) is returned.
    async fn compare_and_swap(
        &self,
        id: &CertificateId,
        expected: CertificateStatus,
        new_record: CertificateRecord,
    ) -> Result<CertificateRecord, StoreError>;

    /// Create a record for a newly enrolled certificate.
    async fn insert(&self, record: CertificateRecord) -> Result<CertificateRecord, StoreError>;

    /// Remove a record, guarded by its expected status.
    async fn remove(
        &self,
        id: &CertificateId,
        expected: CertificateStatus,
    ) -> Result<CertificateRecord, StoreError>;
}

/// Check the compare-and-swap preconditions against the stored record.
pub(crate) fn check_swap(
    current: &CertificateRecord,
    expected: CertificateStatus,
    new_record: &CertificateRecord,
) -> Result<(), StoreError> {
    if new_record.id != current.id {
        return Err(StoreError::InvalidRecord(format!(
            "identity mismatch: {} cannot replace {}",
            new_record.id, current.id
        )));
    }
    if current.status != expected || current.revision != new_record.revision {
        return Err(StoreError::Conflict {
            id: current.id.clone(),
            expected,
            actual: current.status,
            expected_revision: new_record.revision,
            actual_revision: current.revision,
        });
    }
    Ok(())
}

/// Check the guard for removal.
pub(crate) fn check_remove(
    current: &CertificateRecord,
    expected: CertificateStatus,
) -> Result<(), StoreError> {
    if current.status != expected {
        return Err(StoreError::Conflict {
            id: current.id.clone(),
            expected,
            actual: current.status,
            expected_revision: current.revision,
            actual_revision: current.revision,
        });
    }
    Ok(())
}

pub(crate) fn check_insertable(record: &CertificateRecord) -> Result<(), StoreError> {
    if record.id.as_str().is_empty() {
        return Err(StoreError::InvalidRecord("empty certificate id".to_string()));
    }
    if record.not_after <= record.not_before {
        return Err(StoreError::InvalidRecord(format!(
            "{}: not_after {} is not after not_before {}",
            record.id, record.not_after, record.not_before
        )));
    }
    Ok(())
}
