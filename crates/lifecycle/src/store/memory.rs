//! In-memory certificate store.

use async_trait::async_trait;
use autocert_common::CertificateId;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tracing::{debug, trace};

use super::{check_insertable, check_remove, check_swap, CertificateStore};
use crate::error::StoreError;
use crate::record::{CertificateRecord, CertificateStatus};

/// In-memory store backed by a sharded concurrent map.
///
/// Compare-and-swap runs while holding the entry's shard guard, so it is
/// atomic with respect to every other operation on the same identity.
#[derive(Debug, Default)]
pub struct MemoryCertificateStore {
    records: DashMap<CertificateId, CertificateRecord>,
    /// Identities of removed records; never handed out again
    retired: DashSet<CertificateId>,
}

impl MemoryCertificateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl CertificateStore for MemoryCertificateStore {
    async fn get(&self, id: &CertificateId) -> Result<CertificateRecord, StoreError> {
        self.records
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn list(&self) -> Result<Vec<CertificateRecord>, StoreError> {
        let mut records: Vec<CertificateRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn compare_and_swap(
        &self,
        id: &CertificateId,
        expected: CertificateStatus,
        mut new_record: CertificateRecord,
    ) -> Result<CertificateRecord, StoreError> {
        let mut current = self
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        check_swap(current.value(), expected, &new_record)?;

        new_record.revision = current.revision + 1;
        trace!(
            certificate_id = %id,
            from = %current.status,
            to = %new_record.status,
            revision = new_record.revision,
            "Swapped certificate record"
        );
        *current = new_record.clone();
        Ok(new_record)
    }

    async fn insert(&self, mut record: CertificateRecord) -> Result<CertificateRecord, StoreError> {
        check_insertable(&record)?;
        match self.records.entry(record.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(record.id)),
            Entry::Vacant(_) if self.retired.contains(&record.id) => {
                debug!(certificate_id = %record.id, "Refusing to reuse a removed identity");
                Err(StoreError::AlreadyExists(record.id))
            }
            Entry::Vacant(slot) => {
                record.revision = 0;
                debug!(certificate_id = %record.id, "Inserted certificate record");
                slot.insert(record.clone());
                Ok(record)
            }
        }
    }

    async fn remove(
        &self,
        id: &CertificateId,
        expected: CertificateStatus,
    ) -> Result<CertificateRecord, StoreError> {
        match self.records.entry(id.clone()) {
            Entry::Vacant(_) => Err(StoreError::NotFound(id.clone())),
            Entry::Occupied(slot) => {
                check_remove(slot.get(), expected)?;
                self.retired.insert(id.clone());
                debug!(certificate_id = %id, "Removed certificate record");
                Ok(slot.remove())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use std::sync::Arc;

    fn record(id: &str) -> CertificateRecord {
        let now = Utc::now();
        CertificateRecord::enrolled(id, now, now + Duration::days(90), None)
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = MemoryCertificateStore::new();
        store.insert(record("a.com")).await.unwrap();

        let loaded = store.get(&"a.com".into()).await.unwrap();
        assert_eq!(loaded.status, CertificateStatus::Active);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = MemoryCertificateStore::new();
        let err = store.get(&"missing.com".into()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_insert_duplicate_rejected() {
        let store = MemoryCertificateStore::new();
        store.insert(record("a.com")).await.unwrap();
        let err = store.insert(record("a.com")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_insert_rejects_inverted_validity() {
        let store = MemoryCertificateStore::new();
        let mut r = record("a.com");
        r.not_after = r.not_before;
        assert!(matches!(
            store.insert(r).await.unwrap_err(),
            StoreError::InvalidRecord(_)
        ));
    }

    #[tokio::test]
    async fn test_list_sorted() {
        let store = MemoryCertificateStore::new();
        store.insert(record("b.com")).await.unwrap();
        store.insert(record("a.com")).await.unwrap();

        let ids: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id.to_string())
            .collect();
        assert_eq!(ids, vec!["a.com", "b.com"]);
    }

    #[tokio::test]
    async fn test_cas_success_bumps_revision() {
        let store = MemoryCertificateStore::new();
        let stored = store.insert(record("a.com")).await.unwrap();

        let next = stored.transitioned(CertificateStatus::RenewalPending).unwrap();
        let swapped = store
            .compare_and_swap(&stored.id, CertificateStatus::Active, next)
            .await
            .unwrap();

        assert_eq!(swapped.revision, 1);
        assert_eq!(
            store.get(&stored.id).await.unwrap().status,
            CertificateStatus::RenewalPending
        );
    }

    #[tokio::test]
    async fn test_cas_status_mismatch_conflicts() {
        let store = MemoryCertificateStore::new();
        let stored = store.insert(record("a.com")).await.unwrap();

        let next = stored.transitioned(CertificateStatus::RenewalPending).unwrap();
        let err = store
            .compare_and_swap(&stored.id, CertificateStatus::RenewalFailed, next)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_cas_stale_revision_conflicts() {
        let store = MemoryCertificateStore::new();
        let stored = store.insert(record("a.com")).await.unwrap();

        // First writer wins
        let next = stored.transitioned(CertificateStatus::RenewalPending).unwrap();
        store
            .compare_and_swap(&stored.id, CertificateStatus::Active, next.clone())
            .await
            .unwrap();

        // Same expected status would not match anyway, but a re-entered status
        // with an old revision must also lose
        let mut reentered = store.get(&stored.id).await.unwrap();
        reentered.status = CertificateStatus::Active;
        reentered.revision = 0;
        let err = store
            .compare_and_swap(&stored.id, CertificateStatus::RenewalPending, reentered)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_concurrent_cas_single_winner() {
        let store = Arc::new(MemoryCertificateStore::new());
        let stored = store.insert(record("a.com")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            let stored = stored.clone();
            handles.push(tokio::spawn(async move {
                let next = stored.transitioned(CertificateStatus::RenewalPending).unwrap();
                store
                    .compare_and_swap(&stored.id, CertificateStatus::Active, next)
                    .await
                    .is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_remove_guarded_by_status() {
        let store = MemoryCertificateStore::new();
        let stored = store.insert(record("a.com")).await.unwrap();

        let err = store
            .remove(&stored.id, CertificateStatus::Revoked)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        store
            .remove(&stored.id, CertificateStatus::Active)
            .await
            .unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_removed_identity_is_not_reused() {
        let store = MemoryCertificateStore::new();
        let mut revoked = record("a.com");
        revoked.status = CertificateStatus::Revoked;
        let stored = store.insert(revoked).await.unwrap();
        store
            .remove(&stored.id, CertificateStatus::Revoked)
            .await
            .unwrap();

        let err = store.insert(record("a.com")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
        assert!(store.is_empty());
    }
}
