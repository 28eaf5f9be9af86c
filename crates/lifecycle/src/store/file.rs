//! Filesystem-backed certificate store.
//!
//! # Directory Structure
//!
//! ```text
//! storage/
//! ├── records/
//! │   ├── api.example.com.json     # One lifecycle record per certificate
//! │   └── CN%3Dinternal.json       # Identities are escaped into file names
//! └── retired/
//!     └── old.example.com          # Marker for a removed identity
//! ```
//!
//! Writes go to a temporary file that is renamed over the record, so a crash
//! never leaves a half-written record behind.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use autocert_common::CertificateId;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::{check_insertable, check_remove, check_swap, CertificateStore};
use crate::error::StoreError;
use crate::record::{CertificateRecord, CertificateStatus};

/// Persistent store keeping each record as a JSON file.
///
/// A process-local mutex makes each read-compare-write sequence atomic.
/// It is private to the store and never held across an await point.
#[derive(Debug)]
pub struct FileCertificateStore {
    /// Base storage directory
    base_path: PathBuf,
    /// Serializes mutations
    write_lock: Mutex<()>,
}

impl FileCertificateStore {
    /// Open (or create) a store rooted at `base_path`.
    ///
    /// Creates the directory structure if it doesn't exist and sets
    /// restrictive permissions (0700 on Unix).
    pub fn new(base_path: &Path) -> Result<Self, StoreError> {
        let records_path = base_path.join("records");
        let retired_path = base_path.join("retired");
        fs::create_dir_all(&records_path)?;
        fs::create_dir_all(&retired_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o700);
            fs::set_permissions(base_path, perms.clone())?;
            fs::set_permissions(&records_path, perms.clone())?;
            fs::set_permissions(&retired_path, perms)?;
        }

        info!(
            storage_path = %base_path.display(),
            "Initialized certificate record storage"
        );

        Ok(Self {
            base_path: base_path.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    /// Get the storage base path
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn records_path(&self) -> PathBuf {
        self.base_path.join("records")
    }

    fn record_path(&self, id: &CertificateId) -> PathBuf {
        self.records_path()
            .join(format!("{}.json", id.to_file_stem()))
    }

    fn retired_path(&self, id: &CertificateId) -> PathBuf {
        self.base_path.join("retired").join(id.to_file_stem())
    }

    fn read_record(&self, id: &CertificateId) -> Result<CertificateRecord, StoreError> {
        let content = match fs::read_to_string(self.record_path(id)) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                trace!(certificate_id = %id, "No stored record found");
                return Err(StoreError::NotFound(id.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&content)?)
    }

    fn write_record(&self, record: &CertificateRecord) -> Result<(), StoreError> {
        let path = self.record_path(&record.id);
        let tmp_path = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(record)?;
        fs::write(&tmp_path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
        }

        fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}

#[async_trait]
impl CertificateStore for FileCertificateStore {
    async fn get(&self, id: &CertificateId) -> Result<CertificateRecord, StoreError> {
        self.read_record(id)
    }

    async fn list(&self) -> Result<Vec<CertificateRecord>, StoreError> {
        let mut records = Vec::new();
        for entry in fs::read_dir(self.records_path())? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            // Removed since the directory was read
            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match serde_json::from_str::<CertificateRecord>(&content) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "Skipping unreadable certificate record"
                    );
                }
            }
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn compare_and_swap(
        &self,
        id: &CertificateId,
        expected: CertificateStatus,
        mut new_record: CertificateRecord,
    ) -> Result<CertificateRecord, StoreError> {
        let _guard = self.write_lock.lock();

        let current = self.read_record(id)?;
        check_swap(&current, expected, &new_record)?;

        new_record.revision = current.revision + 1;
        self.write_record(&new_record)?;

        trace!(
            certificate_id = %id,
            from = %current.status,
            to = %new_record.status,
            revision = new_record.revision,
            "Swapped certificate record"
        );
        Ok(new_record)
    }

    async fn insert(&self, mut record: CertificateRecord) -> Result<CertificateRecord, StoreError> {
        check_insertable(&record)?;
        let _guard = self.write_lock.lock();

        if self.record_path(&record.id).exists() {
            return Err(StoreError::AlreadyExists(record.id));
        }
        if self.retired_path(&record.id).exists() {
            debug!(certificate_id = %record.id, "Refusing to reuse a removed identity");
            return Err(StoreError::AlreadyExists(record.id));
        }

        record.revision = 0;
        self.write_record(&record)?;

        info!(
            certificate_id = %record.id,
            not_after = %record.not_after,
            "Saved certificate record to storage"
        );
        Ok(record)
    }

    async fn remove(
        &self,
        id: &CertificateId,
        expected: CertificateStatus,
    ) -> Result<CertificateRecord, StoreError> {
        let _guard = self.write_lock.lock();

        let current = self.read_record(id)?;
        check_remove(&current, expected)?;
        fs::write(self.retired_path(id), id.as_str())?;
        fs::remove_file(self.record_path(id))?;

        debug!(certificate_id = %id, "Deleted stored certificate record");
        Ok(current)
    }
}
