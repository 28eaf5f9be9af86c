//! Expiry monitor.
//!
//! Periodically lists every record, classifies it by urgency and emits a
//! renewal request for each `Active` certificate inside its renewal window.
//! The monitor only reads the store; turning requests into state changes is
//! the scheduler's job, which also makes a repeated scan harmless.
//!
//! Emission never waits on the scheduler. When the request queue is full the
//! request is dropped and the next scan emits it again.

use std::sync::Arc;
use std::time::Duration;

use autocert_common::CertificateId;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::{LifecycleError, LifecycleResult, StoreError};
use crate::metrics::LifecycleMetrics;
use crate::record::{CertificateRecord, CertificateStatus};
use crate::store::CertificateStore;

/// Lower bound on the loop interval
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// How close a certificate is to expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    /// Outside the renewal window
    Healthy,
    /// Inside the renewal window
    RenewalDue,
    /// Past `not_after`
    Expired,
}

impl Urgency {
    pub fn classify(
        record: &CertificateRecord,
        now: DateTime<Utc>,
        renewal_window: chrono::Duration,
    ) -> Self {
        if record.is_past_expiry(now) {
            Urgency::Expired
        } else if record.time_to_expiry(now) <= renewal_window {
            Urgency::RenewalDue
        } else {
            Urgency::Healthy
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Healthy => "healthy",
            Urgency::RenewalDue => "renewal_due",
            Urgency::Expired => "expired",
        }
    }
}

/// Request for the scheduler to start renewing a certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalRequest {
    pub id: CertificateId,
    pub not_after: DateTime<Utc>,
}

/// Summary of one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Records examined
    pub scanned: usize,
    /// Renewal requests emitted
    pub requested: usize,
    /// Due certificates not queued because the request queue was full
    pub dropped: usize,
    /// Records inside the renewal window (any status)
    pub due: usize,
    /// Records past `not_after` (any status)
    pub expired: usize,
    /// Record count per status
    pub status_counts: Vec<(CertificateStatus, usize)>,
}

/// Timer-driven scanner that feeds the renewal scheduler.
pub struct ExpiryMonitor {
    store: Arc<dyn CertificateStore>,
    requests: mpsc::Sender<RenewalRequest>,
    renewal_window: chrono::Duration,
    scan_interval: Duration,
    store_timeout: Duration,
    metrics: Option<LifecycleMetrics>,
}

impl ExpiryMonitor {
    pub fn new(
        store: Arc<dyn CertificateStore>,
        requests: mpsc::Sender<RenewalRequest>,
        renewal_window: chrono::Duration,
    ) -> Self {
        Self {
            store,
            requests,
            renewal_window,
            scan_interval: Duration::from_secs(3600),
            store_timeout: Duration::from_secs(autocert_common::DEFAULT_TIMEOUT_SECONDS),
            metrics: None,
        }
    }

    pub fn with_interval(mut self, scan_interval: Duration) -> Self {
        self.scan_interval = scan_interval.max(MIN_INTERVAL);
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: LifecycleMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn renewal_window(&self) -> chrono::Duration {
        self.renewal_window
    }

    /// Scan once using the current time.
    pub async fn scan(&self, cancel: &CancellationToken) -> LifecycleResult<ScanReport> {
        self.scan_at(Utc::now(), cancel).await
    }

    /// Scan once as of `now`.
    ///
    /// Cancellation stops the scan between records; requests already emitted
    /// stay queued.
    pub async fn scan_at(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> LifecycleResult<ScanReport> {
        let records = tokio::time::timeout(self.store_timeout, self.store.list())
            .await
            .map_err(|_| StoreError::Timeout(self.store_timeout))??;

        let mut report = ScanReport {
            scanned: records.len(),
            ..ScanReport::default()
        };

        for record in &records {
            if cancel.is_cancelled() {
                info!(
                    scanned = report.scanned,
                    requested = report.requested,
                    "Expiry scan cancelled"
                );
                return Err(LifecycleError::Cancelled);
            }

            bump(&mut report.status_counts, record.status);

            match Urgency::classify(record, now, self.renewal_window) {
                Urgency::Healthy => {
                    trace!(certificate_id = %record.id, not_after = %record.not_after, "Certificate is still valid");
                    continue;
                }
                Urgency::Expired => report.expired += 1,
                Urgency::RenewalDue => report.due += 1,
            }

            if record.status != CertificateStatus::Active {
                continue;
            }

            let request = RenewalRequest {
                id: record.id.clone(),
                not_after: record.not_after,
            };
            match self.requests.try_send(request) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    report.dropped += 1;
                    debug!(certificate_id = %record.id, "Renewal request queue full, retrying next scan");
                    continue;
                }
                Err(TrySendError::Closed(_)) => {
                    warn!("Renewal request queue closed; stopping scan");
                    return Err(LifecycleError::Cancelled);
                }
            }
            report.requested += 1;
            debug!(
                certificate_id = %record.id,
                time_to_expiry_hours = record.time_to_expiry(now).num_hours(),
                "Certificate needs renewal"
            );
        }

        if let Some(metrics) = &self.metrics {
            metrics.set_status_counts(&report.status_counts);
        }

        info!(
            scanned = report.scanned,
            requested = report.requested,
            dropped = report.dropped,
            expired = report.expired,
            "Expiry scan complete"
        );
        Ok(report)
    }

    /// Scan on the configured interval until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            scan_interval_secs = self.scan_interval.as_secs(),
            renewal_window_days = self.renewal_window.num_days(),
            "Starting expiry monitor"
        );

        let mut ticker = interval(self.scan_interval);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.scan(&cancel).await {
                Ok(_) => {}
                Err(LifecycleError::Cancelled) => break,
                Err(e) => error!(error = %e, "Expiry scan failed"),
            }
        }

        info!("Expiry monitor stopped");
    }
}

impl std::fmt::Debug for ExpiryMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiryMonitor")
            .field("renewal_window", &self.renewal_window)
            .field("scan_interval", &self.scan_interval)
            .finish()
    }
}

fn bump(counts: &mut Vec<(CertificateStatus, usize)>, status: CertificateStatus) {
    match counts.iter_mut().find(|(s, _)| *s == status) {
        Some((_, count)) => *count += 1,
        None => counts.push((status, 1)),
    }
}
