//! Certificate lifecycle service.
//!
//! Wires the store, transition authority, expiry monitor, renewal scheduler
//! and webhook reconciler together from a [`LifecycleConfig`] and exposes the
//! externally visible operations:
//!
//! - [`monitor_certificates`](CertificateLifecycleService::monitor_certificates)
//! - [`renew_certificates`](CertificateLifecycleService::renew_certificates)
//! - [`process_webhook`](CertificateLifecycleService::process_webhook)
//!
//! plus the operator surface (status, reset, purge) and the daemon loop.

use std::sync::Arc;
use std::time::Duration;

use autocert_common::CertificateId;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{LifecycleConfig, StoreConfig};
use crate::error::{LifecycleError, LifecycleResult};
use crate::metrics::LifecycleMetrics;
use crate::monitor::{ExpiryMonitor, ScanReport, Urgency};
use crate::provider::CertificateAuthority;
use crate::record::{CertificateRecord, CertificateStatus};
use crate::report::{LifecycleReporter, TracingReporter};
use crate::scheduler::{RenewalReport, RenewalScheduler};
use crate::store::{CertificateStore, FileCertificateStore, MemoryCertificateStore};
use crate::transition::LifecycleTransitions;
use crate::webhook::{JsonWebhookDecoder, WebhookDecoder, WebhookEvent, WebhookOutcome, WebhookReconciler};

/// Open the store backend named by the configuration.
pub fn open_store(config: &StoreConfig) -> LifecycleResult<Arc<dyn CertificateStore>> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(MemoryCertificateStore::new())),
        StoreConfig::File { path } => Ok(Arc::new(FileCertificateStore::new(path)?)),
    }
}

/// One row of a [`StatusSummary`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub id: CertificateId,
    pub status: CertificateStatus,
    pub not_after: DateTime<Utc>,
    pub urgency: Urgency,
    pub renewal_attempt_count: u32,
    /// Automatic retries are exhausted
    pub exhausted: bool,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl StatusEntry {
    /// Why automation is halted for this certificate, if it is.
    pub fn halted(&self) -> Option<LifecycleError> {
        match self.status {
            CertificateStatus::Revoked => Some(LifecycleError::Revoked(self.id.clone())),
            CertificateStatus::RenewalFailed if self.exhausted => {
                Some(LifecycleError::MaxAttemptsExceeded {
                    id: self.id.clone(),
                    attempts: self.renewal_attempt_count,
                })
            }
            _ => None,
        }
    }
}

/// Point-in-time view of every managed certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSummary {
    pub counts: Vec<(CertificateStatus, usize)>,
    pub entries: Vec<StatusEntry>,
}

impl StatusSummary {
    pub fn count(&self, status: CertificateStatus) -> usize {
        self.counts
            .iter()
            .find(|(s, _)| *s == status)
            .map(|(_, c)| *c)
            .unwrap_or(0)
    }
}

/// Builder for [`CertificateLifecycleService`].
pub struct LifecycleServiceBuilder {
    config: LifecycleConfig,
    store: Option<Arc<dyn CertificateStore>>,
    reporter: Arc<dyn LifecycleReporter>,
    metrics: Option<LifecycleMetrics>,
    decoder: Arc<dyn WebhookDecoder>,
}

impl LifecycleServiceBuilder {
    /// Use an already opened store instead of the configured backend.
    pub fn store(mut self, store: Arc<dyn CertificateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn LifecycleReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn metrics(mut self, metrics: LifecycleMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn decoder(mut self, decoder: Arc<dyn WebhookDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    /// Validate the configuration and assemble the components.
    pub fn build(
        self,
        authority: Arc<dyn CertificateAuthority>,
    ) -> LifecycleResult<CertificateLifecycleService> {
        let config = self.config;
        config.check()?;

        let store = match self.store {
            Some(store) => store,
            None => open_store(&config.store)?,
        };
        let timeouts = config.timeouts.policy();

        let mut transitions = LifecycleTransitions::new(store.clone())
            .with_backoff(config.backoff.clone())
            .with_max_attempts(config.scheduler.max_attempts)
            .with_timeouts(timeouts)
            .with_conflict_retries(config.scheduler.conflict_retries)
            .with_reporter(self.reporter);
        if let Some(metrics) = &self.metrics {
            transitions = transitions.with_metrics(metrics.clone());
        }
        let transitions = Arc::new(transitions);

        let renewal_window = config.monitor.renewal_window();
        let (tx, rx) = mpsc::channel(config.scheduler.request_queue_capacity);

        let mut monitor = ExpiryMonitor::new(store, tx, renewal_window)
            .with_interval(config.monitor.scan_interval())
            .with_store_timeout(timeouts.store_operation);
        if let Some(metrics) = self.metrics {
            monitor = monitor.with_metrics(metrics);
        }

        let scheduler = RenewalScheduler::new(transitions.clone(), authority, renewal_window)
            .with_max_concurrent(config.scheduler.max_concurrent_renewals)
            .with_interval(config.scheduler.pass_interval())
            .with_requests(rx);

        info!(
            renewal_window_days = config.monitor.renewal_window_days,
            max_concurrent = config.scheduler.max_concurrent_renewals,
            max_attempts = config.scheduler.max_attempts,
            renewal_timeout_secs = timeouts.renewal_attempt.as_secs(),
            "Certificate lifecycle service configured"
        );

        Ok(CertificateLifecycleService {
            reconciler: WebhookReconciler::new(transitions.clone()),
            transitions,
            monitor,
            scheduler,
            decoder: self.decoder,
            retention: config.retention.revoked_retention(),
            purge_interval: config.monitor.scan_interval(),
        })
    }
}

/// The certificate lifecycle engine behind a single handle.
pub struct CertificateLifecycleService {
    transitions: Arc<LifecycleTransitions>,
    monitor: ExpiryMonitor,
    scheduler: RenewalScheduler,
    reconciler: WebhookReconciler,
    decoder: Arc<dyn WebhookDecoder>,
    retention: chrono::Duration,
    purge_interval: Duration,
}

impl CertificateLifecycleService {
    pub fn builder(config: LifecycleConfig) -> LifecycleServiceBuilder {
        LifecycleServiceBuilder {
            config,
            store: None,
            reporter: Arc::new(TracingReporter),
            metrics: None,
            decoder: Arc::new(JsonWebhookDecoder),
        }
    }

    pub fn transitions(&self) -> &Arc<LifecycleTransitions> {
        &self.transitions
    }

    pub fn monitor(&self) -> &ExpiryMonitor {
        &self.monitor
    }

    pub fn scheduler(&self) -> &RenewalScheduler {
        &self.scheduler
    }

    pub fn reconciler(&self) -> &WebhookReconciler {
        &self.reconciler
    }

    // =========================================================================
    // Lifecycle operations
    // =========================================================================

    /// Scan for certificates inside their renewal window.
    pub async fn monitor_certificates(&self, cancel: &CancellationToken) -> LifecycleResult<ScanReport> {
        self.monitor.scan(cancel).await
    }

    /// Run one renewal pass over queued and due certificates.
    pub async fn renew_certificates(&self, cancel: &CancellationToken) -> LifecycleResult<RenewalReport> {
        self.scheduler.run_pass(cancel).await
    }

    /// Decode and reconcile a provider webhook payload.
    pub async fn process_webhook(
        &self,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> LifecycleResult<WebhookOutcome> {
        let event = self.decoder.decode(payload)?;
        self.process_event(event, cancel).await
    }

    /// Reconcile an already decoded provider event.
    pub async fn process_event(
        &self,
        event: WebhookEvent,
        cancel: &CancellationToken,
    ) -> LifecycleResult<WebhookOutcome> {
        self.reconciler.reconcile(event, cancel).await
    }

    // =========================================================================
    // Operator surface
    // =========================================================================

    /// Register a certificate issued by the enrollment flow.
    pub async fn enroll(&self, record: CertificateRecord) -> LifecycleResult<CertificateRecord> {
        let id = record.id.clone();
        let stored = self.transitions.timed(self.transitions.store().insert(record)).await?;
        info!(certificate_id = %id, not_after = %stored.not_after, "Certificate enrolled");
        Ok(stored)
    }

    /// Clear the attempt count of a failed certificate and queue it again.
    pub async fn reset_attempts(&self, id: &CertificateId) -> LifecycleResult<CertificateRecord> {
        self.transitions.reset_attempts(id).await
    }

    /// Remove revoked records older than the retention period.
    pub async fn purge_revoked(&self) -> LifecycleResult<usize> {
        self.purge_revoked_at(Utc::now()).await
    }

    pub async fn purge_revoked_at(&self, now: DateTime<Utc>) -> LifecycleResult<usize> {
        let mut purged = 0;
        for record in self.transitions.list().await? {
            if self
                .transitions
                .purge_revoked(&record, self.retention, now)
                .await?
            {
                purged += 1;
            }
        }
        if purged > 0 {
            info!(purged = purged, "Purged revoked certificate records");
        }
        Ok(purged)
    }

    pub async fn status_summary(&self) -> LifecycleResult<StatusSummary> {
        self.status_summary_at(Utc::now()).await
    }

    pub async fn status_summary_at(&self, now: DateTime<Utc>) -> LifecycleResult<StatusSummary> {
        let window = self.monitor.renewal_window();
        let mut summary = StatusSummary::default();
        for record in self.transitions.list().await? {
            match summary.counts.iter_mut().find(|(s, _)| *s == record.status) {
                Some((_, count)) => *count += 1,
                None => summary.counts.push((record.status, 1)),
            }
            summary.entries.push(StatusEntry {
                urgency: Urgency::classify(&record, now, window),
                exhausted: self.transitions.is_exhausted(&record),
                id: record.id,
                status: record.status,
                not_after: record.not_after,
                renewal_attempt_count: record.renewal_attempt_count,
                next_attempt_at: record.next_attempt_at,
                last_error: record.last_error,
            });
        }
        Ok(summary)
    }

    // =========================================================================
    // Daemon
    // =========================================================================

    /// Run the monitor, scheduler and retention purge until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Certificate lifecycle service starting");

        let retention = async {
            let mut ticker = interval(self.purge_interval);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = self.purge_revoked().await {
                    error!(error = %e, "Retention purge failed");
                }
            }
        };

        tokio::join!(
            self.monitor.run(cancel.clone()),
            self.scheduler.run(cancel.clone()),
            retention,
        );

        info!("Certificate lifecycle service stopped");
    }
}

impl std::fmt::Debug for CertificateLifecycleService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateLifecycleService")
            .field("transitions", &self.transitions)
            .field("monitor", &self.monitor)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ProviderError, StoreError};
    use crate::provider::SubmissionOutcome;
    use async_trait::async_trait;
    use autocert_common::ProviderRef;
    use chrono::Duration as ChronoDuration;

    struct AcceptingAuthority;

    #[async_trait]
    impl CertificateAuthority for AcceptingAuthority {
        async fn submit_renewal(
            &self,
            _record: &CertificateRecord,
        ) -> Result<SubmissionOutcome, ProviderError> {
            Ok(SubmissionOutcome::Accepted)
        }
    }

    fn memory_config() -> LifecycleConfig {
        let mut config = LifecycleConfig::default();
        config.store = StoreConfig::Memory;
        config.monitor.renewal_window_days = 7;
        config
    }

    fn service() -> CertificateLifecycleService {
        CertificateLifecycleService::builder(memory_config())
            .build(Arc::new(AcceptingAuthority))
            .unwrap()
    }

    fn record(id: &str, days_left: i64) -> CertificateRecord {
        let now = Utc::now();
        CertificateRecord::enrolled(
            id,
            now - ChronoDuration::days(80),
            now + ChronoDuration::days(days_left),
            None,
        )
    }

    #[tokio::test]
    async fn test_monitor_then_renew_then_webhook() {
        let service = service();
        service.enroll(record("a.com", 5)).await.unwrap();
        let cancel = CancellationToken::new();

        let scan = service.monitor_certificates(&cancel).await.unwrap();
        assert_eq!(scan.requested, 1);

        let pass = service.renew_certificates(&cancel).await.unwrap();
        assert_eq!(pass.requested, 1);
        assert_eq!(pass.awaiting_webhook, 1);

        let record = service.transitions().get(&"a.com".into()).await.unwrap();
        let provider_ref = record.provider_ref.unwrap();
        let payload = serde_json::json!({
            "provider_ref": provider_ref.as_str(),
            "event_type": "issued",
            "not_before": Utc::now(),
            "not_after": Utc::now() + ChronoDuration::days(90),
        });
        let outcome = service
            .process_webhook(payload.to_string().as_bytes(), &cancel)
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Applied(_)));

        let record = service.transitions().get(&"a.com".into()).await.unwrap();
        assert_eq!(record.status, CertificateStatus::Active);
    }

    #[tokio::test]
    async fn test_invalid_payload_is_rejected() {
        let service = service();
        let err = service
            .process_webhook(b"{}", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidWebhook(_)));
    }

    #[tokio::test]
    async fn test_enroll_duplicate_fails() {
        let service = service();
        service.enroll(record("a.com", 60)).await.unwrap();
        assert!(service.enroll(record("a.com", 60)).await.is_err());
    }

    #[tokio::test]
    async fn test_status_summary() {
        let service = service();
        service.enroll(record("a.com", 60)).await.unwrap();
        service.enroll(record("b.com", 3)).await.unwrap();

        let summary = service.status_summary().await.unwrap();
        assert_eq!(summary.count(CertificateStatus::Active), 2);
        assert_eq!(summary.entries.len(), 2);
        assert_eq!(summary.entries[0].urgency, Urgency::Healthy);
        assert_eq!(summary.entries[1].urgency, Urgency::RenewalDue);
    }

    #[tokio::test]
    async fn test_purge_only_old_revocations() {
        let service = service();
        let mut enrolled = record("a.com", 60);
        enrolled.provider_ref = Some(ProviderRef::from("r-1"));
        service.enroll(enrolled).await.unwrap();
        service.enroll(record("b.com", 60)).await.unwrap();

        let outcome = service
            .process_event(
                WebhookEvent {
                    provider_ref: ProviderRef::from("r-1"),
                    kind: crate::webhook::WebhookEventKind::Revoked,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Applied(_)));

        assert_eq!(service.purge_revoked().await.unwrap(), 0);
        let later = Utc::now() + ChronoDuration::days(31);
        assert_eq!(service.purge_revoked_at(later).await.unwrap(), 1);
        assert_eq!(service.status_summary().await.unwrap().entries.len(), 1);

        // A purged identity is never enrolled again
        assert!(matches!(
            service.enroll(record("a.com", 60)).await,
            Err(LifecycleError::Store(StoreError::AlreadyExists(_)))
        ));
    }

    #[tokio::test]
    async fn test_status_reports_halted_certificates() {
        struct RejectingAuthority;

        #[async_trait]
        impl CertificateAuthority for RejectingAuthority {
            async fn submit_renewal(
                &self,
                _record: &CertificateRecord,
            ) -> Result<SubmissionOutcome, ProviderError> {
                Err(ProviderError::Rejected("invalid CSR".into()))
            }
        }

        let mut config = memory_config();
        config.scheduler.max_attempts = 1;
        let service = CertificateLifecycleService::builder(config)
            .build(Arc::new(RejectingAuthority))
            .unwrap();
        service.enroll(record("a.com", 5)).await.unwrap();
        service.enroll(record("b.com", 60)).await.unwrap();
        let cancel = CancellationToken::new();

        service.monitor_certificates(&cancel).await.unwrap();
        let pass = service.renew_certificates(&cancel).await.unwrap();
        assert_eq!(pass.exhausted, 1);

        let summary = service.status_summary().await.unwrap();
        assert!(matches!(
            summary.entries[0].halted(),
            Some(LifecycleError::MaxAttemptsExceeded { attempts: 1, .. })
        ));
        assert!(summary.entries[1].halted().is_none());
    }

    #[tokio::test]
    async fn test_invalid_config_fails_build() {
        let mut config = memory_config();
        config.timeouts.liveness_threshold_secs = Some(10);
        let result = CertificateLifecycleService::builder(config).build(Arc::new(AcceptingAuthority));
        assert!(matches!(result, Err(LifecycleError::Config(_))));
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let service = service();
        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), service.run(cancel))
            .await
            .unwrap();
    }
}
