//! Background renewal scheduler
//!
//! Turns renewal requests into provider attempts. Each pass:
//!
//! 1. drains queued requests from the expiry monitor (`Active -> RenewalPending`)
//! 2. expires records past `not_after`
//! 3. runs the liveness sweep over attempts stuck in flight
//! 4. re-queues failed records whose backoff has elapsed
//! 5. admits pending records, earliest expiry first, while fewer than
//!    `max_concurrent` records are `RenewalInFlight` in the store
//!
//! Admission goes through `RenewalPending -> RenewalInFlight` on the store's
//! compare-and-swap, so any number of schedulers can share a store and at most
//! one of them starts an attempt for a given certificate.
//!
//! The in-flight count is taken from the store, not from local permits. An
//! attempt accepted by the provider keeps its slot until the webhook (or the
//! liveness sweep) settles it.

use std::sync::Arc;
use std::time::Duration;

use autocert_common::CertificateId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{LifecycleError, LifecycleResult, ProviderError};
use crate::monitor::RenewalRequest;
use crate::provider::{CertificateAuthority, SubmissionOutcome};
use crate::record::CertificateStatus;
use crate::transition::{LifecycleTransitions, Transition};

/// Default number of simultaneous provider attempts
const DEFAULT_MAX_CONCURRENT: usize = 4;

/// Default time between passes
const DEFAULT_PASS_INTERVAL: Duration = Duration::from_secs(60);

/// Lower bound on the loop interval
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// How a single renewal attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The provider issued synchronously and the record is `Active` again
    Succeeded,
    /// The provider accepted the order; a webhook will settle it
    AwaitingWebhook,
    /// The attempt failed and a retry is scheduled
    Failed,
    /// The attempt failed and automatic retries are exhausted
    Exhausted,
    /// Another worker or event got there first
    Skipped,
    /// Cancelled while waiting; the record is left for the liveness sweep
    Cancelled,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Succeeded => "succeeded",
            AttemptOutcome::AwaitingWebhook => "awaiting_webhook",
            AttemptOutcome::Failed => "failed",
            AttemptOutcome::Exhausted => "exhausted",
            AttemptOutcome::Skipped => "skipped",
            AttemptOutcome::Cancelled => "cancelled",
        }
    }
}

/// Summary of one scheduler pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenewalReport {
    /// Queued requests moved to `RenewalPending`
    pub requested: usize,
    /// Records moved to `Expired`
    pub expired: usize,
    /// Stalled attempts failed by the liveness sweep
    pub reclaimed: usize,
    /// Failed records re-queued after backoff
    pub requeued: usize,
    /// Pending records left queued because the in-flight limit was reached
    pub deferred: usize,
    /// Attempts submitted to the provider
    pub started: usize,
    pub succeeded: usize,
    pub awaiting_webhook: usize,
    pub failed: usize,
    pub exhausted: usize,
    pub skipped: usize,
    pub cancelled: usize,
    /// Records whose processing hit a store error
    pub errors: usize,
}

impl RenewalReport {
    fn record(&mut self, outcome: AttemptOutcome) {
        match outcome {
            AttemptOutcome::Succeeded => self.succeeded += 1,
            AttemptOutcome::AwaitingWebhook => self.awaiting_webhook += 1,
            AttemptOutcome::Failed => self.failed += 1,
            AttemptOutcome::Exhausted => self.exhausted += 1,
            AttemptOutcome::Skipped => self.skipped += 1,
            AttemptOutcome::Cancelled => self.cancelled += 1,
        }
        if !matches!(outcome, AttemptOutcome::Skipped | AttemptOutcome::Cancelled) {
            self.started += 1;
        }
    }
}

/// Shared state handed to every attempt task.
#[derive(Clone)]
struct Worker {
    transitions: Arc<LifecycleTransitions>,
    authority: Arc<dyn CertificateAuthority>,
    slots: Arc<Semaphore>,
}

impl Worker {
    async fn attempt(
        self,
        id: CertificateId,
        now: DateTime<Utc>,
        cancel: CancellationToken,
    ) -> LifecycleResult<AttemptOutcome> {
        let transitions = self.transitions.clone();
        let outcome = self.run_attempt(id, now, cancel).await?;
        if let Some(metrics) = transitions.metrics() {
            metrics.record_renewal(outcome.as_str());
        }
        Ok(outcome)
    }

    async fn run_attempt(
        self,
        id: CertificateId,
        now: DateTime<Utc>,
        cancel: CancellationToken,
    ) -> LifecycleResult<AttemptOutcome> {
        let started = Instant::now();

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(AttemptOutcome::Cancelled),
            permit = self.slots.clone().acquire_owned() => {
                permit.map_err(|_| LifecycleError::Cancelled)?
            }
        };

        let record = match self.transitions.begin_attempt(&id, advanced(now, started)).await? {
            Transition::Applied(record) => record,
            Transition::Unchanged(_) | Transition::Contended => {
                debug!(certificate_id = %id, "Renewal already claimed elsewhere");
                return Ok(AttemptOutcome::Skipped);
            }
        };
        let Some(provider_ref) = record.provider_ref.clone() else {
            return Ok(AttemptOutcome::Skipped);
        };

        info!(
            certificate_id = %id,
            provider_ref = %provider_ref,
            attempt = record.renewal_attempt_count + 1,
            "Submitting certificate renewal"
        );

        let limit = self.transitions.timeouts().renewal_attempt;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(
                    certificate_id = %id,
                    provider_ref = %provider_ref,
                    "Renewal attempt abandoned on shutdown"
                );
                return Ok(AttemptOutcome::Cancelled);
            }
            result = tokio::time::timeout(limit, self.authority.submit_renewal(&record)) => {
                result.unwrap_or_else(|_| Err(ProviderError::Timeout(limit)))
            }
        };

        let outcome = match result {
            Ok(SubmissionOutcome::Issued(validity)) => {
                match self
                    .transitions
                    .complete_renewal(&id, &provider_ref, validity)
                    .await?
                {
                    Transition::Applied(_) => AttemptOutcome::Succeeded,
                    _ => AttemptOutcome::Skipped,
                }
            }
            Ok(SubmissionOutcome::Accepted) => {
                debug!(
                    certificate_id = %id,
                    provider_ref = %provider_ref,
                    "Renewal accepted, awaiting provider webhook"
                );
                AttemptOutcome::AwaitingWebhook
            }
            Err(e) => {
                match self
                    .transitions
                    .fail_renewal(&id, &provider_ref, &e.to_string(), advanced(now, started))
                    .await?
                {
                    Transition::Applied(record) if self.transitions.is_exhausted(&record) => {
                        AttemptOutcome::Exhausted
                    }
                    Transition::Applied(_) => AttemptOutcome::Failed,
                    _ => AttemptOutcome::Skipped,
                }
            }
        };

        Ok(outcome)
    }
}

/// Background renewal scheduler.
pub struct RenewalScheduler {
    worker: Worker,
    requests: Option<Mutex<mpsc::Receiver<RenewalRequest>>>,
    max_concurrent: usize,
    renewal_window: chrono::Duration,
    pass_interval: Duration,
}

impl RenewalScheduler {
    /// Create a scheduler with its own worker pool.
    pub fn new(
        transitions: Arc<LifecycleTransitions>,
        authority: Arc<dyn CertificateAuthority>,
        renewal_window: chrono::Duration,
    ) -> Self {
        Self {
            worker: Worker {
                transitions,
                authority,
                slots: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT)),
            },
            requests: None,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            renewal_window,
            pass_interval: DEFAULT_PASS_INTERVAL,
        }
    }

    /// Cap the number of records `RenewalInFlight` at once.
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self.worker.slots = Arc::new(Semaphore::new(self.max_concurrent));
        self
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Consume renewal requests from an expiry monitor.
    pub fn with_requests(mut self, requests: mpsc::Receiver<RenewalRequest>) -> Self {
        self.requests = Some(Mutex::new(requests));
        self
    }

    pub fn with_interval(mut self, pass_interval: Duration) -> Self {
        self.pass_interval = pass_interval.max(MIN_INTERVAL);
        self
    }

    pub fn transitions(&self) -> &Arc<LifecycleTransitions> {
        &self.worker.transitions
    }

    /// Run one pass using the current time.
    pub async fn run_pass(&self, cancel: &CancellationToken) -> LifecycleResult<RenewalReport> {
        self.run_pass_at(Utc::now(), cancel).await
    }

    /// Run one pass as of `now`.
    pub async fn run_pass_at(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> LifecycleResult<RenewalReport> {
        if cancel.is_cancelled() {
            return Err(LifecycleError::Cancelled);
        }

        let transitions = &self.worker.transitions;
        let mut report = RenewalReport::default();

        for request in self.drain_requests() {
            match transitions
                .request_renewal(&request.id, self.renewal_window, now)
                .await
            {
                Ok(Transition::Applied(record)) if record.status == CertificateStatus::Expired => {
                    report.expired += 1
                }
                Ok(Transition::Applied(_)) => report.requested += 1,
                Ok(_) => {}
                Err(LifecycleError::NotFound(id)) => {
                    debug!(certificate_id = %id, "Renewal requested for removed certificate")
                }
                Err(e) => {
                    report.errors += 1;
                    warn!(certificate_id = %request.id, error = %e, "Failed to queue renewal");
                }
            }
        }

        let mut pending = Vec::new();
        let mut in_flight = 0usize;
        for record in transitions.list().await? {
            let id = record.id.clone();
            let step = match record.status {
                CertificateStatus::Active
                | CertificateStatus::RenewalPending
                | CertificateStatus::RenewalFailed
                    if record.is_past_expiry(now) =>
                {
                    transitions.expire(&id, now).await.map(|t| {
                        if t.is_applied() {
                            report.expired += 1;
                        }
                    })
                }
                CertificateStatus::RenewalPending => {
                    pending.push((record.not_after, id.clone()));
                    Ok(())
                }
                CertificateStatus::RenewalInFlight => {
                    in_flight += 1;
                    transitions.reclaim_stalled(&id, now).await.map(|t| {
                        if t.is_applied() {
                            report.reclaimed += 1;
                            in_flight -= 1;
                        }
                    })
                }
                CertificateStatus::RenewalFailed => {
                    transitions.retry_after_backoff(&id, now).await.map(|t| {
                        if t.is_applied() {
                            report.requeued += 1;
                            pending.push((record.not_after, id.clone()));
                        }
                    })
                }
                CertificateStatus::Active
                | CertificateStatus::Revoked
                | CertificateStatus::Expired => Ok(()),
            };

            match step {
                Ok(()) | Err(LifecycleError::NotFound(_)) => {}
                Err(e) => {
                    report.errors += 1;
                    warn!(certificate_id = %id, error = %e, "Failed to advance certificate");
                }
            }
        }

        let available = self.max_concurrent.saturating_sub(in_flight);
        pending.sort();
        if pending.len() > available {
            report.deferred = pending.len() - available;
            debug!(
                in_flight,
                max_concurrent = self.max_concurrent,
                deferred = report.deferred,
                "In-flight limit reached, deferring pending renewals"
            );
            pending.truncate(available);
        }
        let admitted = pending.into_iter().map(|(_, id)| id).collect();
        self.admit(admitted, now, cancel, &mut report).await;

        info!(
            requested = report.requested,
            deferred = report.deferred,
            started = report.started,
            succeeded = report.succeeded,
            failed = report.failed,
            exhausted = report.exhausted,
            expired = report.expired,
            reclaimed = report.reclaimed,
            "Renewal pass complete"
        );
        Ok(report)
    }

    /// Start an attempt for every admitted id, bounded by the worker pool.
    async fn admit(
        &self,
        pending: Vec<CertificateId>,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
        report: &mut RenewalReport,
    ) {
        let mut tasks = JoinSet::new();
        for id in pending {
            let worker = self.worker.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let result = worker.attempt(id.clone(), now, cancel).await;
                (id, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => report.record(outcome),
                Ok((id, Err(LifecycleError::NotFound(_)))) => {
                    debug!(certificate_id = %id, "Certificate removed before renewal");
                    report.record(AttemptOutcome::Skipped);
                }
                Ok((id, Err(e))) => {
                    report.errors += 1;
                    warn!(certificate_id = %id, error = %e, "Renewal attempt failed to record");
                }
                Err(e) => {
                    report.errors += 1;
                    error!(error = %e, "Renewal task panicked");
                }
            }
        }
    }

    fn drain_requests(&self) -> Vec<RenewalRequest> {
        let Some(requests) = &self.requests else {
            return Vec::new();
        };
        let mut rx = requests.lock();
        let mut drained = Vec::new();
        while let Ok(request) = rx.try_recv() {
            drained.push(request);
        }
        drained
    }

    /// Run passes on the configured interval until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            pass_interval_secs = self.pass_interval.as_secs(),
            max_concurrent = self.max_concurrent,
            "Starting renewal scheduler"
        );

        let mut ticker = interval(self.pass_interval);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.run_pass(&cancel).await {
                Ok(_) => {}
                Err(LifecycleError::Cancelled) => break,
                Err(e) => error!(error = %e, "Renewal pass failed"),
            }
        }

        info!("Renewal scheduler stopped");
    }
}

impl std::fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("max_concurrent", &self.max_concurrent)
            .field("renewal_window", &self.renewal_window)
            .field("pass_interval", &self.pass_interval)
            .finish_non_exhaustive()
    }
}

/// `now` moved forward by the wall time spent since `started`.
fn advanced(now: DateTime<Utc>, started: Instant) -> DateTime<Utc> {
    chrono::Duration::from_std(started.elapsed())
        .ok()
        .and_then(|elapsed| now.checked_add_signed(elapsed))
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffPolicy;
    use crate::metrics::LifecycleMetrics;
    use crate::provider::Validity;
    use crate::record::CertificateRecord;
    use crate::store::{CertificateStore, MemoryCertificateStore};
    use async_trait::async_trait;
    use autocert_common::TimeoutPolicy;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Authority that answers every submission the same way.
    struct ScriptedAuthority {
        reply: Result<SubmissionOutcome, ProviderError>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl ScriptedAuthority {
        fn new(reply: Result<SubmissionOutcome, ProviderError>) -> Self {
            Self {
                reply,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl CertificateAuthority for ScriptedAuthority {
        async fn submit_renewal(
            &self,
            _record: &CertificateRecord,
        ) -> Result<SubmissionOutcome, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.reply.clone()
        }
    }

    fn transitions(store: Arc<MemoryCertificateStore>) -> Arc<LifecycleTransitions> {
        Arc::new(
            LifecycleTransitions::new(store)
                .with_backoff(BackoffPolicy {
                    initial_secs: 60,
                    max_secs: 3600,
                    multiplier: 2.0,
                    jitter_ratio: 0.0,
                })
                .with_max_attempts(3),
        )
    }

    async fn pending_store(ids: &[&str], now: DateTime<Utc>) -> Arc<MemoryCertificateStore> {
        let store = Arc::new(MemoryCertificateStore::new());
        for id in ids {
            let mut record = CertificateRecord::enrolled(
                *id,
                now - ChronoDuration::days(85),
                now + ChronoDuration::days(5),
                None,
            );
            record.status = CertificateStatus::RenewalPending;
            store.insert(record).await.unwrap();
        }
        store
    }

    fn issued(now: DateTime<Utc>) -> SubmissionOutcome {
        SubmissionOutcome::Issued(Validity {
            not_before: now,
            not_after: now + ChronoDuration::days(90),
        })
    }

    #[tokio::test]
    async fn test_synchronous_issue_completes_renewal() {
        let now = Utc::now();
        let store = pending_store(&["a.com"], now).await;
        let authority = Arc::new(ScriptedAuthority::new(Ok(issued(now))));
        let scheduler = RenewalScheduler::new(
            transitions(store.clone()),
            authority.clone(),
            ChronoDuration::days(7),
        );

        let report = scheduler
            .run_pass_at(now, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.started, 1);
        assert_eq!(report.succeeded, 1);

        let record = store.get(&"a.com".into()).await.unwrap();
        assert_eq!(record.status, CertificateStatus::Active);
        assert_eq!(record.not_after, now + ChronoDuration::days(90));
    }

    #[tokio::test]
    async fn test_accepted_order_stays_in_flight() {
        let now = Utc::now();
        let store = pending_store(&["a.com"], now).await;
        let authority = Arc::new(ScriptedAuthority::new(Ok(SubmissionOutcome::Accepted)));
        let scheduler =
            RenewalScheduler::new(transitions(store.clone()), authority, ChronoDuration::days(7));

        let report = scheduler
            .run_pass_at(now, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.awaiting_webhook, 1);
        let record = store.get(&"a.com".into()).await.unwrap();
        assert_eq!(record.status, CertificateStatus::RenewalInFlight);
        assert!(record.provider_ref.is_some());
    }

    #[tokio::test]
    async fn test_rejection_records_failure() {
        let now = Utc::now();
        let store = pending_store(&["a.com"], now).await;
        let authority = Arc::new(ScriptedAuthority::new(Err(ProviderError::Rejected(
            "rate limited".into(),
        ))));
        let scheduler =
            RenewalScheduler::new(transitions(store.clone()), authority, ChronoDuration::days(7));

        let report = scheduler
            .run_pass_at(now, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.failed, 1);

        let record = store.get(&"a.com".into()).await.unwrap();
        assert_eq!(record.status, CertificateStatus::RenewalFailed);
        assert_eq!(record.renewal_attempt_count, 1);
        assert!(record.last_error.unwrap().contains("rate limited"));
    }

    #[tokio::test]
    async fn test_provider_timeout_is_a_failure() {
        let now = Utc::now();
        let store = pending_store(&["a.com"], now).await;
        let authority = Arc::new(
            ScriptedAuthority::new(Ok(SubmissionOutcome::Accepted)).slow(Duration::from_secs(600)),
        );
        let transitions = Arc::new(
            LifecycleTransitions::new(store.clone())
                .with_timeouts(TimeoutPolicy::from_base(Duration::from_millis(25))),
        );
        let scheduler = RenewalScheduler::new(transitions, authority, ChronoDuration::days(7));

        let report = scheduler
            .run_pass_at(now, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        let record = store.get(&"a.com".into()).await.unwrap();
        assert_eq!(record.status, CertificateStatus::RenewalFailed);
        assert!(record.last_error.unwrap().contains("timed out"));
    }

    async fn count_in_flight(store: &MemoryCertificateStore) -> usize {
        store
            .list()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.status == CertificateStatus::RenewalInFlight)
            .count()
    }

    #[tokio::test]
    async fn test_concurrency_limit_is_respected() {
        let now = Utc::now();
        let ids = ["a.com", "b.com", "c.com", "d.com", "e.com"];
        let store = pending_store(&ids, now).await;

        struct Gauge {
            current: AtomicUsize,
            peak: AtomicUsize,
        }
        #[async_trait]
        impl CertificateAuthority for Gauge {
            async fn submit_renewal(
                &self,
                _record: &CertificateRecord,
            ) -> Result<SubmissionOutcome, ProviderError> {
                let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.current.fetch_sub(1, Ordering::SeqCst);
                Ok(SubmissionOutcome::Accepted)
            }
        }

        let gauge = Arc::new(Gauge {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let scheduler = RenewalScheduler::new(
            transitions(store.clone()),
            gauge.clone(),
            ChronoDuration::days(7),
        )
        .with_max_concurrent(2);

        let report = scheduler
            .run_pass_at(now, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.awaiting_webhook, 2);
        assert_eq!(report.deferred, 3);
        assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(count_in_flight(&store).await, 2);

        // Accepted orders hold their slots until settled
        let report = scheduler
            .run_pass_at(now, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.started, 0);
        assert_eq!(report.deferred, 3);
        assert_eq!(count_in_flight(&store).await, 2);
    }

    #[tokio::test]
    async fn test_settled_attempt_frees_a_slot() {
        let now = Utc::now();
        let ids = ["a.com", "b.com", "c.com"];
        let store = pending_store(&ids, now).await;
        let authority = Arc::new(ScriptedAuthority::new(Ok(SubmissionOutcome::Accepted)));
        let scheduler = RenewalScheduler::new(
            transitions(store.clone()),
            authority.clone(),
            ChronoDuration::days(7),
        )
        .with_max_concurrent(2);

        scheduler
            .run_pass_at(now, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(count_in_flight(&store).await, 2);

        let settled = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.status == CertificateStatus::RenewalInFlight)
            .unwrap();
        scheduler
            .transitions()
            .complete_renewal(
                &settled.id,
                settled.provider_ref.as_ref().unwrap(),
                Validity {
                    not_before: now,
                    not_after: now + ChronoDuration::days(90),
                },
            )
            .await
            .unwrap();

        let report = scheduler
            .run_pass_at(now, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.started, 1);
        assert_eq!(report.deferred, 0);
        assert_eq!(count_in_flight(&store).await, 2);
        assert_eq!(authority.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_earliest_expiry_admitted_first() {
        let now = Utc::now();
        let store = Arc::new(MemoryCertificateStore::new());
        for (id, days) in [("late.com", 6), ("soon.com", 1), ("mid.com", 3)] {
            let mut record = CertificateRecord::enrolled(
                id,
                now - ChronoDuration::days(85),
                now + ChronoDuration::days(days),
                None,
            );
            record.status = CertificateStatus::RenewalPending;
            store.insert(record).await.unwrap();
        }
        let authority = Arc::new(ScriptedAuthority::new(Ok(SubmissionOutcome::Accepted)));
        let scheduler =
            RenewalScheduler::new(transitions(store.clone()), authority, ChronoDuration::days(7))
                .with_max_concurrent(1);

        scheduler
            .run_pass_at(now, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            store.get(&"soon.com".into()).await.unwrap().status,
            CertificateStatus::RenewalInFlight
        );
        assert_eq!(
            store.get(&"late.com".into()).await.unwrap().status,
            CertificateStatus::RenewalPending
        );
    }

    #[tokio::test]
    async fn test_drains_monitor_requests() {
        let now = Utc::now();
        let store = Arc::new(MemoryCertificateStore::new());
        store
            .insert(CertificateRecord::enrolled(
                "a.com",
                now - ChronoDuration::days(85),
                now + ChronoDuration::days(5),
                None,
            ))
            .await
            .unwrap();

        let (tx, rx) = mpsc::channel(8);
        tx.send(RenewalRequest {
            id: "a.com".into(),
            not_after: now + ChronoDuration::days(5),
        })
        .await
        .unwrap();

        let authority = Arc::new(ScriptedAuthority::new(Ok(SubmissionOutcome::Accepted)));
        let scheduler =
            RenewalScheduler::new(transitions(store.clone()), authority, ChronoDuration::days(7))
                .with_requests(rx);

        let report = scheduler
            .run_pass_at(now, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.requested, 1);
        assert_eq!(report.awaiting_webhook, 1);
        assert_eq!(
            store.get(&"a.com".into()).await.unwrap().status,
            CertificateStatus::RenewalInFlight
        );
    }

    #[tokio::test]
    async fn test_overdue_records_expire() {
        let now = Utc::now();
        let store = pending_store(&["a.com"], now).await;
        let authority = Arc::new(ScriptedAuthority::new(Ok(SubmissionOutcome::Accepted)));
        let scheduler = RenewalScheduler::new(
            transitions(store.clone()),
            authority.clone(),
            ChronoDuration::days(7),
        );

        let later = now + ChronoDuration::days(6);
        let report = scheduler
            .run_pass_at(later, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(authority.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            store.get(&"a.com".into()).await.unwrap().status,
            CertificateStatus::Expired
        );
    }

    #[tokio::test]
    async fn test_cancelled_attempt_left_in_flight_then_reclaimed() {
        let now = Utc::now();
        let store = pending_store(&["a.com"], now).await;
        let authority = Arc::new(
            ScriptedAuthority::new(Ok(SubmissionOutcome::Accepted)).slow(Duration::from_secs(60)),
        );
        let scheduler = RenewalScheduler::new(
            transitions(store.clone()),
            authority.clone(),
            ChronoDuration::days(7),
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let report = scheduler.run_pass_at(now, &cancel).await.unwrap();
        assert_eq!(report.cancelled, 1);
        assert_eq!(
            store.get(&"a.com".into()).await.unwrap().status,
            CertificateStatus::RenewalInFlight
        );

        // Liveness threshold defaults to 600s
        let later = now + ChronoDuration::minutes(11);
        let report = scheduler
            .run_pass_at(later, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.reclaimed, 1);
        assert_eq!(
            store.get(&"a.com".into()).await.unwrap().status,
            CertificateStatus::RenewalFailed
        );
    }

    #[tokio::test]
    async fn test_pass_refuses_when_already_cancelled() {
        let store = Arc::new(MemoryCertificateStore::new());
        let authority = Arc::new(ScriptedAuthority::new(Ok(SubmissionOutcome::Accepted)));
        let scheduler = RenewalScheduler::new(transitions(store), authority, ChronoDuration::days(7));

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            scheduler.run_pass(&cancel).await,
            Err(LifecycleError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_cancelled_attempt_is_counted() {
        let now = Utc::now();
        let store = pending_store(&["a.com"], now).await;
        let metrics = LifecycleMetrics::new().unwrap();
        let transitions = Arc::new(
            LifecycleTransitions::new(store.clone()).with_metrics(metrics.clone()),
        );
        let authority = Arc::new(
            ScriptedAuthority::new(Ok(SubmissionOutcome::Accepted)).slow(Duration::from_secs(60)),
        );
        let scheduler = RenewalScheduler::new(transitions, authority, ChronoDuration::days(7));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let report = scheduler.run_pass_at(now, &cancel).await.unwrap();
        assert_eq!(report.cancelled, 1);
        assert_eq!(
            metrics
                .renewal_outcomes
                .with_label_values(&["cancelled"])
                .get(),
            1
        );
    }
}
