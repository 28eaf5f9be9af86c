//! The single transition authority.
//!
//! Every lifecycle mutation, whether triggered by the scheduler, the liveness
//! sweep, a provider webhook or an operator, is expressed here as a decision
//! over the current record and written with the store's compare-and-swap.
//! A lost race re-reads the record and decides again; the decision is
//! re-evaluated against fresh state, so a transition that no longer applies
//! becomes a no-op instead of overwriting newer work.

use std::future::Future;
use std::sync::Arc;

use autocert_common::{CertificateId, ProviderRef, TimeoutPolicy};
use chrono::{DateTime, Utc};
use tracing::{debug, info, trace, warn};

use crate::backoff::BackoffPolicy;
use crate::error::{LifecycleError, LifecycleResult, StoreError};
use crate::metrics::LifecycleMetrics;
use crate::provider::Validity;
use crate::record::{CertificateRecord, CertificateStatus};
use crate::report::{Escalation, LifecycleReporter, TracingReporter};
use crate::store::CertificateStore;

/// What a decision function wants done with the current record.
enum Decision {
    Write(CertificateRecord),
    Skip,
}

/// Result of a transition request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The new record was written.
    Applied(CertificateRecord),
    /// The transition did not apply to the current record; nothing was written.
    Unchanged(CertificateRecord),
    /// Conflicts persisted through every retry; the caller should move on.
    Contended,
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }

    pub fn applied(self) -> Option<CertificateRecord> {
        match self {
            Transition::Applied(record) => Some(record),
            _ => None,
        }
    }
}

/// Applies lifecycle transitions through the store's compare-and-swap.
pub struct LifecycleTransitions {
    store: Arc<dyn CertificateStore>,
    backoff: BackoffPolicy,
    max_attempts: u32,
    timeouts: TimeoutPolicy,
    conflict_retries: u32,
    reporter: Arc<dyn LifecycleReporter>,
    metrics: Option<LifecycleMetrics>,
}

impl LifecycleTransitions {
    pub fn new(store: Arc<dyn CertificateStore>) -> Self {
        Self {
            store,
            backoff: BackoffPolicy::default(),
            max_attempts: 5,
            timeouts: TimeoutPolicy::default(),
            conflict_retries: 3,
            reporter: Arc::new(TracingReporter),
            metrics: None,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutPolicy) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn LifecycleReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_metrics(mut self, metrics: LifecycleMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &Arc<dyn CertificateStore> {
        &self.store
    }

    pub fn timeouts(&self) -> &TimeoutPolicy {
        &self.timeouts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn metrics(&self) -> Option<&LifecycleMetrics> {
        self.metrics.as_ref()
    }

    /// Whether automatic retries are exhausted for `record`.
    pub fn is_exhausted(&self, record: &CertificateRecord) -> bool {
        record.status == CertificateStatus::RenewalFailed
            && record.renewal_attempt_count >= self.max_attempts
    }

    // =========================================================================
    // Store access
    // =========================================================================

    /// Run a store call under the store operation timeout.
    pub async fn timed<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let limit = self.timeouts.store_operation;
        tokio::time::timeout(limit, op)
            .await
            .map_err(|_| StoreError::Timeout(limit))?
    }

    pub async fn get(&self, id: &CertificateId) -> LifecycleResult<CertificateRecord> {
        self.timed(self.store.get(id)).await.map_err(not_found)
    }

    pub async fn list(&self) -> LifecycleResult<Vec<CertificateRecord>> {
        Ok(self.timed(self.store.list()).await?)
    }

    /// Read-decide-swap loop with bounded conflict retries.
    async fn apply<F>(&self, id: &CertificateId, mut decide: F) -> LifecycleResult<Transition>
    where
        F: FnMut(&CertificateRecord) -> Decision,
    {
        let mut conflicts = 0u32;
        loop {
            let current = self.get(id).await?;
            let next = match decide(&current) {
                Decision::Skip => return Ok(Transition::Unchanged(current)),
                Decision::Write(next) => next,
            };

            debug_assert!(current.status.can_transition_to(next.status));

            match self
                .timed(self.store.compare_and_swap(id, current.status, next))
                .await
            {
                Ok(stored) => {
                    debug!(
                        certificate_id = %id,
                        from = %current.status,
                        to = %stored.status,
                        "Applied lifecycle transition"
                    );
                    return Ok(Transition::Applied(stored));
                }
                Err(e) if e.is_conflict() => {
                    conflicts += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.cas_conflicts.inc();
                    }
                    trace!(
                        certificate_id = %id,
                        conflicts = conflicts,
                        "Lost compare-and-swap race, re-reading"
                    );
                    if conflicts > self.conflict_retries {
                        debug!(certificate_id = %id, "Giving up after repeated conflicts");
                        return Ok(Transition::Contended);
                    }
                }
                Err(e) => return Err(not_found(e)),
            }
        }
    }

    fn escalate(&self, record: &CertificateRecord, escalation: Escalation) {
        if let Some(metrics) = &self.metrics {
            metrics.escalations.inc();
        }
        self.reporter.escalate(record, &escalation);
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// `Active -> RenewalPending` for a certificate inside its renewal window.
    ///
    /// A certificate already past `not_after` is moved to `Expired` instead.
    pub async fn request_renewal(
        &self,
        id: &CertificateId,
        renewal_window: chrono::Duration,
        now: DateTime<Utc>,
    ) -> LifecycleResult<Transition> {
        let result = self
            .apply(id, |current| {
                if current.status != CertificateStatus::Active {
                    return Decision::Skip;
                }
                if current.is_past_expiry(now) {
                    return write(current, CertificateStatus::Expired);
                }
                if current.time_to_expiry(now) > renewal_window {
                    return Decision::Skip;
                }
                match current.transitioned(CertificateStatus::RenewalPending) {
                    Ok(mut next) => {
                        next.next_attempt_at = None;
                        Decision::Write(next)
                    }
                    Err(_) => Decision::Skip,
                }
            })
            .await?;

        if let Transition::Applied(record) = &result {
            if record.status == CertificateStatus::Expired {
                self.escalate(record, Escalation::Expired);
            } else {
                info!(
                    certificate_id = %id,
                    not_after = %record.not_after,
                    "Certificate queued for renewal"
                );
            }
        }
        Ok(result)
    }

    /// `Active | RenewalPending | RenewalFailed -> Expired` once `now > not_after`.
    pub async fn expire(&self, id: &CertificateId, now: DateTime<Utc>) -> LifecycleResult<Transition> {
        let result = self
            .apply(id, |current| {
                let expirable = matches!(
                    current.status,
                    CertificateStatus::Active
                        | CertificateStatus::RenewalPending
                        | CertificateStatus::RenewalFailed
                );
                if expirable && current.is_past_expiry(now) {
                    write(current, CertificateStatus::Expired)
                } else {
                    Decision::Skip
                }
            })
            .await?;

        if let Transition::Applied(record) = &result {
            self.escalate(record, Escalation::Expired);
        }
        Ok(result)
    }

    /// `RenewalPending -> RenewalInFlight` with a fresh provider reference.
    ///
    /// This is the single-flight gate: of several concurrent callers exactly
    /// one observes `Applied`; the others re-read, see the record in flight
    /// and get `Unchanged`.
    pub async fn begin_attempt(
        &self,
        id: &CertificateId,
        now: DateTime<Utc>,
    ) -> LifecycleResult<Transition> {
        self.apply(id, |current| {
            if current.status != CertificateStatus::RenewalPending || current.is_past_expiry(now) {
                return Decision::Skip;
            }
            match current.transitioned(CertificateStatus::RenewalInFlight) {
                Ok(mut next) => {
                    next.provider_ref = Some(ProviderRef::generate());
                    next.last_renewal_attempt_at = Some(now);
                    next.next_attempt_at = None;
                    Decision::Write(next)
                }
                Err(_) => Decision::Skip,
            }
        })
        .await
    }

    /// `RenewalInFlight -> Active` for the attempt identified by `provider_ref`.
    pub async fn complete_renewal(
        &self,
        id: &CertificateId,
        provider_ref: &ProviderRef,
        validity: Validity,
    ) -> LifecycleResult<Transition> {
        let result = self
            .apply(id, |current| {
                if current.status != CertificateStatus::RenewalInFlight
                    || !current.matches_provider_ref(provider_ref)
                {
                    return Decision::Skip;
                }
                match current.transitioned(CertificateStatus::Active) {
                    Ok(mut next) => {
                        next.not_before = validity.not_before;
                        next.not_after = validity.not_after;
                        next.renewal_attempt_count = 0;
                        next.next_attempt_at = None;
                        next.last_error = None;
                        Decision::Write(next)
                    }
                    Err(_) => Decision::Skip,
                }
            })
            .await?;

        if let Transition::Applied(record) = &result {
            info!(
                certificate_id = %id,
                provider_ref = %provider_ref,
                not_after = %record.not_after,
                "Certificate renewed"
            );
        }
        Ok(result)
    }

    /// `RenewalInFlight -> RenewalFailed` for the attempt identified by `provider_ref`.
    ///
    /// Increments the attempt count and schedules the retry after a jittered
    /// backoff. Reaching `max_attempts` leaves the record failed with no
    /// retry time and escalates it.
    pub async fn fail_renewal(
        &self,
        id: &CertificateId,
        provider_ref: &ProviderRef,
        reason: &str,
        now: DateTime<Utc>,
    ) -> LifecycleResult<Transition> {
        let max_attempts = self.max_attempts;
        let result = self
            .apply(id, |current| {
                if current.status != CertificateStatus::RenewalInFlight
                    || !current.matches_provider_ref(provider_ref)
                {
                    return Decision::Skip;
                }
                match current.transitioned(CertificateStatus::RenewalFailed) {
                    Ok(mut next) => {
                        next.renewal_attempt_count = current.renewal_attempt_count.saturating_add(1);
                        next.last_error = Some(reason.to_string());
                        next.next_attempt_at = if next.renewal_attempt_count >= max_attempts {
                            None
                        } else {
                            let delay = self.backoff.jittered(next.renewal_attempt_count);
                            Some(retry_time(now, delay))
                        };
                        Decision::Write(next)
                    }
                    Err(_) => Decision::Skip,
                }
            })
            .await?;

        if let Transition::Applied(record) = &result {
            if self.is_exhausted(record) {
                self.escalate(
                    record,
                    Escalation::MaxAttemptsExceeded {
                        attempts: record.renewal_attempt_count,
                        last_error: record.last_error.clone(),
                    },
                );
            } else {
                warn!(
                    certificate_id = %id,
                    attempts = record.renewal_attempt_count,
                    reason = %reason,
                    retry_at = ?record.next_attempt_at,
                    "Certificate renewal attempt failed"
                );
            }
        }
        Ok(result)
    }

    /// `RenewalFailed -> RenewalPending` once the backoff has elapsed.
    ///
    /// Exhausted records are left alone.
    pub async fn retry_after_backoff(
        &self,
        id: &CertificateId,
        now: DateTime<Utc>,
    ) -> LifecycleResult<Transition> {
        let max_attempts = self.max_attempts;
        self.apply(id, |current| {
            if current.status != CertificateStatus::RenewalFailed
                || current.renewal_attempt_count >= max_attempts
                || current.is_past_expiry(now)
            {
                return Decision::Skip;
            }
            if current.next_attempt_at.is_some_and(|at| at > now) {
                return Decision::Skip;
            }
            write(current, CertificateStatus::RenewalPending)
        })
        .await
    }

    /// Fail an attempt that has been in flight longer than the liveness threshold.
    pub async fn reclaim_stalled(
        &self,
        id: &CertificateId,
        now: DateTime<Utc>,
    ) -> LifecycleResult<Transition> {
        let threshold = chrono::Duration::from_std(self.timeouts.liveness_threshold)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let current = self.get(id).await?;
        let stalled = current.status == CertificateStatus::RenewalInFlight
            && current
                .last_renewal_attempt_at
                .map_or(true, |started| now - started > threshold);
        let Some(provider_ref) = current.provider_ref.clone().filter(|_| stalled) else {
            return Ok(Transition::Unchanged(current));
        };

        warn!(
            certificate_id = %id,
            provider_ref = %provider_ref,
            started = ?current.last_renewal_attempt_at,
            "Renewal attempt exceeded liveness threshold"
        );
        self.fail_renewal(id, &provider_ref, "liveness threshold exceeded", now)
            .await
    }

    /// Any live state -> `Revoked` for the record holding `provider_ref`.
    pub async fn revoke(
        &self,
        id: &CertificateId,
        provider_ref: &ProviderRef,
        now: DateTime<Utc>,
    ) -> LifecycleResult<Transition> {
        let result = self
            .apply(id, |current| {
                if !current.matches_provider_ref(provider_ref) {
                    return Decision::Skip;
                }
                match current.transitioned(CertificateStatus::Revoked) {
                    Ok(mut next) => {
                        next.revoked_at = Some(now);
                        next.next_attempt_at = None;
                        Decision::Write(next)
                    }
                    Err(_) => Decision::Skip,
                }
            })
            .await?;

        if let Transition::Applied(record) = &result {
            self.escalate(record, Escalation::Revoked);
        }
        Ok(result)
    }

    /// Operator reset: clear the attempt count of a failed record and queue it.
    pub async fn reset_attempts(&self, id: &CertificateId) -> LifecycleResult<CertificateRecord> {
        let result = self
            .apply(id, |current| {
                if current.status != CertificateStatus::RenewalFailed {
                    return Decision::Skip;
                }
                match current.transitioned(CertificateStatus::RenewalPending) {
                    Ok(mut next) => {
                        next.renewal_attempt_count = 0;
                        next.next_attempt_at = None;
                        Decision::Write(next)
                    }
                    Err(_) => Decision::Skip,
                }
            })
            .await?;

        match result {
            Transition::Applied(record) => {
                info!(certificate_id = %id, "Renewal attempts reset by operator");
                Ok(record)
            }
            Transition::Unchanged(current) => match current.status {
                CertificateStatus::Revoked => Err(LifecycleError::Revoked(id.clone())),
                status => Err(LifecycleError::InvalidTransition {
                    id: id.clone(),
                    from: status,
                    to: CertificateStatus::RenewalPending,
                }),
            },
            Transition::Contended => Err(LifecycleError::Contended(id.clone())),
        }
    }

    /// Remove a revoked record whose retention period has passed.
    ///
    /// Returns `true` if the record was removed.
    pub async fn purge_revoked(
        &self,
        record: &CertificateRecord,
        retention: chrono::Duration,
        now: DateTime<Utc>,
    ) -> LifecycleResult<bool> {
        if record.status != CertificateStatus::Revoked {
            return Ok(false);
        }
        // Records revoked before revoked_at existed fall back to expiry
        let revoked_at = record.revoked_at.unwrap_or(record.not_after);
        if now - revoked_at < retention {
            return Ok(false);
        }
        match self
            .timed(self.store.remove(&record.id, CertificateStatus::Revoked))
            .await
        {
            Ok(_) => {
                info!(certificate_id = %record.id, "Purged revoked certificate record");
                Ok(true)
            }
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for LifecycleTransitions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleTransitions")
            .field("backoff", &self.backoff)
            .field("max_attempts", &self.max_attempts)
            .field("timeouts", &self.timeouts)
            .field("conflict_retries", &self.conflict_retries)
            .finish()
    }
}

fn write(current: &CertificateRecord, next: CertificateStatus) -> Decision {
    current
        .transitioned(next)
        .map(Decision::Write)
        .unwrap_or(Decision::Skip)
}

fn retry_time(now: DateTime<Utc>, delay: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn not_found(err: StoreError) -> LifecycleError {
    match err {
        StoreError::NotFound(id) => LifecycleError::NotFound(id),
        other => LifecycleError::Store(other),
    }
}
