//! Prometheus metrics for the lifecycle engine.

use prometheus::{IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry};

use crate::record::CertificateStatus;

/// Counters and gauges describing lifecycle activity.
#[derive(Clone)]
pub struct LifecycleMetrics {
    registry: Registry,
    /// Renewal attempt outcomes by result label
    pub renewal_outcomes: IntCounterVec,
    /// Webhook deliveries by outcome label
    pub webhook_events: IntCounterVec,
    /// Escalations raised to operators
    pub escalations: IntCounter,
    /// Compare-and-swap races lost (and retried or skipped)
    pub cas_conflicts: IntCounter,
    /// Records by status, refreshed on every monitor scan
    pub records_by_status: IntGaugeVec,
}

impl LifecycleMetrics {
    /// Create metrics registered on a private registry.
    pub fn new() -> prometheus::Result<Self> {
        Self::with_registry(Registry::new())
    }

    /// Create metrics registered on `registry`.
    pub fn with_registry(registry: Registry) -> prometheus::Result<Self> {
        let renewal_outcomes = IntCounterVec::new(
            Opts::new(
                "autocert_renewal_attempts_total",
                "Renewal attempts by outcome",
            ),
            &["outcome"],
        )?;
        let webhook_events = IntCounterVec::new(
            Opts::new(
                "autocert_webhook_events_total",
                "Provider webhook deliveries by reconciliation outcome",
            ),
            &["outcome"],
        )?;
        let escalations = IntCounter::new(
            "autocert_escalations_total",
            "Lifecycle events escalated to operators",
        )?;
        let cas_conflicts = IntCounter::new(
            "autocert_store_conflicts_total",
            "Compare-and-swap races lost",
        )?;
        let records_by_status = IntGaugeVec::new(
            Opts::new("autocert_certificates", "Certificate records by status"),
            &["status"],
        )?;

        registry.register(Box::new(renewal_outcomes.clone()))?;
        registry.register(Box::new(webhook_events.clone()))?;
        registry.register(Box::new(escalations.clone()))?;
        registry.register(Box::new(cas_conflicts.clone()))?;
        registry.register(Box::new(records_by_status.clone()))?;

        Ok(Self {
            registry,
            renewal_outcomes,
            webhook_events,
            escalations,
            cas_conflicts,
            records_by_status,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_renewal(&self, outcome: &str) {
        self.renewal_outcomes.with_label_values(&[outcome]).inc();
    }

    pub fn record_webhook(&self, outcome: &str) {
        self.webhook_events.with_label_values(&[outcome]).inc();
    }

    /// Replace the per-status gauges with fresh counts.
    pub fn set_status_counts(&self, counts: &[(CertificateStatus, usize)]) {
        for status in CertificateStatus::ALL {
            let count = counts
                .iter()
                .find(|(s, _)| *s == status)
                .map(|(_, c)| *c)
                .unwrap_or(0);
            self.records_by_status
                .with_label_values(&[status.as_str()])
                .set(count as i64);
        }
    }
}

impl std::fmt::Debug for LifecycleMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleMetrics").finish_non_exhaustive()
    }
}
