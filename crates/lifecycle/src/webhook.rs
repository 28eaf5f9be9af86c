//! Provider webhook reconciliation.
//!
//! Provider events arrive asynchronously, possibly duplicated and out of
//! order. Each event names the `provider_ref` of the attempt it is about; an
//! event is only applied to the record whose current token matches. Events
//! for superseded or unknown tokens are discarded as stale, and re-delivery of
//! an event that already took effect is reported as a duplicate.
//!
//! Payload parsing and signature verification happen before this point. The
//! [`WebhookDecoder`] seam turns an already-authenticated payload into a
//! [`WebhookEvent`]; [`JsonWebhookDecoder`] handles the JSON shape:
//!
//! ```json
//! { "provider_ref": "…", "event_type": "issued",
//!   "not_before": "2026-01-01T00:00:00Z", "not_after": "2026-04-01T00:00:00Z" }
//! { "provider_ref": "…", "event_type": "failed", "reason": "dns challenge failed" }
//! { "provider_ref": "…", "event_type": "revoked" }
//! ```

use std::sync::Arc;

use autocert_common::ProviderRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{LifecycleError, LifecycleResult};
use crate::provider::Validity;
use crate::record::{CertificateRecord, CertificateStatus};
use crate::transition::{LifecycleTransitions, Transition};

/// What the provider reports about an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum WebhookEventKind {
    /// The renewed certificate was issued.
    Issued(Validity),
    /// The renewal failed on the provider side.
    Failed {
        #[serde(default)]
        reason: String,
    },
    /// The certificate was revoked.
    Revoked,
}

impl WebhookEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEventKind::Issued(_) => "issued",
            WebhookEventKind::Failed { .. } => "failed",
            WebhookEventKind::Revoked => "revoked",
        }
    }

    /// Status a record holds once this event has taken effect.
    fn settled_status(&self) -> CertificateStatus {
        match self {
            WebhookEventKind::Issued(_) => CertificateStatus::Active,
            WebhookEventKind::Failed { .. } => CertificateStatus::RenewalFailed,
            WebhookEventKind::Revoked => CertificateStatus::Revoked,
        }
    }
}

/// A decoded provider event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub provider_ref: ProviderRef,
    #[serde(flatten)]
    pub kind: WebhookEventKind,
}

/// Result of reconciling one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// The event changed the record.
    Applied(CertificateRecord),
    /// The event had already taken effect; nothing changed.
    Duplicate,
    /// The token is unknown or superseded; the event was discarded.
    Stale(ProviderRef),
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookOutcome::Applied(_) => "applied",
            WebhookOutcome::Duplicate => "duplicate",
            WebhookOutcome::Stale(_) => "stale",
        }
    }

    /// Turn a stale outcome into [`LifecycleError::StaleWebhook`], for callers
    /// that must report unknown tokens back to the provider.
    pub fn reject_stale(self) -> LifecycleResult<Self> {
        match self {
            WebhookOutcome::Stale(provider_ref) => Err(LifecycleError::StaleWebhook(provider_ref)),
            other => Ok(other),
        }
    }
}

/// Turns an authenticated webhook payload into an event.
pub trait WebhookDecoder: Send + Sync {
    fn decode(&self, payload: &[u8]) -> LifecycleResult<WebhookEvent>;
}

/// Decoder for JSON payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonWebhookDecoder;

impl WebhookDecoder for JsonWebhookDecoder {
    fn decode(&self, payload: &[u8]) -> LifecycleResult<WebhookEvent> {
        let event: WebhookEvent = serde_json::from_slice(payload)
            .map_err(|e| LifecycleError::InvalidWebhook(e.to_string()))?;
        if event.provider_ref.as_str().is_empty() {
            return Err(LifecycleError::InvalidWebhook(
                "provider_ref must not be empty".to_string(),
            ));
        }
        if let WebhookEventKind::Issued(validity) = &event.kind {
            if validity.not_after <= validity.not_before {
                return Err(LifecycleError::InvalidWebhook(format!(
                    "not_after ({}) must be after not_before ({})",
                    validity.not_after, validity.not_before
                )));
            }
        }
        Ok(event)
    }
}

/// Applies provider events through the shared transition authority.
#[derive(Debug, Clone)]
pub struct WebhookReconciler {
    transitions: Arc<LifecycleTransitions>,
}

impl WebhookReconciler {
    pub fn new(transitions: Arc<LifecycleTransitions>) -> Self {
        Self { transitions }
    }

    pub async fn reconcile(
        &self,
        event: WebhookEvent,
        cancel: &CancellationToken,
    ) -> LifecycleResult<WebhookOutcome> {
        self.reconcile_at(event, Utc::now(), cancel).await
    }

    /// Reconcile an event as of `now`.
    pub async fn reconcile_at(
        &self,
        event: WebhookEvent,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> LifecycleResult<WebhookOutcome> {
        if cancel.is_cancelled() {
            return Err(LifecycleError::Cancelled);
        }

        let outcome = self.apply(&event, now).await?;

        if let Some(metrics) = self.transitions.metrics() {
            metrics.record_webhook(outcome.as_str());
        }
        match &outcome {
            WebhookOutcome::Applied(record) => info!(
                certificate_id = %record.id,
                provider_ref = %event.provider_ref,
                event_type = event.kind.as_str(),
                status = %record.status,
                "Applied provider webhook"
            ),
            WebhookOutcome::Duplicate => debug!(
                provider_ref = %event.provider_ref,
                event_type = event.kind.as_str(),
                "Ignoring duplicate provider webhook"
            ),
            WebhookOutcome::Stale(provider_ref) => warn!(
                provider_ref = %provider_ref,
                event_type = event.kind.as_str(),
                "Discarding stale provider webhook"
            ),
        }
        Ok(outcome)
    }

    async fn apply(&self, event: &WebhookEvent, now: DateTime<Utc>) -> LifecycleResult<WebhookOutcome> {
        let provider_ref = &event.provider_ref;
        let stale = || WebhookOutcome::Stale(provider_ref.clone());

        let Some(record) = self
            .transitions
            .list()
            .await?
            .into_iter()
            .find(|r| r.matches_provider_ref(provider_ref))
        else {
            return Ok(stale());
        };
        let id = record.id;

        let transition = match &event.kind {
            WebhookEventKind::Issued(validity) => {
                self.transitions
                    .complete_renewal(&id, provider_ref, *validity)
                    .await
            }
            WebhookEventKind::Failed { reason } => {
                let reason = if reason.is_empty() {
                    "provider reported failure"
                } else {
                    reason.as_str()
                };
                self.transitions
                    .fail_renewal(&id, provider_ref, reason, now)
                    .await
            }
            WebhookEventKind::Revoked => self.transitions.revoke(&id, provider_ref, now).await,
        };

        match transition {
            Ok(Transition::Applied(record)) => Ok(WebhookOutcome::Applied(record)),
            Ok(Transition::Unchanged(current)) => {
                if current.matches_provider_ref(provider_ref)
                    && current.status == event.kind.settled_status()
                {
                    Ok(WebhookOutcome::Duplicate)
                } else {
                    Ok(stale())
                }
            }
            Ok(Transition::Contended) => Err(LifecycleError::Contended(id)),
            Err(LifecycleError::NotFound(_)) => Ok(stale()),
            Err(e) => Err(e),
        }
    }
}
