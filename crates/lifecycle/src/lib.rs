//! AutoCert Lifecycle Library
//!
//! Tracks already-issued certificates and keeps them renewed before they
//! expire. The engine is built from a few components sharing one store:
//!
//! - **ExpiryMonitor**: timer-driven scan that emits renewal requests
//! - **RenewalScheduler**: single-flight renewal attempts with backoff and a bounded worker pool
//! - **WebhookReconciler**: applies asynchronous provider events, guarded against stale delivery
//! - **LifecycleTransitions**: the one place state changes are decided and written
//!
//! Every state change goes through the store's compare-and-swap, so the
//! timer-driven and event-driven paths never overwrite each other.
//!
//! # Example
//!
//! ```ignore
//! use autocert_lifecycle::{CertificateLifecycleService, LifecycleConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = LifecycleConfig::from_file("/etc/autocert/autocert.toml")?;
//! let service = CertificateLifecycleService::builder(config).build(authority)?;
//!
//! let cancel = CancellationToken::new();
//! service.run(cancel).await;
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod backoff;
pub mod config;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod provider;
pub mod record;
pub mod report;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod transition;
pub mod webhook;

// ============================================================================
// Public API Re-exports
// ============================================================================

pub use autocert_common::{CertificateId, ProviderRef, TimeoutPolicy, DEFAULT_TIMEOUT_SECONDS};

// Errors
pub use error::{LifecycleError, LifecycleResult, ProviderError, StoreError};

// Records and storage
pub use record::{CertificateRecord, CertificateStatus};
pub use store::{CertificateStore, FileCertificateStore, MemoryCertificateStore};

// Components
pub use monitor::{ExpiryMonitor, RenewalRequest, ScanReport, Urgency};
pub use scheduler::{AttemptOutcome, RenewalReport, RenewalScheduler};
pub use transition::{LifecycleTransitions, Transition};
pub use webhook::{
    JsonWebhookDecoder, WebhookDecoder, WebhookEvent, WebhookEventKind, WebhookOutcome,
    WebhookReconciler,
};

// Collaborators
pub use provider::{CertificateAuthority, SubmissionOutcome, Validity};
pub use report::{Escalation, LifecycleReporter, TracingReporter};

// Service and configuration
pub use backoff::BackoffPolicy;
pub use config::LifecycleConfig;
pub use metrics::LifecycleMetrics;
pub use service::{CertificateLifecycleService, LifecycleServiceBuilder, StatusEntry, StatusSummary};
