//! Common types shared across AutoCert crates.
//!
//! - [`ids`]: type-safe certificate and provider identifiers
//! - [`timeouts`]: the base timeout constant and the policy derived from it

pub mod ids;
pub mod timeouts;

pub use ids::{CertificateId, ProviderRef};
pub use timeouts::{TimeoutPolicy, DEFAULT_TIMEOUT_SECONDS};
