//! Configuration for the certificate lifecycle engine.
//!
//! Loaded from TOML; every field has a default, so an empty file is a valid
//! configuration.
//!
//! ```toml
//! [timeouts]
//! base_seconds = 30
//!
//! [monitor]
//! scan_interval_secs = 3600
//! renewal_window_days = 30
//!
//! [scheduler]
//! max_concurrent_renewals = 4
//! max_attempts = 5
//!
//! [backoff]
//! initial_secs = 60
//! max_secs = 21600
//! multiplier = 2.0
//! jitter_ratio = 0.2
//!
//! [retention]
//! revoked_retention_days = 30
//!
//! [store]
//! type = "file"
//! path = "/var/lib/autocert"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use autocert_common::{TimeoutPolicy, DEFAULT_TIMEOUT_SECONDS};
use serde::{Deserialize, Serialize};
use tracing::debug;
use validator::Validate;

use crate::backoff::BackoffPolicy;
use crate::error::{LifecycleError, LifecycleResult};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct LifecycleConfig {
    #[serde(default)]
    #[validate(nested)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    #[validate(nested)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    #[validate(nested)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    #[validate(nested)]
    pub backoff: BackoffPolicy,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

impl LifecycleConfig {
    /// Load and validate a TOML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> LifecycleResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            LifecycleError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "Loaded configuration file");
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> LifecycleResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| LifecycleError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    /// Field ranges plus the cross-field constraints.
    pub fn check(&self) -> LifecycleResult<()> {
        self.validate()?;

        let timeouts = self.timeouts.policy();
        if timeouts.liveness_threshold <= timeouts.renewal_attempt {
            return Err(LifecycleError::Config(format!(
                "liveness threshold ({:?}) must exceed the renewal attempt timeout ({:?})",
                timeouts.liveness_threshold, timeouts.renewal_attempt
            )));
        }
        if let StoreConfig::File { path } = &self.store {
            if path.as_os_str().is_empty() {
                return Err(LifecycleError::Config("store path is empty".to_string()));
            }
        }
        Ok(())
    }
}

/// Timeout configuration.
///
/// All bounds derive from `base_seconds`; individual bounds may be
/// overridden explicitly.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TimeoutConfig {
    /// At most one day
    #[serde(default = "default_base_seconds")]
    #[validate(range(min = 1, max = 86400))]
    pub base_seconds: u64,

    /// Overrides are capped at 30 days
    #[serde(default)]
    #[validate(range(min = 1, max = 2592000))]
    pub store_operation_secs: Option<u64>,

    #[serde(default)]
    #[validate(range(min = 1, max = 2592000))]
    pub renewal_attempt_secs: Option<u64>,

    #[serde(default)]
    #[validate(range(min = 1, max = 2592000))]
    pub liveness_threshold_secs: Option<u64>,
}

fn default_base_seconds() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            base_seconds: default_base_seconds(),
            store_operation_secs: None,
            renewal_attempt_secs: None,
            liveness_threshold_secs: None,
        }
    }
}

impl TimeoutConfig {
    /// Effective timeout policy.
    pub fn policy(&self) -> TimeoutPolicy {
        let mut policy = TimeoutPolicy::from_base_secs(self.base_seconds);
        if let Some(secs) = self.store_operation_secs {
            policy.store_operation = Duration::from_secs(secs);
        }
        if let Some(secs) = self.renewal_attempt_secs {
            policy.renewal_attempt = Duration::from_secs(secs);
        }
        if let Some(secs) = self.liveness_threshold_secs {
            policy.liveness_threshold = Duration::from_secs(secs);
        }
        policy
    }
}

/// Expiry monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MonitorConfig {
    /// Time between scans
    #[serde(default = "default_scan_interval_secs")]
    #[validate(range(min = 1))]
    pub scan_interval_secs: u64,

    /// Lead time before expiry during which renewal becomes eligible
    #[serde(default = "default_renewal_window_days")]
    #[validate(range(min = 1, max = 365))]
    pub renewal_window_days: u32,
}

fn default_scan_interval_secs() -> u64 {
    // 120 x the base timeout: hourly by default
    DEFAULT_TIMEOUT_SECONDS * 120
}
fn default_renewal_window_days() -> u32 {
    30
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval_secs(),
            renewal_window_days: default_renewal_window_days(),
        }
    }
}

impl MonitorConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn renewal_window(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.renewal_window_days))
    }
}

/// Renewal scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SchedulerConfig {
    /// Maximum simultaneous renewal attempts (certificate authority rate limit)
    #[serde(default = "default_max_concurrent_renewals")]
    #[validate(range(min = 1, max = 1024))]
    pub max_concurrent_renewals: usize,

    /// Failures after which automatic retries stop
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1))]
    pub max_attempts: u32,

    /// Time between scheduler passes in daemon mode
    #[serde(default = "default_pass_interval_secs")]
    #[validate(range(min = 1))]
    pub pass_interval_secs: u64,

    /// Re-reads after a lost compare-and-swap before giving up on a record
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,

    /// Capacity of the renewal request queue fed by the monitor
    #[serde(default = "default_request_queue_capacity")]
    #[validate(range(min = 1))]
    pub request_queue_capacity: usize,
}

fn default_max_concurrent_renewals() -> usize {
    4
}
fn default_max_attempts() -> u32 {
    5
}
fn default_pass_interval_secs() -> u64 {
    DEFAULT_TIMEOUT_SECONDS * 2
}
fn default_conflict_retries() -> u32 {
    3
}
fn default_request_queue_capacity() -> usize {
    1024
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_renewals: default_max_concurrent_renewals(),
            max_attempts: default_max_attempts(),
            pass_interval_secs: default_pass_interval_secs(),
            conflict_retries: default_conflict_retries(),
            request_queue_capacity: default_request_queue_capacity(),
        }
    }
}

impl SchedulerConfig {
    pub fn pass_interval(&self) -> Duration {
        Duration::from_secs(self.pass_interval_secs)
    }
}

/// Retention policy for terminal records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Days a revoked record is kept before it may be purged
    #[serde(default = "default_revoked_retention_days")]
    pub revoked_retention_days: u32,
}

fn default_revoked_retention_days() -> u32 {
    30
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            revoked_retention_days: default_revoked_retention_days(),
        }
    }
}

impl RetentionConfig {
    pub fn revoked_retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.revoked_retention_days))
    }
}

/// Store backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    /// In-memory store (single process, lost on restart)
    Memory,
    /// One JSON file per record under `path`
    File { path: PathBuf },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::File {
            path: PathBuf::from("/var/lib/autocert"),
        }
    }
}
