//! AutoCert - operator command line
//!
//! Inspects and repairs the lifecycle state kept by the certificate
//! lifecycle engine.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use autocert_lifecycle::{
    CertificateAuthority, CertificateId, CertificateLifecycleService, CertificateRecord,
    LifecycleConfig, ProviderError, StatusSummary, SubmissionOutcome, WebhookOutcome,
};

/// AutoCert - certificate lifecycle management
#[derive(Parser, Debug)]
#[command(name = "autocert")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "AUTOCERT_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long = "log-json", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate configuration file and exit
    Check,
    /// Show every managed certificate with its status and urgency
    Status,
    /// Clear the attempt count of a failed certificate and queue it again
    Reset {
        /// Certificate identity
        id: String,
    },
    /// Remove revoked certificates older than the retention period
    Purge,
    /// Reconcile a provider webhook payload read from a file
    Webhook {
        /// Payload file ("-" for stdin)
        payload: PathBuf,
    },
}

/// Stand-in authority for operator commands, which never submit renewals.
struct OfflineAuthority;

#[async_trait]
impl CertificateAuthority for OfflineAuthority {
    async fn submit_renewal(
        &self,
        _record: &CertificateRecord,
    ) -> Result<SubmissionOutcome, ProviderError> {
        Err(ProviderError::Unavailable(
            "no certificate authority in operator mode".to_string(),
        ))
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    let config = load_config(cli.config.as_deref())?;

    if let Commands::Check = cli.command {
        return check_config(cli.config.as_deref(), &config);
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(async move {
        let service = CertificateLifecycleService::builder(config)
            .build(Arc::new(OfflineAuthority))
            .context("Failed to open certificate store")?;

        match cli.command {
            Commands::Check => Ok(()),
            Commands::Status => {
                let summary = service.status_summary().await?;
                print_status(&summary);
                Ok(())
            }
            Commands::Reset { id } => {
                let id = CertificateId::new(id);
                let record = service
                    .reset_attempts(&id)
                    .await
                    .with_context(|| format!("Failed to reset {}", id))?;
                println!("autocert: {} queued for renewal ({})", record.id, record.status);
                Ok(())
            }
            Commands::Purge => {
                let purged = service.purge_revoked().await?;
                println!("autocert: purged {} revoked certificate(s)", purged);
                Ok(())
            }
            Commands::Webhook { payload } => {
                let bytes = read_payload(&payload)?;
                let outcome = service
                    .process_webhook(&bytes, &CancellationToken::new())
                    .await
                    .context("Failed to reconcile webhook")?;
                match outcome {
                    WebhookOutcome::Applied(record) => {
                        println!("autocert: {} is now {}", record.id, record.status)
                    }
                    WebhookOutcome::Duplicate => println!("autocert: event already applied"),
                    WebhookOutcome::Stale(provider_ref) => {
                        warn!(provider_ref = %provider_ref, "Webhook did not match any live attempt");
                        println!("autocert: stale event for {}", provider_ref)
                    }
                }
                Ok(())
            }
        }
    })
}

/// Initialize tracing from `RUST_LOG`, falling back to the verbosity flag.
fn init_logging(verbose: bool, json: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<LifecycleConfig> {
    match path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            LifecycleConfig::from_file(path).context("Failed to load configuration file")
        }
        None => {
            info!("No configuration specified, using defaults");
            Ok(LifecycleConfig::default())
        }
    }
}

/// Report the effective configuration and exit.
fn check_config(path: Option<&std::path::Path>, config: &LifecycleConfig) -> Result<()> {
    config.check().context("Configuration validation failed")?;

    let timeouts = config.timeouts.policy();
    info!("Configuration test successful:");
    info!("  - renewal window: {} day(s)", config.monitor.renewal_window_days);
    info!("  - max attempts: {}", config.scheduler.max_attempts);
    info!(
        "  - concurrent renewals: {}",
        config.scheduler.max_concurrent_renewals
    );
    info!(
        "  - timeouts: store {:?}, attempt {:?}, liveness {:?}",
        timeouts.store_operation, timeouts.renewal_attempt, timeouts.liveness_threshold
    );

    println!(
        "autocert: configuration file {} test is successful",
        path.map(|p| p.display().to_string())
            .unwrap_or_else(|| "(defaults)".to_string())
    );
    Ok(())
}

fn read_payload(path: &std::path::Path) -> Result<Vec<u8>> {
    if path.as_os_str() == "-" {
        use std::io::Read;
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("Failed to read payload from stdin")?;
        return Ok(buf);
    }
    std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn print_status(summary: &StatusSummary) {
    println!(
        "{:<40} {:<18} {:<12} {:<25} {:>8}",
        "CERTIFICATE", "STATUS", "URGENCY", "NOT AFTER", "ATTEMPTS"
    );
    for entry in &summary.entries {
        let attempts = if entry.exhausted {
            format!("{}!", entry.renewal_attempt_count)
        } else {
            entry.renewal_attempt_count.to_string()
        };
        println!(
            "{:<40} {:<18} {:<12} {:<25} {:>8}",
            entry.id.as_str(),
            entry.status.as_str(),
            entry.urgency.as_str(),
            entry.not_after.to_rfc3339(),
            attempts
        );
        if let Some(error) = &entry.last_error {
            println!("    last error: {}", error);
        }
        if let Some(halted) = entry.halted() {
            println!("    halted: {}", halted);
        }
    }
    println!();
    for (status, count) in &summary.counts {
        println!("{:<18} {}", status.as_str(), count);
    }
}
