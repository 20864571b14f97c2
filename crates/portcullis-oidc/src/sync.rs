//! Background refresh of provider metadata.
//!
//! Providers rotate signing keys; the sync task re-fetches discovery and
//! JWKS on a schedule and swaps a fresh [`ProviderConfig`] into the shared
//! slot. Readers holding an older snapshot keep using it unchanged.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::Utc;
use portcullis_telemetry::log_provider_sync_failed;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::discovery::{fetch_provider_config, ProviderConfig};

/// Scheduling bounds for the provider sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPolicy {
    /// Shortest pause between successful syncs.
    pub min_interval: Duration,
    /// Longest pause between syncs, also used when no lifetime is advertised.
    pub max_interval: Duration,
    /// First pause after a failed sync; doubles per consecutive failure.
    pub failure_backoff: Duration,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(60),
            max_interval: Duration::from_secs(24 * 60 * 60),
            failure_backoff: Duration::from_secs(5),
        }
    }
}

impl SyncPolicy {
    /// Set the interval bounds.
    pub fn with_bounds(mut self, min_interval: Duration, max_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self.max_interval = max_interval;
        self
    }

    /// Set the initial failure backoff.
    pub fn with_failure_backoff(mut self, backoff: Duration) -> Self {
        self.failure_backoff = backoff;
        self
    }

    fn failure_delay(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(16);
        self.failure_backoff
            .saturating_mul(1 << exponent)
            .min(self.max_interval)
    }
}

/// Pause before the next sync of `config`.
///
/// Half of the remaining advertised lifetime, clamped to the policy bounds.
/// Snapshots without a lifetime wait the maximum interval.
pub fn next_sync_delay(config: &ProviderConfig, policy: &SyncPolicy) -> Duration {
    let delay = match config.expires_at {
        Some(expires_at) => (expires_at - Utc::now())
            .to_std()
            .map(|remaining| remaining / 2)
            .unwrap_or(Duration::ZERO),
        None => policy.max_interval,
    };

    delay.max(policy.min_interval).min(policy.max_interval)
}

/// Spawn the sync loop for a shared provider slot.
///
/// The loop stops when `shutdown_rx` observes `true` or its sender is
/// dropped.
pub fn spawn_provider_sync(
    http: reqwest::Client,
    provider: Arc<ArcSwap<ProviderConfig>>,
    policy: SyncPolicy,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let discovery_url = provider.load().discovery_url.clone();
        let mut delay = next_sync_delay(&provider.load(), &policy);
        let mut failures: u32 = 0;

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        tracing::debug!(discovery_url = %discovery_url, "Provider sync stopped");
                        return;
                    }
                    continue;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match fetch_provider_config(&http, &discovery_url).await {
                Ok(config) => {
                    failures = 0;
                    delay = next_sync_delay(&config, &policy);

                    tracing::info!(
                        discovery_url = %discovery_url,
                        issuer = %config.issuer(),
                        signing_keys = config.keys.len(),
                        next_sync_secs = delay.as_secs(),
                        "Provider configuration refreshed"
                    );

                    provider.store(Arc::new(config));
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    delay = policy.failure_delay(failures);

                    log_provider_sync_failed!(
                        discovery_url = %discovery_url,
                        error = %e,
                        failures,
                        retry_in_ms = delay.as_millis() as u64,
                        "Failed to refresh provider configuration, keeping previous snapshot"
                    );
                }
            }
        }
    })
}
