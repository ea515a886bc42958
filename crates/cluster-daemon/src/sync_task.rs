//! Outgoing connections to trackers.
//!
//! Trackers periodically pull each peer tracker's registry with
//! SYNC_INSTANCES and merge it into their own. Storage nodes periodically
//! re-register with every configured tracker. Both tasks back off
//! exponentially per tracker while it is unreachable.

use anyhow::{Context, Result, anyhow};
use cluster_core::{ClusterClient, Instance, MergeSummary, Registry, Server};
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio::time::{MissedTickBehavior, timeout};
use tracing::{debug, info, warn};

/// Configuration for retry behavior after a failed exchange.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Timeout for one complete exchange with a tracker
    pub exchange_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
            exchange_timeout: Duration::from_secs(10),
        }
    }
}

/// Calculates the next retry delay using exponential backoff.
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let delay_secs = config.initial_delay.as_secs_f64()
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_secs_f64(delay_secs.min(config.max_delay.as_secs_f64()))
}

/// Retry state for one tracker.
#[derive(Debug, Clone, Default)]
pub struct ReconnectState {
    /// Consecutive failed attempts
    pub attempts: u32,
    /// Earliest time for the next attempt (ms since epoch)
    pub next_attempt_at: Option<u64>,
}

impl ReconnectState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure and schedule the next attempt.
    pub fn schedule_retry(&mut self, now_ms: u64, config: &ReconnectConfig) -> Duration {
        self.attempts += 1;
        let delay = calculate_backoff(self.attempts, config);
        self.next_attempt_at = Some(now_ms + delay.as_millis() as u64);
        delay
    }

    /// Reset after a successful exchange.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.next_attempt_at = None;
    }

    /// Whether an attempt may be made now.
    pub fn is_due(&self, now_ms: u64) -> bool {
        self.next_attempt_at.map(|t| now_ms >= t).unwrap_or(true)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Open a TCP connection to `server` and authenticate, registering `local`.
async fn connect(
    server: &Server,
    local: &Instance,
    secret: &str,
) -> Result<ClusterClient<TcpStream>> {
    let stream = TcpStream::connect(server.address())
        .await
        .with_context(|| format!("Failed to connect to {}", server))?;
    stream.set_nodelay(true)?;

    let mut client = ClusterClient::new(stream);
    client
        .connect(secret, Some(local))
        .await
        .with_context(|| format!("CONNECT to {} failed", server))?;
    Ok(client)
}

/// Register `local` with a tracker and pull its registry into `registry`.
pub async fn sync_with_tracker(
    server: &Server,
    local: &Instance,
    registry: &Registry,
    secret: &str,
    limit: Duration,
) -> Result<MergeSummary> {
    let exchange = async {
        let mut client = connect(server, local, secret).await?;
        let snapshot = client
            .sync_instances()
            .await
            .with_context(|| format!("SYNC_INSTANCES from {} failed", server))?;
        let _ = client.close().await;
        Ok::<_, anyhow::Error>(registry.merge(snapshot))
    };

    timeout(limit, exchange)
        .await
        .map_err(|_| anyhow!("Sync with {} timed out after {:?}", server, limit))?
}

/// Register `local` with a tracker.
pub async fn register_with_tracker(
    server: &Server,
    local: &Instance,
    secret: &str,
    limit: Duration,
) -> Result<()> {
    let exchange = async {
        let mut client = connect(server, local, secret).await?;
        let _ = client.close().await;
        Ok::<_, anyhow::Error>(())
    };

    timeout(limit, exchange)
        .await
        .map_err(|_| anyhow!("Registration with {} timed out after {:?}", server, limit))?
}

/// Run `exchange` against every due tracker once per `interval`, forever.
async fn run_rounds<F, Fut>(
    trackers: Vec<Server>,
    interval: Duration,
    config: ReconnectConfig,
    exchange: F,
) where
    F: Fn(Server) -> Fut,
    Fut: Future<Output = Result<String>>,
{
    let mut states = vec![ReconnectState::new(); trackers.len()];
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let now = now_ms();

        let due: Vec<usize> = (0..trackers.len()).filter(|&i| states[i].is_due(now)).collect();
        if due.is_empty() {
            continue;
        }

        let results = join_all(due.iter().map(|&i| exchange(trackers[i].clone()))).await;

        let now = now_ms();
        for (i, result) in due.into_iter().zip(results) {
            let state = &mut states[i];
            match result {
                Ok(outcome) => {
                    if state.attempts > 0 {
                        info!("Tracker {} reachable again", trackers[i]);
                    }
                    debug!("Tracker {}: {}", trackers[i], outcome);
                    state.reset();
                }
                Err(e) => {
                    let delay = state.schedule_retry(now, &config);
                    warn!(
                        "Tracker {} failed (attempt {}), retrying in {:?}: {:#}",
                        trackers[i], state.attempts, delay, e
                    );
                }
            }
        }
    }
}

/// Periodically merge every peer tracker's registry into `registry`.
pub async fn run_tracker_sync(
    trackers: Vec<Server>,
    local: Instance,
    registry: Arc<Registry>,
    default_secret: String,
    interval: Duration,
    config: ReconnectConfig,
) {
    info!("Syncing with {} tracker(s) every {:?}", trackers.len(), interval);
    let limit = config.exchange_timeout;

    run_rounds(trackers, interval, config, |server| {
        let local = local.clone();
        let registry = Arc::clone(&registry);
        let secret = server.secret().unwrap_or(&default_secret).to_string();
        async move {
            let summary = sync_with_tracker(&server, &local, &registry, &secret, limit).await?;
            if summary.changed() {
                info!(
                    "Merged registry from {}: {} added, {} updated",
                    server, summary.added, summary.updated
                );
            }
            Ok(format!("{} instance(s) in sync", summary.unchanged))
        }
    })
    .await
}

/// Periodically register `local` with every configured tracker.
pub async fn run_storage_registration(
    trackers: Vec<Server>,
    local: Instance,
    default_secret: String,
    interval: Duration,
    config: ReconnectConfig,
) {
    info!("Registering with {} tracker(s) every {:?}", trackers.len(), interval);
    let limit = config.exchange_timeout;

    run_rounds(trackers, interval, config, |server| {
        let local = local.clone();
        let secret = server.secret().unwrap_or(&default_secret).to_string();
        async move {
            register_with_tracker(&server, &local, &secret, limit).await?;
            Ok("registered".to_string())
        }
    })
    .await
}
