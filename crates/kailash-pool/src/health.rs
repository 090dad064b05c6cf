//! Connection health scoring and the health monitor task
//!
//! Each record carries a score in `0..=100`, updated as an exponential moving
//! average of probe samples:
//!
//! ```text
//! score = score * (1 - alpha) + sample * alpha
//! ```
//!
//! A probe that answers within `slow_threshold` samples 100; slower answers
//! scale linearly down to 50 at the probe timeout; failures and timeouts
//! sample 0. With the default `alpha = 0.3`, one failure takes a fresh
//! connection from 100 to 70 and a second one to 49.

use std::sync::Weak;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::Connection;
use crate::error::Error;
use crate::pool::PoolInner;

/// Highest possible score
pub const MAX_SCORE: f64 = 100.0;

/// Sample recorded for a slow probe that only just made its deadline
const SLOWEST_SUCCESS: f64 = 50.0;

/// Why a probe did not count as a success. Never leaves the crate.
#[derive(Debug, thiserror::Error)]
pub(crate) enum HealthCheckFailure {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("probe failed: {0}")]
    Probe(#[source] Error),
}

/// Score sample for a successful probe that took `latency`
pub fn probe_sample(latency: Duration, slow_threshold: Duration, timeout: Duration) -> f64 {
    if latency <= slow_threshold {
        return MAX_SCORE;
    }
    let span = timeout.saturating_sub(slow_threshold).as_secs_f64();
    if span <= 0.0 {
        return SLOWEST_SUCCESS;
    }
    let over = (latency - slow_threshold).as_secs_f64();
    let fraction = (over / span).min(1.0);
    MAX_SCORE - (MAX_SCORE - SLOWEST_SUCCESS) * fraction
}

/// Fold a sample into a score
pub fn apply_sample(score: f64, sample: f64, alpha: f64) -> f64 {
    (score * (1.0 - alpha) + sample * alpha).clamp(0.0, MAX_SCORE)
}

/// Run one probe, bounded by `timeout`. Returns the round-trip latency.
pub(crate) async fn probe(
    conn: &dyn Connection,
    query: &str,
    timeout: Duration,
) -> std::result::Result<Duration, HealthCheckFailure> {
    let start = Instant::now();
    match tokio::time::timeout(timeout, conn.ping(query)).await {
        Ok(Ok(())) => Ok(start.elapsed()),
        Ok(Err(e)) => Err(HealthCheckFailure::Probe(e)),
        Err(_) => Err(HealthCheckFailure::Timeout(timeout)),
    }
}

/// Health monitor loop. Exits on cancellation or once the pool is dropped.
pub(crate) async fn run(pool: Weak<PoolInner>, cancel: CancellationToken, interval: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(pool) = pool.upgrade() else { break };
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = pool.health_tick() => {}
        }
    }

    debug!("Health monitor stopped");
}
