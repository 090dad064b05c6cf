//! Pool metrics
//!
//! Two layers:
//! - [`MetricsCollector`]: per-pool counters and latency windows, read via
//!   [`MetricsCollector::snapshot`] and exported with [`render_prometheus`].
//! - [`PoolMetrics`]: mirrors every event to the `metrics` crate facade, so an
//!   installed recorder (e.g. a Prometheus exporter) sees them too. Without a
//!   recorder these calls are no-ops.
//!
//! # Metric Naming Convention
//!
//! All metrics follow the pattern `kailash_pool_{name}_{unit}`.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::breaker::CircuitState;
use crate::error::ErrorCategory;
use crate::pool::PoolStatsSnapshot;
use crate::record::RecycleReason;
use crate::types::QueryType;

// ============================================================================
// Facade
// ============================================================================

/// Process-wide metrics emitted through the `metrics` facade
pub struct PoolMetrics;

impl PoolMetrics {
    /// Physical connection opened
    pub fn increment_connections_created() {
        metrics::counter!("kailash_pool_connections_created_total").increment(1);
    }

    /// Physical connection closed
    pub fn increment_connections_destroyed() {
        metrics::counter!("kailash_pool_connections_destroyed_total").increment(1);
    }

    /// Physical connection could not be opened
    pub fn increment_connection_failures() {
        metrics::counter!("kailash_pool_connection_failures_total").increment(1);
    }

    /// Connection recycled
    pub fn increment_recycled(reason: RecycleReason) {
        metrics::counter!("kailash_pool_connections_recycled_total", "reason" => reason.as_str())
            .increment(1);
    }

    /// Acquire wait exceeded its timeout
    pub fn increment_exhausted() {
        metrics::counter!("kailash_pool_exhausted_total").increment(1);
    }

    /// Call rejected by the circuit breaker
    pub fn increment_circuit_rejections() {
        metrics::counter!("kailash_pool_circuit_rejections_total").increment(1);
    }

    /// Circuit breaker changed state
    pub fn record_circuit_transition(state: CircuitState) {
        metrics::counter!("kailash_pool_circuit_transitions_total", "to" => state.as_str())
            .increment(1);
        metrics::gauge!("kailash_pool_circuit_state").set(state as u8 as f64);
    }

    /// Health probe ran
    pub fn increment_health_checks(failed: bool) {
        metrics::counter!("kailash_pool_health_checks_total").increment(1);
        if failed {
            metrics::counter!("kailash_pool_health_check_failures_total").increment(1);
        }
    }

    /// Acquire latency
    pub fn record_acquire_latency(elapsed: Duration) {
        metrics::counter!("kailash_pool_acquisitions_total").increment(1);
        metrics::histogram!("kailash_pool_acquire_duration_seconds").record(elapsed.as_secs_f64());
    }

    /// Query executed
    pub fn record_query(elapsed: Duration, query_type: QueryType, error: Option<ErrorCategory>) {
        metrics::counter!("kailash_pool_queries_total", "type" => query_type.as_str()).increment(1);
        metrics::histogram!("kailash_pool_query_duration_seconds", "type" => query_type.as_str())
            .record(elapsed.as_secs_f64());
        if let Some(category) = error {
            metrics::counter!("kailash_pool_errors_total", "category" => category.to_string())
                .increment(1);
        }
    }

    /// Current pool occupancy
    pub fn set_pool_size(active: usize, idle: usize, target: usize) {
        metrics::gauge!("kailash_pool_connections", "state" => "active").set(active as f64);
        metrics::gauge!("kailash_pool_connections", "state" => "idle").set(idle as f64);
        metrics::gauge!("kailash_pool_target_size").set(target as f64);
    }
}

// ============================================================================
// Collector
// ============================================================================

/// Latency distribution over the retention window
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistogramSummary {
    /// Samples in the window, at most [`MAX_WINDOW_SAMPLES`]
    pub window_count: u64,
    /// Samples since creation (or last clear)
    pub count: u64,
    /// Sum of all samples since creation, in seconds
    pub sum_seconds: f64,
    /// Minimum in the window
    pub min: Duration,
    /// Maximum in the window
    pub max: Duration,
    /// Mean in the window
    pub mean: Duration,
    /// Median
    pub p50: Duration,
    /// 95th percentile
    pub p95: Duration,
    /// 99th percentile
    pub p99: Duration,
}

/// Most recent samples kept per latency window
pub const MAX_WINDOW_SAMPLES: usize = 10_000;

/// Timestamped samples pruned to a retention window and capped at
/// [`MAX_WINDOW_SAMPLES`] (oldest evicted first), plus cumulative totals
#[derive(Debug)]
struct LatencyWindow {
    samples: Mutex<VecDeque<Sample>>,
    count: AtomicU64,
    sum_micros: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    elapsed: Duration,
    ok: bool,
}

impl LatencyWindow {
    fn new() -> Self {
        Self {
            samples: Mutex::new(VecDeque::new()),
            count: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
        }
    }

    fn record(&self, now: Instant, elapsed: Duration, ok: bool, retention: Duration) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        let mut samples = self.samples.lock();
        if samples.len() >= MAX_WINDOW_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(Sample { at: now, elapsed, ok });
        prune(&mut samples, now, retention);
    }

    /// (summary, failures in window)
    fn summarize(&self, now: Instant, retention: Duration) -> (HistogramSummary, u64) {
        let (mut values, failures) = {
            let mut samples = self.samples.lock();
            prune(&mut samples, now, retention);
            let values: Vec<Duration> = samples.iter().map(|s| s.elapsed).collect();
            let failures = samples.iter().filter(|s| !s.ok).count() as u64;
            (values, failures)
        };

        let mut summary = HistogramSummary {
            count: self.count.load(Ordering::Relaxed),
            sum_seconds: self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            ..Default::default()
        };
        if values.is_empty() {
            return (summary, failures);
        }

        values.sort_unstable();
        let percentile = |p: f64| -> Duration {
            let idx = ((p / 100.0) * (values.len() - 1) as f64).round() as usize;
            values[idx.min(values.len() - 1)]
        };

        let total_nanos: u128 = values.iter().map(Duration::as_nanos).sum();
        summary.window_count = values.len() as u64;
        summary.min = values[0];
        summary.max = values[values.len() - 1];
        summary.mean = Duration::from_nanos((total_nanos / values.len() as u128) as u64);
        summary.p50 = percentile(50.0);
        summary.p95 = percentile(95.0);
        summary.p99 = percentile(99.0);
        (summary, failures)
    }

    fn clear(&self) {
        self.samples.lock().clear();
        self.count.store(0, Ordering::Relaxed);
        self.sum_micros.store(0, Ordering::Relaxed);
    }
}

fn prune(samples: &mut VecDeque<Sample>, now: Instant, retention: Duration) {
    while let Some(oldest) = samples.front() {
        if now.saturating_duration_since(oldest.at) > retention {
            samples.pop_front();
        } else {
            break;
        }
    }
}

fn bump<K: Eq + Hash>(map: &DashMap<K, u64>, key: K) {
    *map.entry(key).or_insert(0) += 1;
}

fn collect<K: Eq + Hash + Copy>(map: &DashMap<K, u64>) -> HashMap<K, u64> {
    map.iter().map(|e| (*e.key(), *e.value())).collect()
}

/// Point-in-time metrics view
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    /// Physical connections opened
    pub connections_created: u64,
    /// Physical connections closed
    pub connections_destroyed: u64,
    /// Connection creation failures
    pub connection_failures: u64,
    /// Recycled connections by reason
    pub recycled: HashMap<RecycleReason, u64>,
    /// Successful acquisitions
    pub acquisitions: u64,
    /// Releases
    pub releases: u64,
    /// Acquire timeouts
    pub exhausted: u64,
    /// Errors by category
    pub errors: HashMap<ErrorCategory, u64>,
    /// Calls rejected by the circuit breaker
    pub circuit_rejections: u64,
    /// Queries by statement type
    pub queries: HashMap<QueryType, u64>,
    /// Health probes run
    pub health_checks: u64,
    /// Health probes that failed or timed out
    pub health_check_failures: u64,
    /// Acquire latency
    pub acquire_latency: HistogramSummary,
    /// Query latency
    pub query_latency: HistogramSummary,
    /// Queries per second over the retention window
    pub queries_per_second: f64,
    /// Failed / total queries over the retention window
    pub error_rate: f64,
}

impl MetricsSnapshot {
    /// Total queries executed
    pub fn total_queries(&self) -> u64 {
        self.queries.values().sum()
    }

    /// Total errors recorded
    pub fn total_errors(&self) -> u64 {
        self.errors.values().sum()
    }
}

/// Per-pool metrics collector
#[derive(Debug)]
pub struct MetricsCollector {
    retention: Duration,
    since: Mutex<Instant>,
    connections_created: AtomicU64,
    connections_destroyed: AtomicU64,
    connection_failures: AtomicU64,
    releases: AtomicU64,
    exhausted: AtomicU64,
    circuit_rejections: AtomicU64,
    health_checks: AtomicU64,
    health_check_failures: AtomicU64,
    recycled: DashMap<RecycleReason, u64>,
    errors: DashMap<ErrorCategory, u64>,
    queries: DashMap<QueryType, u64>,
    acquire_latency: LatencyWindow,
    query_latency: LatencyWindow,
}

impl MetricsCollector {
    /// Create a collector keeping latency samples for `retention`
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            since: Mutex::new(Instant::now()),
            connections_created: AtomicU64::new(0),
            connections_destroyed: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
            circuit_rejections: AtomicU64::new(0),
            health_checks: AtomicU64::new(0),
            health_check_failures: AtomicU64::new(0),
            recycled: DashMap::new(),
            errors: DashMap::new(),
            queries: DashMap::new(),
            acquire_latency: LatencyWindow::new(),
            query_latency: LatencyWindow::new(),
        }
    }

    /// Retention window
    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Record a successful acquisition and how long it waited
    pub fn record_acquisition(&self, elapsed: Duration) {
        self.acquire_latency
            .record(Instant::now(), elapsed, true, self.retention);
        PoolMetrics::record_acquire_latency(elapsed);
    }

    /// Record one executed query
    pub fn record_query(
        &self,
        elapsed: Duration,
        query_type: QueryType,
        success: bool,
        error_category: Option<ErrorCategory>,
    ) {
        bump(&self.queries, query_type);
        let category = if success {
            None
        } else {
            Some(error_category.unwrap_or(ErrorCategory::Other))
        };
        if let Some(category) = category {
            bump(&self.errors, category);
        }
        self.query_latency
            .record(Instant::now(), elapsed, success, self.retention);
        PoolMetrics::record_query(elapsed, query_type, category);
    }

    /// Record an error that did not come from a query (e.g. exhaustion)
    pub fn record_error(&self, category: ErrorCategory) {
        bump(&self.errors, category);
        match category {
            ErrorCategory::PoolExhausted => {
                self.exhausted.fetch_add(1, Ordering::Relaxed);
                PoolMetrics::increment_exhausted();
            }
            ErrorCategory::CircuitOpen => {
                self.circuit_rejections.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    /// Physical connection opened
    pub fn record_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
        PoolMetrics::increment_connections_created();
    }

    /// Physical connection could not be opened
    pub fn record_connection_failure(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        bump(&self.errors, ErrorCategory::Connection);
        PoolMetrics::increment_connection_failures();
    }

    /// Physical connection closed
    pub fn record_destroyed(&self) {
        self.connections_destroyed.fetch_add(1, Ordering::Relaxed);
        PoolMetrics::increment_connections_destroyed();
    }

    /// Connection recycled
    pub fn record_recycled(&self, reason: RecycleReason) {
        bump(&self.recycled, reason);
        PoolMetrics::increment_recycled(reason);
    }

    /// Connection returned
    pub fn record_release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    /// Health probe ran
    pub fn record_health_check(&self, failed: bool) {
        self.health_checks.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.health_check_failures.fetch_add(1, Ordering::Relaxed);
        }
        PoolMetrics::increment_health_checks(failed);
    }

    /// Point-in-time snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = Instant::now();
        let (acquire_latency, _) = self.acquire_latency.summarize(now, self.retention);
        let (query_latency, failed) = self.query_latency.summarize(now, self.retention);

        let observed = now
            .saturating_duration_since(*self.since.lock())
            .min(self.retention);
        let queries_per_second = if observed.is_zero() {
            0.0
        } else {
            query_latency.window_count as f64 / observed.as_secs_f64()
        };
        let error_rate = if query_latency.window_count == 0 {
            0.0
        } else {
            failed as f64 / query_latency.window_count as f64
        };

        MetricsSnapshot {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_destroyed: self.connections_destroyed.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            recycled: collect(&self.recycled),
            acquisitions: acquire_latency.count,
            releases: self.releases.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            errors: collect(&self.errors),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            queries: collect(&self.queries),
            health_checks: self.health_checks.load(Ordering::Relaxed),
            health_check_failures: self.health_check_failures.load(Ordering::Relaxed),
            acquire_latency,
            query_latency,
            queries_per_second,
            error_rate,
        }
    }

    /// Reset all counters and windows
    pub fn clear(&self) {
        *self.since.lock() = Instant::now();
        for counter in [
            &self.connections_created,
            &self.connections_destroyed,
            &self.connection_failures,
            &self.releases,
            &self.exhausted,
            &self.circuit_rejections,
            &self.health_checks,
            &self.health_check_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.recycled.clear();
        self.errors.clear();
        self.queries.clear();
        self.acquire_latency.clear();
        self.query_latency.clear();
    }
}

// ============================================================================
// Prometheus exposition
// ============================================================================

fn header(output: &mut String, name: &str, help: &str, kind: &str) {
    output.push_str(&format!("# HELP {name} {help}\n"));
    output.push_str(&format!("# TYPE {name} {kind}\n"));
}

fn summary(output: &mut String, name: &str, help: &str, h: &HistogramSummary) {
    header(output, name, help, "summary");
    for (quantile, value) in [("0.5", h.p50), ("0.95", h.p95), ("0.99", h.p99)] {
        output.push_str(&format!(
            "{name}{{quantile=\"{quantile}\"}} {}\n",
            value.as_secs_f64()
        ));
    }
    output.push_str(&format!("{name}_sum {}\n", h.sum_seconds));
    output.push_str(&format!("{name}_count {}\n", h.count));
}

/// Render a Prometheus text exposition of a metrics snapshot and pool stats
pub fn render_prometheus(snapshot: &MetricsSnapshot, stats: &PoolStatsSnapshot) -> String {
    let mut output = String::with_capacity(4096);

    header(
        &mut output,
        "kailash_pool_connections",
        "Current connections by state",
        "gauge",
    );
    output.push_str(&format!(
        "kailash_pool_connections{{state=\"active\"}} {}\n",
        stats.active
    ));
    output.push_str(&format!(
        "kailash_pool_connections{{state=\"idle\"}} {}\n",
        stats.idle
    ));

    header(
        &mut output,
        "kailash_pool_size",
        "Total connections owned by the pool",
        "gauge",
    );
    output.push_str(&format!("kailash_pool_size {}\n", stats.total));

    header(
        &mut output,
        "kailash_pool_target_size",
        "Adaptive sizer target",
        "gauge",
    );
    output.push_str(&format!("kailash_pool_target_size {}\n", stats.target_size));

    header(
        &mut output,
        "kailash_pool_max_size",
        "Configured maximum connections",
        "gauge",
    );
    output.push_str(&format!("kailash_pool_max_size {}\n", stats.max_connections));

    header(
        &mut output,
        "kailash_pool_circuit_state",
        "Circuit breaker state (0 closed, 1 open, 2 half-open)",
        "gauge",
    );
    output.push_str(&format!(
        "kailash_pool_circuit_state {}\n",
        stats.breaker.state as u8
    ));

    header(
        &mut output,
        "kailash_pool_connection_health",
        "Health score per connection (0-100)",
        "gauge",
    );
    for conn in &stats.connections {
        output.push_str(&format!(
            "kailash_pool_connection_health{{connection_id=\"{}\"}} {:.1}\n",
            conn.id.as_u64(),
            conn.health
        ));
    }

    for (name, help, value) in [
        (
            "kailash_pool_connections_created_total",
            "Physical connections opened",
            snapshot.connections_created,
        ),
        (
            "kailash_pool_connections_destroyed_total",
            "Physical connections closed",
            snapshot.connections_destroyed,
        ),
        (
            "kailash_pool_connection_failures_total",
            "Physical connections that could not be opened",
            snapshot.connection_failures,
        ),
        (
            "kailash_pool_acquisitions_total",
            "Successful acquisitions",
            snapshot.acquisitions,
        ),
        (
            "kailash_pool_releases_total",
            "Connections returned to the pool",
            snapshot.releases,
        ),
        (
            "kailash_pool_exhausted_total",
            "Acquisitions that timed out",
            snapshot.exhausted,
        ),
        (
            "kailash_pool_circuit_rejections_total",
            "Calls rejected by the circuit breaker",
            snapshot.circuit_rejections,
        ),
        (
            "kailash_pool_health_checks_total",
            "Health probes run",
            snapshot.health_checks,
        ),
        (
            "kailash_pool_health_check_failures_total",
            "Health probes that failed or timed out",
            snapshot.health_check_failures,
        ),
    ] {
        header(&mut output, name, help, "counter");
        output.push_str(&format!("{name} {value}\n"));
    }

    header(
        &mut output,
        "kailash_pool_connections_recycled_total",
        "Connections recycled by reason",
        "counter",
    );
    for reason in RecycleReason::ALL {
        output.push_str(&format!(
            "kailash_pool_connections_recycled_total{{reason=\"{}\"}} {}\n",
            reason,
            snapshot.recycled.get(&reason).copied().unwrap_or(0)
        ));
    }

    header(
        &mut output,
        "kailash_pool_errors_total",
        "Errors by category",
        "counter",
    );
    for category in ErrorCategory::ALL {
        if let Some(count) = snapshot.errors.get(&category) {
            output.push_str(&format!(
                "kailash_pool_errors_total{{category=\"{category}\"}} {count}\n"
            ));
        }
    }

    header(
        &mut output,
        "kailash_pool_queries_total",
        "Queries executed by statement type",
        "counter",
    );
    let mut by_type: Vec<_> = snapshot.queries.iter().collect();
    by_type.sort_by_key(|(t, _)| t.as_str());
    for (query_type, count) in by_type {
        output.push_str(&format!(
            "kailash_pool_queries_total{{type=\"{query_type}\"}} {count}\n"
        ));
    }

    header(
        &mut output,
        "kailash_pool_queries_per_second",
        "Query throughput over the retention window",
        "gauge",
    );
    output.push_str(&format!(
        "kailash_pool_queries_per_second {:.3}\n",
        snapshot.queries_per_second
    ));

    header(
        &mut output,
        "kailash_pool_error_rate",
        "Failed query ratio over the retention window",
        "gauge",
    );
    output.push_str(&format!(
        "kailash_pool_error_rate {:.4}\n",
        snapshot.error_rate
    ));

    summary(
        &mut output,
        "kailash_pool_acquire_duration_seconds",
        "Time spent waiting for a connection",
        &snapshot.acquire_latency,
    );
    summary(
        &mut output,
        "kailash_pool_query_duration_seconds",
        "Query execution time",
        &snapshot.query_latency,
    );

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_percentiles() {
        let collector = MetricsCollector::new(Duration::from_secs(3600));
        for ms in 1..=100 {
            collector.record_query(
                Duration::from_millis(ms),
                QueryType::Select,
                true,
                None,
            );
        }

        let snapshot = collector.snapshot();
        let latency = &snapshot.query_latency;
        assert_eq!(latency.window_count, 100);
        assert_eq!(latency.min, Duration::from_millis(1));
        assert_eq!(latency.max, Duration::from_millis(100));
        // idx = round(p * 99)
        assert_eq!(latency.p50.as_millis(), 51);
        assert_eq!(latency.p95.as_millis(), 95);
        assert_eq!(latency.p99.as_millis(), 99);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_keeps_only_recent_samples() {
        let collector = MetricsCollector::new(Duration::from_secs(3600));
        let total = MAX_WINDOW_SAMPLES * 3;
        for i in 0..total {
            // the slow tail comes last and must survive eviction
            let elapsed = if i < total - 100 {
                Duration::from_millis(1)
            } else {
                Duration::from_millis(500)
            };
            let ok = i < MAX_WINDOW_SAMPLES;
            collector.record_query(elapsed, QueryType::Select, ok, None);
        }

        let snapshot = collector.snapshot();
        let latency = &snapshot.query_latency;
        assert_eq!(latency.window_count, MAX_WINDOW_SAMPLES as u64);
        assert_eq!(latency.count, total as u64);
        assert_eq!(latency.max, Duration::from_millis(500));
        assert_eq!(latency.p50, Duration::from_millis(1));
        // every early success was evicted
        assert!((snapshot.error_rate - 1.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention_prunes_percentiles_not_counters() {
        let collector = MetricsCollector::new(Duration::from_secs(60));
        collector.record_query(Duration::from_millis(500), QueryType::Select, true, None);
        tokio::time::advance(Duration::from_secs(61)).await;
        collector.record_query(Duration::from_millis(5), QueryType::Insert, true, None);

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.query_latency.window_count, 1);
        assert_eq!(snapshot.query_latency.p99, Duration::from_millis(5));
        assert_eq!(snapshot.query_latency.count, 2);
        assert_eq!(snapshot.total_queries(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_rate_and_qps() {
        let collector = MetricsCollector::new(Duration::from_secs(60));
        tokio::time::advance(Duration::from_secs(10)).await;
        for i in 0..10 {
            let ok = i % 5 != 0;
            collector.record_query(
                Duration::from_millis(2),
                QueryType::Update,
                ok,
                (!ok).then_some(ErrorCategory::Timeout),
            );
        }

        let snapshot = collector.snapshot();
        assert!((snapshot.error_rate - 0.2).abs() < 1e-9);
        assert!((snapshot.queries_per_second - 1.0).abs() < 1e-9);
        assert_eq!(snapshot.errors.get(&ErrorCategory::Timeout), Some(&2));
        assert_eq!(snapshot.queries.get(&QueryType::Update), Some(&10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_resets_everything() {
        let collector = MetricsCollector::new(Duration::from_secs(60));
        collector.record_created();
        collector.record_acquisition(Duration::from_millis(3));
        collector.record_recycled(RecycleReason::Unhealthy);
        collector.record_error(ErrorCategory::PoolExhausted);
        collector.clear();

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.connections_created, 0);
        assert_eq!(snapshot.acquisitions, 0);
        assert_eq!(snapshot.exhausted, 0);
        assert!(snapshot.recycled.is_empty());
        assert!(snapshot.errors.is_empty());
    }

    #[test]
    fn test_empty_summary_is_zero() {
        let window = LatencyWindow::new();
        let (summary, failures) = window.summarize(Instant::now(), Duration::from_secs(1));
        assert_eq!(summary, HistogramSummary::default());
        assert_eq!(failures, 0);
    }
}
