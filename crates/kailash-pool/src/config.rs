//! Pool configuration
//!
//! [`PoolConfig`] is an explicit, validated struct. It can be built in code
//! with the fluent `with_*` setters or loaded from YAML, where durations use
//! humantime notation (`"30s"`, `"10m"`) and `${VAR}` / `${VAR:-default}`
//! references are expanded from the environment before parsing.
//!
//! ```yaml
//! database_type: postgresql
//! host: ${DB_HOST:-localhost}
//! database: orders
//! username: app
//! password: ${DB_PASSWORD}
//! min_connections: 2
//! max_connections: 20
//! health_check_interval: 15s
//! adaptive_sizing: true
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use crate::connection::{ConnectionConfig, DatabaseType};
use crate::error::{Error, Result};

/// `${NAME}` or `${NAME:-fallback}`
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("static placeholder pattern")
});

/// Pool configuration (immutable once the pool is initialized)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Connection target
    #[serde(flatten)]
    pub connection: ConnectionConfig,

    /// Minimum number of connections kept open
    #[serde(default = "default_min_connections")]
    pub min_connections: usize,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Default wait for `acquire()`
    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,

    /// Health score (0-100) below which a connection is recycled
    #[serde(default = "default_health_threshold")]
    pub health_threshold: f64,

    /// Health monitor cadence
    #[serde(default = "default_health_check_interval", with = "humantime_serde")]
    pub health_check_interval: Duration,

    /// Probe statement
    #[serde(default = "default_probe_query")]
    pub health_check_query: String,

    /// Probe deadline; a probe that exceeds it counts as failed
    #[serde(default = "default_probe_timeout", with = "humantime_serde")]
    pub health_check_timeout: Duration,

    /// Maximum connection age
    #[serde(default = "default_max_lifetime", with = "humantime_serde")]
    pub max_lifetime: Duration,

    /// Maximum idle time before a connection is recycled
    #[serde(default = "default_max_idle_time", with = "humantime_serde")]
    pub max_idle_time: Duration,

    /// Open `min_connections` during initialization
    #[serde(default = "default_true")]
    pub pre_warm: bool,

    /// Run the adaptive sizer
    #[serde(default)]
    pub adaptive_sizing: bool,

    /// Consecutive failures that open the circuit breaker
    #[serde(default = "default_failure_threshold")]
    pub circuit_breaker_failure_threshold: u64,

    /// Delay before an open breaker lets a trial call through
    #[serde(default = "default_recovery_timeout", with = "humantime_serde")]
    pub circuit_breaker_recovery_timeout: Duration,

    /// Rolling error rate (0-1] that opens the breaker
    #[serde(default = "default_error_rate")]
    pub circuit_breaker_error_rate: f64,

    /// Window for latency percentiles
    #[serde(default = "default_metrics_retention_minutes")]
    pub metrics_retention_minutes: u64,

    /// Allow query pipelines on this pool
    #[serde(default)]
    pub enable_pipelining: bool,

    /// Queries per pipeline batch
    #[serde(default = "default_pipeline_batch_size")]
    pub pipeline_batch_size: usize,

    /// Health probe tuning
    #[serde(default)]
    pub health: HealthSettings,

    /// Adaptive sizer tuning
    #[serde(default)]
    pub sizing: SizingSettings,

    /// Circuit breaker tuning
    #[serde(default)]
    pub breaker: BreakerSettings,

    /// Pipeline tuning
    #[serde(default)]
    pub pipeline: PipelineSettings,
}

/// Health monitor tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    /// Probes slower than this score below 100
    #[serde(default = "default_slow_probe", with = "humantime_serde")]
    pub slow_threshold: Duration,
    /// EMA smoothing factor in (0, 1]
    #[serde(default = "default_smoothing")]
    pub smoothing: f64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            slow_threshold: default_slow_probe(),
            smoothing: default_smoothing(),
        }
    }
}

/// Adaptive sizer tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingSettings {
    /// Utilization above which the target grows
    #[serde(default = "default_high_water")]
    pub high_water: f64,
    /// Utilization below which the target shrinks
    #[serde(default = "default_low_water")]
    pub low_water: f64,
    /// Consecutive samples beyond a mark before acting
    #[serde(default = "default_sustain_samples")]
    pub sustain_samples: u32,
    /// Connections added per growth step
    #[serde(default = "default_grow_step")]
    pub grow_step: usize,
    /// Connections removed per shrink step
    #[serde(default = "default_shrink_step")]
    pub shrink_step: usize,
    /// Minimum time between two adjustments
    #[serde(default = "default_cooldown", with = "humantime_serde")]
    pub cooldown: Duration,
    /// Sampling cadence
    #[serde(default = "default_sizing_interval", with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for SizingSettings {
    fn default() -> Self {
        Self {
            high_water: default_high_water(),
            low_water: default_low_water(),
            sustain_samples: default_sustain_samples(),
            grow_step: default_grow_step(),
            shrink_step: default_shrink_step(),
            cooldown: default_cooldown(),
            interval: default_sizing_interval(),
        }
    }
}

/// Circuit breaker tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Outcomes required in the window before the error rate is evaluated
    #[serde(default = "default_min_calls")]
    pub min_calls: u64,
    /// Rolling error-rate window
    #[serde(default = "default_error_window", with = "humantime_serde")]
    pub window: Duration,
    /// Successful trials that close a half-open breaker
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u64,
    /// Concurrent trials allowed while half-open
    #[serde(default = "default_half_open_calls")]
    pub half_open_max_calls: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            min_calls: default_min_calls(),
            window: default_error_window(),
            success_threshold: default_success_threshold(),
            half_open_max_calls: default_half_open_calls(),
        }
    }
}

/// Pipeline execution strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// Every query runs independently
    #[default]
    BestEffort,
    /// One transaction; any failure rolls back the batch
    Transactional,
    /// Enqueue order, stop at first failure
    Sequential,
    /// Read-only queries run concurrently
    Parallel,
}

impl std::fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BestEffort => write!(f, "best_effort"),
            Self::Transactional => write!(f, "transactional"),
            Self::Sequential => write!(f, "sequential"),
            Self::Parallel => write!(f, "parallel"),
        }
    }
}

/// Pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Flush this long after the first query of a batch was enqueued
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,
    /// Execution strategy
    #[serde(default)]
    pub strategy: ExecutionStrategy,
    /// Concurrency cap for the parallel strategy
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            flush_interval: default_flush_interval(),
            strategy: ExecutionStrategy::default(),
            max_parallelism: default_max_parallelism(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_min_connections() -> usize {
    2
}

fn default_max_connections() -> usize {
    10
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_health_threshold() -> f64 {
    50.0
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_max_lifetime() -> Duration {
    Duration::from_secs(1800) // 30 minutes
}

fn default_max_idle_time() -> Duration {
    Duration::from_secs(600) // 10 minutes
}

fn default_failure_threshold() -> u64 {
    5
}

fn default_recovery_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_error_rate() -> f64 {
    0.5
}

/// One week
const MAX_METRICS_RETENTION_MINUTES: u64 = 7 * 24 * 60;

fn default_metrics_retention_minutes() -> u64 {
    60
}

fn default_pipeline_batch_size() -> usize {
    100
}

fn default_probe_query() -> String {
    "SELECT 1".to_string()
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_slow_probe() -> Duration {
    Duration::from_millis(250)
}

fn default_smoothing() -> f64 {
    0.3
}

fn default_high_water() -> f64 {
    0.8
}

fn default_low_water() -> f64 {
    0.3
}

fn default_sustain_samples() -> u32 {
    3
}

fn default_grow_step() -> usize {
    2
}

fn default_shrink_step() -> usize {
    1
}

fn default_cooldown() -> Duration {
    Duration::from_secs(30)
}

fn default_sizing_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_min_calls() -> u64 {
    10
}

fn default_error_window() -> Duration {
    Duration::from_secs(60)
}

fn default_success_threshold() -> u64 {
    1
}

fn default_half_open_calls() -> u64 {
    1
}

fn default_flush_interval() -> Duration {
    Duration::from_millis(50)
}

fn default_max_parallelism() -> usize {
    4
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            min_connections: default_min_connections(),
            max_connections: default_max_connections(),
            acquire_timeout: default_acquire_timeout(),
            health_threshold: default_health_threshold(),
            health_check_interval: default_health_check_interval(),
            health_check_query: default_probe_query(),
            health_check_timeout: default_probe_timeout(),
            max_lifetime: default_max_lifetime(),
            max_idle_time: default_max_idle_time(),
            pre_warm: true,
            adaptive_sizing: false,
            circuit_breaker_failure_threshold: default_failure_threshold(),
            circuit_breaker_recovery_timeout: default_recovery_timeout(),
            circuit_breaker_error_rate: default_error_rate(),
            metrics_retention_minutes: default_metrics_retention_minutes(),
            enable_pipelining: false,
            pipeline_batch_size: default_pipeline_batch_size(),
            health: HealthSettings::default(),
            sizing: SizingSettings::default(),
            breaker: BreakerSettings::default(),
            pipeline: PipelineSettings::default(),
        }
    }
}

impl PoolConfig {
    /// Create pool config for a connection target
    pub fn new(connection: ConnectionConfig) -> Self {
        Self {
            connection,
            ..Default::default()
        }
    }

    /// Start a validating builder
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::default()
    }

    /// Create pool config from a connection URL
    pub fn from_url(url: &str) -> Result<Self> {
        Ok(Self::new(ConnectionConfig::from_url(url)?))
    }

    /// Parse YAML, expanding `${VAR}` / `${VAR:-default}` first
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let expanded = expand_env_vars(yaml);
        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| Error::config(format!("invalid pool configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, expand and validate a YAML configuration file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read config file {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Backend type
    pub fn database_type(&self) -> DatabaseType {
        self.connection.database_type
    }

    /// Percentile window
    pub fn metrics_retention(&self) -> Duration {
        Duration::from_secs(self.metrics_retention_minutes.saturating_mul(60))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.min_connections == 0 {
            return Err(Error::config("min_connections must be positive"));
        }
        if self.min_connections > self.max_connections {
            return Err(Error::config(format!(
                "min_connections ({}) must not exceed max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if !(0.0..=100.0).contains(&self.health_threshold) {
            return Err(Error::config(format!(
                "health_threshold must be within 0..=100, got {}",
                self.health_threshold
            )));
        }
        if self.health_check_interval.is_zero() {
            return Err(Error::config("health_check_interval must be non-zero"));
        }
        if self.health_check_timeout.is_zero() {
            return Err(Error::config("health_check_timeout must be non-zero"));
        }
        if !(self.health.smoothing > 0.0 && self.health.smoothing <= 1.0) {
            return Err(Error::config("health.smoothing must be within (0, 1]"));
        }
        if self.circuit_breaker_failure_threshold == 0 {
            return Err(Error::config(
                "circuit_breaker_failure_threshold must be positive",
            ));
        }
        if !(self.circuit_breaker_error_rate > 0.0 && self.circuit_breaker_error_rate <= 1.0) {
            return Err(Error::config(
                "circuit_breaker_error_rate must be within (0, 1]",
            ));
        }
        if self.breaker.success_threshold == 0 || self.breaker.half_open_max_calls == 0 {
            return Err(Error::config(
                "breaker success_threshold and half_open_max_calls must be positive",
            ));
        }
        if self.metrics_retention_minutes == 0
            || self.metrics_retention_minutes > MAX_METRICS_RETENTION_MINUTES
        {
            return Err(Error::config(format!(
                "metrics_retention_minutes must be between 1 and {MAX_METRICS_RETENTION_MINUTES}"
            )));
        }
        if self.pipeline_batch_size == 0 {
            return Err(Error::config("pipeline_batch_size must be positive"));
        }
        if self.pipeline.max_parallelism == 0 {
            return Err(Error::config("pipeline.max_parallelism must be positive"));
        }
        if self.sizing.low_water >= self.sizing.high_water
            || self.sizing.low_water < 0.0
            || self.sizing.high_water > 1.0
        {
            return Err(Error::config(
                "sizing marks must satisfy 0 <= low_water < high_water <= 1",
            ));
        }
        if self.sizing.grow_step == 0 || self.sizing.shrink_step == 0 {
            return Err(Error::config("sizing steps must be positive"));
        }
        if self.sizing.interval.is_zero() {
            return Err(Error::config("sizing.interval must be non-zero"));
        }
        Ok(())
    }

    /// Set minimum pool size
    pub fn with_min_connections(mut self, size: usize) -> Self {
        self.min_connections = size;
        self
    }

    /// Set maximum pool size
    pub fn with_max_connections(mut self, size: usize) -> Self {
        self.max_connections = size;
        self
    }

    /// Set acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set health threshold
    pub fn with_health_threshold(mut self, threshold: f64) -> Self {
        self.health_threshold = threshold;
        self
    }

    /// Set health check interval
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Set the probe statement and deadline
    pub fn with_health_check(mut self, query: impl Into<String>, timeout: Duration) -> Self {
        self.health_check_query = query.into();
        self.health_check_timeout = timeout;
        self
    }

    /// Set maximum connection lifetime
    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    /// Set maximum idle time
    pub fn with_max_idle_time(mut self, idle: Duration) -> Self {
        self.max_idle_time = idle;
        self
    }

    /// Enable/disable pre-warming
    pub fn with_pre_warm(mut self, pre_warm: bool) -> Self {
        self.pre_warm = pre_warm;
        self
    }

    /// Enable/disable adaptive sizing
    pub fn with_adaptive_sizing(mut self, enabled: bool) -> Self {
        self.adaptive_sizing = enabled;
        self
    }

    /// Set circuit breaker thresholds
    pub fn with_circuit_breaker(
        mut self,
        failure_threshold: u64,
        recovery_timeout: Duration,
        error_rate: f64,
    ) -> Self {
        self.circuit_breaker_failure_threshold = failure_threshold;
        self.circuit_breaker_recovery_timeout = recovery_timeout;
        self.circuit_breaker_error_rate = error_rate;
        self
    }

    /// Set metrics retention
    pub fn with_metrics_retention_minutes(mut self, minutes: u64) -> Self {
        self.metrics_retention_minutes = minutes;
        self
    }

    /// Enable pipelining with the given batch size
    pub fn with_pipelining(mut self, batch_size: usize) -> Self {
        self.enable_pipelining = true;
        self.pipeline_batch_size = batch_size;
        self
    }

    /// Replace health probe tuning
    pub fn with_health_settings(mut self, health: HealthSettings) -> Self {
        self.health = health;
        self
    }

    /// Replace adaptive sizer tuning
    pub fn with_sizing_settings(mut self, sizing: SizingSettings) -> Self {
        self.sizing = sizing;
        self
    }

    /// Replace circuit breaker tuning
    pub fn with_breaker_settings(mut self, breaker: BreakerSettings) -> Self {
        self.breaker = breaker;
        self
    }

    /// Replace pipeline tuning
    pub fn with_pipeline_settings(mut self, pipeline: PipelineSettings) -> Self {
        self.pipeline = pipeline;
        self
    }
}

/// Builder for [`PoolConfig`]; `build()` validates.
#[derive(Debug, Clone, Default)]
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    /// Set the connection target
    pub fn connection(mut self, connection: ConnectionConfig) -> Self {
        self.config.connection = connection;
        self
    }

    /// Set the connection target from a URL
    pub fn url(mut self, url: &str) -> Result<Self> {
        self.config.connection = ConnectionConfig::from_url(url)?;
        Ok(self)
    }

    /// Set minimum and maximum pool size
    pub fn size(mut self, min: usize, max: usize) -> Self {
        self.config.min_connections = min;
        self.config.max_connections = max;
        self
    }

    /// Set acquire timeout
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config.acquire_timeout = timeout;
        self
    }

    /// Set health threshold
    pub fn health_threshold(mut self, threshold: f64) -> Self {
        self.config.health_threshold = threshold;
        self
    }

    /// Set health check interval
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.config.health_check_interval = interval;
        self
    }

    /// Set max lifetime
    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.config.max_lifetime = lifetime;
        self
    }

    /// Set idle timeout
    pub fn max_idle_time(mut self, idle: Duration) -> Self {
        self.config.max_idle_time = idle;
        self
    }

    /// Enable/disable pre-warming
    pub fn pre_warm(mut self, pre_warm: bool) -> Self {
        self.config.pre_warm = pre_warm;
        self
    }

    /// Enable/disable adaptive sizing
    pub fn adaptive_sizing(mut self, enabled: bool) -> Self {
        self.config.adaptive_sizing = enabled;
        self
    }

    /// Set consecutive-failure threshold
    pub fn failure_threshold(mut self, threshold: u64) -> Self {
        self.config.circuit_breaker_failure_threshold = threshold;
        self
    }

    /// Set breaker recovery timeout
    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.config.circuit_breaker_recovery_timeout = timeout;
        self
    }

    /// Enable pipelining with the given batch size
    pub fn pipelining(mut self, batch_size: usize) -> Self {
        self.config.enable_pipelining = true;
        self.config.pipeline_batch_size = batch_size;
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> Result<PoolConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Expand `${VAR}` and `${VAR:-default}` references. Unset variables without
/// a default expand to an empty string.
pub fn expand_env_vars(input: &str) -> String {
    ENV_VAR_REGEX
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str());
            std::env::var(var_name)
                .ok()
                .or_else(|| default.map(str::to_string))
                .unwrap_or_default()
        })
        .into_owned()
}
