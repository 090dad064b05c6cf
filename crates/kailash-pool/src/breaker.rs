//! Circuit breaker protecting the database
//!
//! # States
//!
//! - **Closed**: normal operation, calls pass through
//! - **Open**: calls are rejected with [`Error::CircuitOpen`] without touching
//!   the database
//! - **Half-Open**: a limited number of trial calls probe for recovery
//!
//! The breaker opens when consecutive failures reach `failure_threshold`, or
//! when the error rate over the rolling `window` exceeds
//! `error_rate_threshold` once at least `min_calls` outcomes were seen. It
//! moves to half-open on the first permission check after `recovery_timeout`
//! and closes again after `success_threshold` successful trials. Any trial
//! failure re-opens it.
//!
//! Only infrastructure failures count (see
//! [`ErrorCategory::is_infrastructure`]); constraint and syntax errors are the
//! caller's problem and are recorded as successes.
//!
//! ```rust,ignore
//! let breaker = CircuitBreaker::new(BreakerConfig::default().with_failure_threshold(3));
//! let rows = breaker.call(|| async { conn.query("SELECT 1", &[]).await }).await?;
//! ```

use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::PoolConfig;
use crate::error::{Error, ErrorCategory, Result};
use crate::metrics::PoolMetrics;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CircuitState {
    /// Normal operation - calls pass through
    Closed = 0,
    /// Circuit is open - calls fail immediately
    Open = 1,
    /// Testing if the database has recovered
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl CircuitState {
    /// Label value for metrics
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for the circuit breaker
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u64,
    /// Time to wait before allowing a trial call
    pub recovery_timeout: Duration,
    /// Error rate (0-1] over the window that opens the circuit
    pub error_rate_threshold: f64,
    /// Outcomes required in the window before the error rate is evaluated
    pub min_calls: u64,
    /// Rolling error-rate window
    pub window: Duration,
    /// Successful trials in half-open before closing
    pub success_threshold: u64,
    /// Concurrent trials allowed in half-open
    pub half_open_max_calls: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            error_rate_threshold: 0.5,
            min_calls: 10,
            window: Duration::from_secs(60),
            success_threshold: 1,
            half_open_max_calls: 1,
        }
    }
}

impl BreakerConfig {
    pub(crate) fn from_pool(config: &PoolConfig) -> Self {
        Self {
            failure_threshold: config.circuit_breaker_failure_threshold,
            recovery_timeout: config.circuit_breaker_recovery_timeout,
            error_rate_threshold: config.circuit_breaker_error_rate,
            min_calls: config.breaker.min_calls,
            window: config.breaker.window,
            success_threshold: config.breaker.success_threshold,
            half_open_max_calls: config.breaker.half_open_max_calls,
        }
    }

    /// Set the failure threshold
    pub fn with_failure_threshold(mut self, threshold: u64) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the recovery timeout
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    /// Set the error-rate threshold and the minimum number of calls before it
    /// applies
    pub fn with_error_rate(mut self, threshold: f64, min_calls: u64) -> Self {
        self.error_rate_threshold = threshold;
        self.min_calls = min_calls;
        self
    }

    /// Set the rolling window
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Set the success threshold for closing from half-open
    pub fn with_success_threshold(mut self, threshold: u64) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Set the number of concurrent half-open trials
    pub fn with_half_open_max_calls(mut self, calls: u64) -> Self {
        self.half_open_max_calls = calls;
        self
    }
}

/// Breaker snapshot, carried by [`Error::CircuitOpen`]
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerMetrics {
    /// Current state
    pub state: CircuitState,
    /// Failures since the last success
    pub consecutive_failures: u64,
    /// Error rate over the rolling window
    pub error_rate: f64,
    /// Outcomes in the rolling window
    pub calls_in_window: u64,
    /// Time until a trial call is allowed (open, not forced)
    pub retry_after: Option<Duration>,
    /// Held open by `force_open`
    pub forced: bool,
    /// Calls rejected since creation
    pub rejected_calls: u64,
}

impl fmt::Display for BreakerMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "state={}, consecutive_failures={}, error_rate={:.2}, calls_in_window={}",
            self.state, self.consecutive_failures, self.error_rate, self.calls_in_window
        )?;
        if self.forced {
            write!(f, ", forced")?;
        }
        if let Some(retry) = self.retry_after {
            write!(f, ", retry_after={}ms", retry.as_millis())?;
        }
        Ok(())
    }
}

/// Permission to run one call through the breaker.
///
/// Record the outcome with [`BreakerPermit::success`] / [`BreakerPermit::failure`]
/// / [`BreakerPermit::record`]. Dropping a permit without an outcome frees its
/// half-open trial slot and records nothing.
#[must_use = "a permit must be completed with an outcome"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    done: bool,
}

impl BreakerPermit<'_> {
    /// Record a successful call
    pub fn success(self) {
        self.finish(true);
    }

    /// Record a failed call
    pub fn failure(self) {
        self.finish(false);
    }

    /// Record the outcome of a call, classifying errors by category
    pub fn record<T>(self, result: &Result<T>) {
        let ok = match result {
            Ok(_) => true,
            Err(e) => !counts_as_failure(e.category()),
        };
        self.finish(ok);
    }

    fn finish(mut self, ok: bool) {
        self.done = true;
        if self.trial {
            self.breaker.half_open_in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        if ok {
            self.breaker.record_success();
        } else {
            self.breaker.record_failure();
        }
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.done && self.trial {
            self.breaker.half_open_in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

fn counts_as_failure(category: ErrorCategory) -> bool {
    category.is_infrastructure()
}

/// Circuit breaker for protecting the database against overload
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: AtomicU8,
    consecutive_failures: AtomicU64,
    half_open_successes: AtomicU64,
    half_open_in_flight: AtomicU64,
    rejected: AtomicU64,
    forced_open: AtomicBool,
    last_state_change: RwLock<Instant>,
    window: Mutex<VecDeque<(Instant, bool)>>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl CircuitBreaker {
    /// Create a circuit breaker
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_failures: AtomicU64::new(0),
            half_open_successes: AtomicU64::new(0),
            half_open_in_flight: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            forced_open: AtomicBool::new(false),
            last_state_change: RwLock::new(Instant::now()),
            window: Mutex::new(VecDeque::new()),
        }
    }

    /// Breaker configuration
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Get the current state
    pub fn state(&self) -> CircuitState {
        self.state.load(Ordering::SeqCst).into()
    }

    /// Failures since the last success
    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Gate check used before handing out connections.
    ///
    /// Moves an expired open breaker to half-open but does not take a trial
    /// slot; the trial is taken by the call that actually reaches the database.
    pub fn check(&self) -> Result<()> {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                if self.recovery_elapsed() {
                    self.transition_to(CircuitState::HalfOpen, "recovery timeout elapsed");
                    Ok(())
                } else {
                    Err(self.reject())
                }
            }
        }
    }

    /// Ask permission for one call
    pub fn acquire_permit(&self) -> Result<BreakerPermit<'_>> {
        let mut state = self.state();
        if state == CircuitState::Open {
            if !self.recovery_elapsed() {
                return Err(self.reject());
            }
            self.transition_to(CircuitState::HalfOpen, "recovery timeout elapsed");
            state = self.state();
        }

        match state {
            CircuitState::Closed => Ok(BreakerPermit {
                breaker: self,
                trial: false,
                done: false,
            }),
            CircuitState::HalfOpen => {
                let max = self.config.half_open_max_calls;
                let reserved = self
                    .half_open_in_flight
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        (n < max).then_some(n + 1)
                    })
                    .is_ok();
                if reserved {
                    Ok(BreakerPermit {
                        breaker: self,
                        trial: true,
                        done: false,
                    })
                } else {
                    Err(self.reject())
                }
            }
            CircuitState::Open => Err(self.reject()),
        }
    }

    /// Execute a function through the circuit breaker
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.acquire_permit()?;
        let result = f().await;
        permit.record(&result);
        result
    }

    /// Record a successful operation
    pub fn record_success(&self) {
        self.push_outcome(true);
        self.consecutive_failures.store(0, Ordering::SeqCst);

        if self.state() == CircuitState::HalfOpen {
            let successes = self.half_open_successes.fetch_add(1, Ordering::SeqCst) + 1;
            if successes >= self.config.success_threshold {
                self.transition_to(CircuitState::Closed, "trial calls succeeded");
            }
        }
    }

    /// Record a failed operation
    pub fn record_failure(&self) {
        let (calls, rate) = self.push_outcome(false);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;

        match self.state() {
            CircuitState::Closed => {
                if failures >= self.config.failure_threshold {
                    self.transition_to(CircuitState::Open, "consecutive failure threshold reached");
                } else if calls >= self.config.min_calls && rate > self.config.error_rate_threshold
                {
                    self.transition_to(CircuitState::Open, "error rate threshold exceeded");
                }
            }
            CircuitState::HalfOpen => {
                self.transition_to(CircuitState::Open, "trial call failed");
            }
            CircuitState::Open => {}
        }
    }

    /// Hold the breaker open until [`CircuitBreaker::force_close`]
    pub fn force_open(&self, reason: &str) {
        self.forced_open.store(true, Ordering::SeqCst);
        warn!(reason, "Circuit breaker forced open");
        self.transition_to(CircuitState::Open, reason);
    }

    /// Close the breaker and clear any forced override
    pub fn force_close(&self, reason: &str) {
        self.forced_open.store(false, Ordering::SeqCst);
        warn!(reason, "Circuit breaker forced closed");
        self.transition_to(CircuitState::Closed, reason);
    }

    /// Point-in-time snapshot
    pub fn metrics(&self) -> BreakerMetrics {
        let state = self.state();
        let forced = self.forced_open.load(Ordering::SeqCst);
        let (calls_in_window, error_rate) = self.window_stats();
        let retry_after = (state == CircuitState::Open && !forced).then(|| {
            self.config
                .recovery_timeout
                .saturating_sub(self.last_state_change.read().elapsed())
        });

        BreakerMetrics {
            state,
            consecutive_failures: self.consecutive_failures(),
            error_rate,
            calls_in_window,
            retry_after,
            forced,
            rejected_calls: self.rejected.load(Ordering::SeqCst),
        }
    }

    fn recovery_elapsed(&self) -> bool {
        !self.forced_open.load(Ordering::SeqCst)
            && self.last_state_change.read().elapsed() >= self.config.recovery_timeout
    }

    fn reject(&self) -> Error {
        self.rejected.fetch_add(1, Ordering::SeqCst);
        PoolMetrics::increment_circuit_rejections();
        Error::CircuitOpen {
            metrics: self.metrics(),
        }
    }

    /// Push an outcome and return (calls, error rate) for the pruned window
    fn push_outcome(&self, ok: bool) -> (u64, f64) {
        let now = Instant::now();
        let mut window = self.window.lock();
        window.push_back((now, ok));
        Self::prune(&mut window, now, self.config.window);
        Self::rate(&window)
    }

    fn window_stats(&self) -> (u64, f64) {
        let mut window = self.window.lock();
        Self::prune(&mut window, Instant::now(), self.config.window);
        Self::rate(&window)
    }

    fn prune(window: &mut VecDeque<(Instant, bool)>, now: Instant, span: Duration) {
        while let Some((at, _)) = window.front() {
            if now.saturating_duration_since(*at) > span {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    fn rate(window: &VecDeque<(Instant, bool)>) -> (u64, f64) {
        let calls = window.len() as u64;
        if calls == 0 {
            return (0, 0.0);
        }
        let failures = window.iter().filter(|(_, ok)| !ok).count() as f64;
        (calls, failures / calls as f64)
    }

    fn transition_to(&self, new_state: CircuitState, reason: &str) {
        let old_state: CircuitState = self.state.swap(new_state as u8, Ordering::SeqCst).into();
        if old_state == new_state {
            return;
        }

        *self.last_state_change.write() = Instant::now();
        self.half_open_successes.store(0, Ordering::SeqCst);
        if new_state == CircuitState::Closed {
            self.consecutive_failures.store(0, Ordering::SeqCst);
            self.window.lock().clear();
        }

        PoolMetrics::record_circuit_transition(new_state);
        info!(
            from = %old_state,
            to = %new_state,
            reason,
            "Circuit breaker state change"
        );
    }
}
