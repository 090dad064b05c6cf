//! Workflow-scoped connection pool
//!
//! - Health-aware checkout: idle connections are handed out most recently
//!   released first, skipping (and recycling) unhealthy or expired ones
//! - Bounded: at most `max_connections` physical connections, never fewer
//!   than `min_connections` once warm
//! - Circuit-breaker protected acquisition and execution
//! - Background health monitor and optional adaptive sizer
//!
//! # Example
//!
//! ```rust,ignore
//! use kailash_pool::prelude::*;
//!
//! let config = PoolConfig::from_url("postgres://app@localhost/orders")?
//!     .with_max_connections(20);
//! let pool = Pool::initialize(config, Arc::new(PgConnectionFactory)).await?;
//!
//! let conn = pool.acquire_default().await?;
//! let outcome = pool.execute(&conn, "SELECT id FROM orders", &[], FetchMode::All).await?;
//! pool.release(conn).await?;
//! // or just drop `conn`, which returns it to the pool
//! ```

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::breaker::{BreakerConfig, BreakerMetrics, CircuitBreaker, CircuitState};
use crate::config::PoolConfig;
use crate::connection::{Connection, ConnectionFactory};
use crate::error::{Error, ErrorCategory, Result};
use crate::health;
use crate::metrics::{render_prometheus, MetricsCollector, PoolMetrics};
use crate::pipeline::Pipeline;
use crate::record::{ConnectionId, ConnectionInfo, ConnectionRecord, ConnectionState, RecycleReason};
use crate::sizing::{self, AdaptiveSizer, SizingDecision};
use crate::types::{FetchMode, QueryOutcome, QueryType, Value};

/// Pool statistics snapshot
#[derive(Debug, Clone)]
pub struct PoolStatsSnapshot {
    /// Connections owned by the pool (idle + active)
    pub total: usize,
    /// Connections checked out
    pub active: usize,
    /// Connections available (including ones being probed)
    pub idle: usize,
    /// Connections being opened
    pub pending: usize,
    /// Configured floor
    pub min_connections: usize,
    /// Configured ceiling
    pub max_connections: usize,
    /// Current adaptive target
    pub target_size: usize,
    /// Mean health score across connections (100 when empty)
    pub average_health: f64,
    /// Per-connection view, ordered by id
    pub connections: Vec<ConnectionInfo>,
    /// Circuit breaker snapshot
    pub breaker: BreakerMetrics,
    /// Whether `shutdown()` was called
    pub shut_down: bool,
}

impl PoolStatsSnapshot {
    /// Fraction of connections checked out
    pub fn utilization(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.active as f64 / self.total as f64
        }
    }
}

/// A connection checked out of the pool.
///
/// Dereferences to the underlying [`Connection`]. Dropping the handle without
/// calling [`Pool::release`] returns the connection to the pool.
pub struct PooledConnection {
    id: ConnectionId,
    lease: u64,
    conn: Arc<dyn Connection>,
    pool: Arc<PoolInner>,
    released: bool,
}

impl PooledConnection {
    /// Pool-unique connection id
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Get the underlying connection
    pub fn connection(&self) -> &dyn Connection {
        self.conn.as_ref()
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("lease", &self.lease)
            .finish()
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Already released by id, or re-leased to someone else: nothing to do.
        if let Ok(Some(retired)) = self.pool.checkin(self.id, Some(self.lease)) {
            let pool = self.pool.clone();
            self.pool.runtime.spawn(async move {
                pool.after_checkin(Some(retired)).await;
            });
        }
    }
}

/// Outcome of one checkout attempt under the state lock
enum Checkout {
    Ready(ConnectionId, u64, Arc<dyn Connection>),
    Create,
    Wait,
}

#[derive(Default)]
struct PoolState {
    records: HashMap<ConnectionId, ConnectionRecord>,
    /// Idle ids, most recently released last
    idle: Vec<ConnectionId>,
    /// Connections being opened
    pending: usize,
    /// Surplus connections the sizer asked to retire on release
    shrink_pending: usize,
}

impl PoolState {
    /// Connections counted against the bounds
    fn in_service(&self) -> usize {
        self.records.len() + self.pending
    }

    fn active(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.state == ConnectionState::Active)
            .count()
    }

    fn remove(&mut self, id: ConnectionId) -> Option<ConnectionRecord> {
        self.idle.retain(|i| *i != id);
        self.records.remove(&id)
    }
}

/// A reserved `pending` slot. Dropping it unregistered (failed or cancelled
/// connect) gives the capacity back and wakes waiters.
struct PendingSlot<'a> {
    inner: &'a PoolInner,
    armed: bool,
}

impl<'a> PendingSlot<'a> {
    /// Wrap a slot already counted in `PoolState::pending`
    fn reserved(inner: &'a PoolInner) -> Self {
        Self { inner, armed: true }
    }

    /// Hand the slot over to a registered record; `state` is the held lock
    fn settle(mut self, state: &mut PoolState) {
        state.pending -= 1;
        self.armed = false;
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.state.lock().pending -= 1;
            self.inner.available.notify_waiters();
        }
    }
}

/// Shared pool state. Background tasks hold it weakly.
pub(crate) struct PoolInner {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    state: Mutex<PoolState>,
    available: Notify,
    breaker: CircuitBreaker,
    metrics: MetricsCollector,
    target: AtomicUsize,
    next_id: AtomicU64,
    warm: AtomicBool,
    shutdown: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    runtime: Handle,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl PoolInner {
    fn threshold(&self) -> f64 {
        self.config.health_threshold
    }

    fn recycle_reason(&self, record: &ConnectionRecord, now: Instant) -> Option<RecycleReason> {
        record.recycle_reason(
            now,
            self.config.health_threshold,
            self.config.max_lifetime,
            self.config.max_idle_time,
        )
    }

    /// Connections the pool keeps open without demand
    fn floor(&self) -> usize {
        self.target
            .load(Ordering::Acquire)
            .max(self.config.min_connections)
            .min(self.config.max_connections)
    }

    fn publish_gauges(&self, state: &PoolState) {
        let active = state.active();
        PoolMetrics::set_pool_size(
            active,
            state.records.len() - active,
            self.target.load(Ordering::Acquire),
        );
    }

    fn retire(
        &self,
        mut record: ConnectionRecord,
        reason: RecycleReason,
    ) -> (ConnectionRecord, RecycleReason) {
        record.state = if reason == RecycleReason::Broken {
            ConnectionState::Failed
        } else {
            ConnectionState::Recycling
        };
        (record, reason)
    }

    /// Close retired connections and account for them
    async fn close_retired(&self, retired: Vec<(ConnectionRecord, RecycleReason)>) {
        if retired.is_empty() {
            return;
        }
        for (record, reason) in retired {
            match reason {
                RecycleReason::Unhealthy | RecycleReason::Broken => warn!(
                    connection_id = %record.id,
                    reason = %reason,
                    health = record.health,
                    "Recycling connection"
                ),
                _ => debug!(
                    connection_id = %record.id,
                    reason = %reason,
                    "Recycling connection"
                ),
            }
            if let Err(e) = record.conn.close().await {
                debug!(connection_id = %record.id, error = %e, "Error closing connection");
            }
            self.metrics.record_recycled(reason);
            self.metrics.record_destroyed();
        }
        // Capacity freed up
        self.available.notify_waiters();
    }

    fn try_checkout(&self, now: Instant) -> (Checkout, Vec<(ConnectionRecord, RecycleReason)>) {
        let mut retired = Vec::new();
        let mut state = self.state.lock();

        while let Some(id) = state.idle.pop() {
            let reason = match state.records.get(&id) {
                Some(record) => self.recycle_reason(record, now),
                None => continue,
            };
            if let Some(reason) = reason {
                if let Some(record) = state.records.remove(&id) {
                    retired.push(self.retire(record, reason));
                }
                continue;
            }
            if let Some(record) = state.records.get_mut(&id) {
                let lease = record.checkout(now);
                let conn = record.conn.clone();
                self.publish_gauges(&state);
                return (Checkout::Ready(id, lease, conn), retired);
            }
        }

        if state.in_service() < self.config.max_connections {
            state.pending += 1;
            return (Checkout::Create, retired);
        }
        (Checkout::Wait, retired)
    }

    /// Open one physical connection into a reserved pending slot
    async fn open(
        &self,
        slot: PendingSlot<'_>,
        checked_out: bool,
    ) -> Result<(ConnectionId, u64, Arc<dyn Connection>)> {
        let connect = self.factory.connect(&self.config.connection);
        let result = match tokio::time::timeout(self.config.connection.connect_timeout, connect).await
        {
            Ok(result) => result,
            Err(_) => Err(Error::connection(format!(
                "connect timed out after {}ms",
                self.config.connection.connect_timeout.as_millis()
            ))),
        };

        let conn: Arc<dyn Connection> = match result {
            Ok(conn) => Arc::from(conn),
            Err(e) => {
                drop(slot);
                self.breaker.record_failure();
                self.metrics.record_connection_failure();
                warn!(
                    database = %self.config.connection.redacted_url(),
                    error = %e,
                    "Failed to open connection"
                );
                return Err(e);
            }
        };
        self.breaker.record_success();
        self.metrics.record_created();

        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let now = Instant::now();
        let mut record = ConnectionRecord::new(id, conn.clone(), now);
        let lease = if checked_out { record.checkout(now) } else { 0 };

        let registered = {
            let mut state = self.state.lock();
            slot.settle(&mut state);
            if self.shutdown.load(Ordering::Acquire) {
                false
            } else {
                state.records.insert(id, record);
                if !checked_out {
                    state.idle.push(id);
                }
                self.publish_gauges(&state);
                true
            }
        };

        if !registered {
            if let Err(e) = conn.close().await {
                debug!(connection_id = %id, error = %e, "Error closing connection");
            }
            self.metrics.record_recycled(RecycleReason::Shutdown);
            self.metrics.record_destroyed();
            self.available.notify_waiters();
            return Err(Error::exhausted("pool is shut down", Duration::ZERO));
        }

        debug!(connection_id = %id, "Opened connection");
        if !checked_out {
            self.available.notify_waiters();
        }
        Ok((id, lease, conn))
    }

    /// Return a connection. `lease` of `None` releases whatever lease is
    /// current. Returns the record if it must be closed.
    fn checkin(
        &self,
        id: ConnectionId,
        lease: Option<u64>,
    ) -> Result<Option<(ConnectionRecord, RecycleReason)>> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let record = state.records.get_mut(&id).ok_or_else(|| Error::InvalidRelease {
            id: id.as_u64(),
            message: "connection is not owned by this pool".into(),
        })?;
        if record.state != ConnectionState::Active || lease.is_some_and(|l| l != record.lease) {
            return Err(Error::InvalidRelease {
                id: id.as_u64(),
                message: format!("connection is {}, not checked out by this caller", record.state),
            });
        }

        record.last_used = now;
        let reason = if self.shutdown.load(Ordering::Acquire) {
            Some(RecycleReason::Shutdown)
        } else {
            self.recycle_reason(record, now)
        };
        let reason = reason.or_else(|| {
            let surplus = state.shrink_pending > 0
                && state.records.len() > self.floor()
                && state.records.len() > self.config.min_connections;
            surplus.then_some(RecycleReason::Shrink)
        });
        if reason.is_some() && state.shrink_pending > 0 {
            state.shrink_pending -= 1;
        }

        self.metrics.record_release();
        let retired = match reason {
            Some(reason) => state.remove(id).map(|record| self.retire(record, reason)),
            None => {
                if let Some(record) = state.records.get_mut(&id) {
                    record.state = ConnectionState::Idle;
                }
                state.idle.push(id);
                None
            }
        };
        self.publish_gauges(&state);
        drop(state);

        self.available.notify_waiters();
        Ok(retired)
    }

    /// Close a retired record and restore the floor
    async fn after_checkin(self: &Arc<Self>, retired: Option<(ConnectionRecord, RecycleReason)>) {
        if let Some(retired) = retired {
            self.close_retired(vec![retired]).await;
            self.top_up().await;
        }
    }

    /// Fail fast if a handle no longer owns its connection
    fn verify_lease(&self, id: ConnectionId, lease: u64) -> Result<()> {
        let state = self.state.lock();
        match state.records.get(&id) {
            Some(r) if r.state == ConnectionState::Active && r.lease == lease => Ok(()),
            _ => Err(Error::StaleHandle { id: id.as_u64() }),
        }
    }

    /// Decay health after a connection-level failure
    fn penalize(&self, id: ConnectionId, lease: u64, broken: bool) {
        let mut state = self.state.lock();
        if let Some(record) = state.records.get_mut(&id) {
            if record.lease != lease {
                return;
            }
            record.health = health::apply_sample(record.health, 0.0, self.config.health.smoothing);
            record.broken |= broken;
            debug!(
                connection_id = %id,
                health = record.health,
                broken = record.broken,
                "Connection penalized"
            );
        }
    }

    /// Open connections until the pool reaches its floor
    pub(crate) async fn top_up(&self) {
        if !self.warm.load(Ordering::Acquire) || self.shutdown.load(Ordering::Acquire) {
            return;
        }
        if self.breaker.state() == CircuitState::Open {
            return;
        }

        let missing = {
            let mut state = self.state.lock();
            let missing = self.floor().saturating_sub(state.in_service());
            state.pending += missing;
            missing
        };
        if missing == 0 {
            return;
        }

        let opens = (0..missing).map(|_| self.open(PendingSlot::reserved(self), false));
        let results = futures::future::join_all(opens).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            debug!(missing, failed, "Pool top-up incomplete");
        }
    }

    /// One health monitor round: sweep expired idle connections, probe the
    /// rest, recycle the ones that fell below the threshold, restore the floor.
    pub(crate) async fn health_tick(&self) {
        let now = Instant::now();
        let (probes, retired) = {
            let mut state = self.state.lock();
            let mut retired = Vec::new();
            let mut probes = Vec::new();
            let idle = std::mem::take(&mut state.idle);
            for id in idle {
                let reason = match state.records.get(&id) {
                    Some(record) => self.recycle_reason(record, now),
                    None => continue,
                };
                match reason {
                    Some(reason) => {
                        if let Some(record) = state.records.remove(&id) {
                            retired.push(self.retire(record, reason));
                        }
                    }
                    None => {
                        if let Some(record) = state.records.get_mut(&id) {
                            record.probing = true;
                            probes.push((id, record.conn.clone()));
                        }
                    }
                }
            }
            (probes, retired)
        };
        self.close_retired(retired).await;

        let query = self.config.health_check_query.as_str();
        let timeout = self.config.health_check_timeout;
        let outcomes = futures::future::join_all(probes.into_iter().map(|(id, conn)| async move {
            (id, health::probe(conn.as_ref(), query, timeout).await)
        }))
        .await;

        let retired = {
            let mut state = self.state.lock();
            let mut retired = Vec::new();
            for (id, outcome) in outcomes {
                let failed = outcome.is_err();
                self.metrics.record_health_check(failed);
                let Some(record) = state.records.get_mut(&id) else {
                    continue;
                };
                let sample = match &outcome {
                    Ok(latency) => {
                        health::probe_sample(*latency, self.config.health.slow_threshold, timeout)
                    }
                    Err(_) => 0.0,
                };
                record.health =
                    health::apply_sample(record.health, sample, self.config.health.smoothing);
                record.probing = false;
                if let Err(e) = &outcome {
                    debug!(connection_id = %id, health = record.health, error = %e, "Health check failed");
                }

                if self.shutdown.load(Ordering::Acquire) {
                    if let Some(record) = state.remove(id) {
                        retired.push(self.retire(record, RecycleReason::Shutdown));
                    }
                } else if record.health < self.threshold() {
                    if let Some(record) = state.remove(id) {
                        retired.push(self.retire(record, RecycleReason::Unhealthy));
                    }
                } else if state.shrink_pending > 0 && state.records.len() > self.floor() {
                    // held out of the idle stack while the sizer shrank
                    state.shrink_pending -= 1;
                    if let Some(record) = state.remove(id) {
                        retired.push(self.retire(record, RecycleReason::Shrink));
                    }
                } else {
                    state.idle.push(id);
                }
            }
            self.publish_gauges(&state);
            retired
        };
        self.available.notify_waiters();
        self.close_retired(retired).await;

        self.top_up().await;
    }

    /// active / total, 0 for an empty pool
    pub(crate) fn utilization(&self) -> f64 {
        let state = self.state.lock();
        if state.records.is_empty() {
            0.0
        } else {
            state.active() as f64 / state.records.len() as f64
        }
    }

    pub(crate) async fn apply_sizing(&self, decision: SizingDecision) {
        self.target.store(decision.target(), Ordering::Release);
        info!(?decision, target = decision.target(), "Adaptive pool target changed");

        match decision {
            SizingDecision::Grow { .. } => {
                self.state.lock().shrink_pending = 0;
                self.top_up().await;
            }
            SizingDecision::Shrink { to, .. } => {
                let retired = {
                    let mut state = self.state.lock();
                    let floor = to.max(self.config.min_connections);
                    let mut retired = Vec::new();
                    // Oldest idle first; active connections retire on release
                    while state.records.len() > floor && !state.idle.is_empty() {
                        let id = state.idle.remove(0);
                        if let Some(record) = state.records.remove(&id) {
                            retired.push(self.retire(record, RecycleReason::Shrink));
                        }
                    }
                    state.shrink_pending = state.records.len().saturating_sub(floor);
                    self.publish_gauges(&state);
                    retired
                };
                self.close_retired(retired).await;
            }
        }
    }

    fn stats(&self) -> PoolStatsSnapshot {
        let now = Instant::now();
        let state = self.state.lock();
        let mut connections: Vec<ConnectionInfo> =
            state.records.values().map(|r| r.info(now)).collect();
        connections.sort_by_key(|c| c.id);

        let active = connections
            .iter()
            .filter(|c| c.state == ConnectionState::Active)
            .count();
        let average_health = if connections.is_empty() {
            health::MAX_SCORE
        } else {
            connections.iter().map(|c| c.health).sum::<f64>() / connections.len() as f64
        };

        PoolStatsSnapshot {
            total: connections.len(),
            active,
            idle: connections.len() - active,
            pending: state.pending,
            min_connections: self.config.min_connections,
            max_connections: self.config.max_connections,
            target_size: self.target.load(Ordering::Acquire),
            average_health,
            connections,
            breaker: self.breaker.metrics(),
            shut_down: self.shutdown.load(Ordering::Acquire),
        }
    }
}

/// Workflow-scoped connection pool. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("database", &self.inner.config.connection.redacted_url())
            .field("min_connections", &self.inner.config.min_connections)
            .field("max_connections", &self.inner.config.max_connections)
            .finish()
    }
}

impl Pool {
    /// Validate the configuration, open `min_connections` when pre-warming,
    /// and start the background tasks. Must run inside a tokio runtime.
    pub async fn initialize(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| Error::config(format!("pool requires a tokio runtime: {e}")))?;

        let inner = Arc::new(PoolInner {
            breaker: CircuitBreaker::new(BreakerConfig::from_pool(&config)),
            metrics: MetricsCollector::new(config.metrics_retention()),
            target: AtomicUsize::new(config.min_connections),
            next_id: AtomicU64::new(1),
            warm: AtomicBool::new(config.pre_warm),
            shutdown: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            state: Mutex::new(PoolState::default()),
            available: Notify::new(),
            factory,
            runtime,
            config,
        });

        if inner.config.pre_warm {
            inner.top_up().await;
        }

        let mut tasks = Vec::new();
        tasks.push(inner.runtime.spawn(health::run(
            Arc::downgrade(&inner),
            inner.cancel.child_token(),
            inner.config.health_check_interval,
        )));
        if inner.config.adaptive_sizing {
            let sizer = AdaptiveSizer::new(
                inner.config.sizing.clone(),
                inner.config.min_connections,
                inner.config.max_connections,
            );
            tasks.push(inner.runtime.spawn(sizing::run(
                Arc::downgrade(&inner),
                inner.cancel.child_token(),
                sizer,
                inner.config.sizing.interval,
            )));
        }
        *inner.tasks.lock() = tasks;

        let opened = inner.state.lock().records.len();
        info!(
            backend = %inner.factory.database_type(),
            database = %inner.config.connection.redacted_url(),
            min = inner.config.min_connections,
            max = inner.config.max_connections,
            opened,
            adaptive = inner.config.adaptive_sizing,
            "Connection pool initialized"
        );
        Ok(Self { inner })
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// The pool's circuit breaker (for `force_open` / `force_close`)
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    /// The pool's metrics collector
    pub fn metrics(&self) -> &MetricsCollector {
        &self.inner.metrics
    }

    /// Acquire with the configured `acquire_timeout`
    pub async fn acquire_default(&self) -> Result<PooledConnection> {
        self.acquire(self.inner.config.acquire_timeout).await
    }

    /// Check out a connection, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolExhausted`] when no connection is free (or could be
    ///   opened) before the deadline, or the pool is shut down
    /// - [`Error::CircuitOpen`] while the breaker rejects calls
    /// - [`Error::Connection`] when the pool had room and the connect it made
    ///   on the caller's behalf failed; the failure also counts against the
    ///   breaker
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledConnection> {
        let inner = &self.inner;
        let start = Instant::now();
        let deadline = start + timeout;

        if let Err(e) = inner.breaker.check() {
            inner.metrics.record_error(ErrorCategory::CircuitOpen);
            return Err(e);
        }
        inner.warm.store(true, Ordering::Release);

        loop {
            if inner.shutdown.load(Ordering::Acquire) {
                return Err(Error::exhausted("pool is shut down", start.elapsed()));
            }
            let notified = inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (step, retired) = inner.try_checkout(Instant::now());
            if !retired.is_empty() {
                let pool = inner.clone();
                inner.runtime.spawn(async move {
                    pool.close_retired(retired).await;
                    pool.top_up().await;
                });
            }

            let exhausted = || {
                inner.metrics.record_error(ErrorCategory::PoolExhausted);
                let waited = start.elapsed();
                debug!(waited_ms = waited.as_millis() as u64, "Pool exhausted");
                Error::exhausted(
                    format!(
                        "no connection available within {}ms (max_connections = {})",
                        timeout.as_millis(),
                        inner.config.max_connections
                    ),
                    waited,
                )
            };

            let (id, lease, conn) = match step {
                Checkout::Ready(id, lease, conn) => (id, lease, conn),
                Checkout::Create => {
                    let slot = PendingSlot::reserved(inner);
                    // the slot is released if the connect is abandoned
                    match tokio::time::timeout_at(deadline, inner.open(slot, true)).await {
                        Ok(opened) => opened?,
                        Err(_) => return Err(exhausted()),
                    }
                }
                Checkout::Wait => {
                    if tokio::time::timeout_at(deadline, notified).await.is_ok() {
                        continue;
                    }
                    return Err(exhausted());
                }
            };

            inner.metrics.record_acquisition(start.elapsed());
            debug!(connection_id = %id, lease, "Acquired connection");
            return Ok(PooledConnection {
                id,
                lease,
                conn,
                pool: inner.clone(),
                released: false,
            });
        }
    }

    /// Return a connection to the pool
    pub async fn release(&self, mut conn: PooledConnection) -> Result<()> {
        conn.released = true;
        let retired = self.inner.checkin(conn.id, Some(conn.lease))?;
        self.inner.after_checkin(retired).await;
        Ok(())
    }

    /// Return a connection by id. Fails with [`Error::InvalidRelease`] when the
    /// connection is not currently checked out; pool counts are unchanged.
    pub async fn release_id(&self, id: ConnectionId) -> Result<()> {
        let retired = self.inner.checkin(id, None)?;
        self.inner.after_checkin(retired).await;
        Ok(())
    }

    /// Run a statement on a checked-out connection, through the circuit breaker
    pub async fn execute(
        &self,
        conn: &PooledConnection,
        sql: &str,
        params: &[Value],
        fetch_mode: FetchMode,
    ) -> Result<QueryOutcome> {
        let inner = &self.inner;
        inner.verify_lease(conn.id, conn.lease)?;

        let permit = match inner.breaker.acquire_permit() {
            Ok(permit) => permit,
            Err(e) => {
                inner.metrics.record_error(ErrorCategory::CircuitOpen);
                return Err(e);
            }
        };

        let query_type = QueryType::from_sql(sql);
        let start = Instant::now();
        let result = match fetch_mode {
            FetchMode::None => conn.conn.execute(sql, params).await.map(QueryOutcome::affected),
            mode => conn
                .conn
                .query(sql, params)
                .await
                .map(|rows| QueryOutcome::rows(mode.apply(rows))),
        };
        let elapsed = start.elapsed();
        permit.record(&result);

        match &result {
            Ok(_) => inner.metrics.record_query(elapsed, query_type, true, None),
            Err(e) => {
                inner
                    .metrics
                    .record_query(elapsed, query_type, false, Some(e.category()));
                self.note_failure(conn, e);
            }
        }
        result
    }

    /// Decay the connection's health after a connection-level failure
    pub(crate) fn note_failure(&self, conn: &PooledConnection, error: &Error) {
        if error.is_connection_lost() {
            self.inner.penalize(conn.id, conn.lease, true);
        } else if error.category() == ErrorCategory::Timeout {
            self.inner.penalize(conn.id, conn.lease, false);
        }
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    /// Point-in-time pool statistics
    pub fn stats(&self) -> PoolStatsSnapshot {
        self.inner.stats()
    }

    /// Prometheus text exposition of pool metrics
    pub fn export_metrics(&self) -> String {
        render_prometheus(&self.inner.metrics.snapshot(), &self.inner.stats())
    }

    /// Start a query pipeline. Requires `enable_pipelining`.
    pub fn pipeline(&self) -> Result<Pipeline> {
        if !self.inner.config.enable_pipelining {
            return Err(Error::unsupported("pipelining is disabled for this pool"));
        }
        Ok(Pipeline::new(
            self.clone(),
            self.inner.config.pipeline_batch_size,
            self.inner.config.pipeline.clone(),
        ))
    }

    /// Stop background tasks, wake waiters and close idle connections.
    /// Checked-out connections are closed when released.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        inner.cancel.cancel();
        let tasks = std::mem::take(&mut *inner.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        inner.available.notify_waiters();

        let retired = {
            let mut state = inner.state.lock();
            let idle: Vec<ConnectionId> = state
                .records
                .values()
                .filter(|r| r.state == ConnectionState::Idle)
                .map(|r| r.id)
                .collect();
            let retired: Vec<_> = idle
                .into_iter()
                .filter_map(|id| state.remove(id))
                .map(|record| inner.retire(record, RecycleReason::Shutdown))
                .collect();
            inner.publish_gauges(&state);
            retired
        };
        let closed = retired.len();
        inner.close_retired(retired).await;

        let in_flight = inner.state.lock().records.len();
        info!(closed, in_flight, "Connection pool shut down");
    }
}
