//! Query pipeline
//!
//! Batches independent queries and executes each batch as one unit:
//! - Flushes when `batch_size` queries are queued, or `flush_interval` after
//!   the first query of a batch was enqueued, or on an explicit [`Pipeline::flush`]
//! - Every enqueued query gets a [`PipelineTicket`] resolving to its
//!   [`QueryStatus`]
//!
//! # Strategies
//!
//! - **best_effort**: queries run independently on one connection
//! - **transactional**: one transaction; any failure rolls back the batch
//! - **sequential**: enqueue order, stop at the first failure
//! - **parallel**: read-only queries on up to `max_parallelism` connections
//!
//! ```rust,ignore
//! let pipeline = pool.pipeline()?;
//! let a = pipeline.add_query("INSERT INTO audit VALUES ($1)", vec![Value::from("start")])?;
//! let b = pipeline.add_query("UPDATE jobs SET state = 'running'", vec![])?;
//! let outcome = pipeline.flush().await;
//! assert!(a.wait().await.is_success());
//! ```

use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{ExecutionStrategy, PipelineSettings};
use crate::error::{Error, ErrorCategory, Result};
use crate::pool::{Pool, PooledConnection};
use crate::types::{FetchMode, QueryOutcome, QueryType, Value};

/// Final status of one pipelined query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryStatus {
    /// Executed (and committed, for transactional batches)
    Succeeded(QueryOutcome),
    /// Executed and failed
    Failed {
        /// Error message
        error: String,
        /// Error category
        category: ErrorCategory,
    },
    /// Executed, then undone because a later query in the transaction failed
    RolledBack,
    /// Never executed
    Skipped,
}

impl QueryStatus {
    fn failed(e: &Error) -> Self {
        Self::Failed {
            error: e.to_string(),
            category: e.category(),
        }
    }

    /// Whether the query took effect
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    /// The query result, if it succeeded
    pub fn outcome(&self) -> Option<&QueryOutcome> {
        match self {
            Self::Succeeded(outcome) => Some(outcome),
            _ => None,
        }
    }
}

/// Handle to the eventual status of an enqueued query
#[derive(Debug)]
pub struct PipelineTicket {
    rx: oneshot::Receiver<QueryStatus>,
}

impl PipelineTicket {
    /// Wait for the query's batch to be flushed. Resolves to
    /// [`QueryStatus::Skipped`] if the pipeline was dropped first.
    pub async fn wait(self) -> QueryStatus {
        self.rx.await.unwrap_or(QueryStatus::Skipped)
    }
}

/// Result of one flushed batch
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// Strategy the batch ran with
    pub strategy: ExecutionStrategy,
    /// Per-query status, in enqueue order
    pub statuses: Vec<QueryStatus>,
    /// Transactional: the transaction committed. Others: no query failed.
    pub committed: bool,
    /// Wall time of the flush
    pub duration: Duration,
}

impl BatchOutcome {
    fn empty(strategy: ExecutionStrategy) -> Self {
        Self {
            strategy,
            statuses: Vec::new(),
            committed: true,
            duration: Duration::ZERO,
        }
    }

    /// Number of queries in the batch
    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    /// Whether the batch was empty
    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    /// Queries that succeeded
    pub fn succeeded(&self) -> usize {
        self.statuses.iter().filter(|s| s.is_success()).count()
    }

    /// Queries that failed
    pub fn failed(&self) -> usize {
        self.statuses
            .iter()
            .filter(|s| matches!(s, QueryStatus::Failed { .. }))
            .count()
    }
}

struct PendingQuery {
    sql: String,
    params: Vec<Value>,
    query_type: QueryType,
    fetch_mode: FetchMode,
    reply: oneshot::Sender<QueryStatus>,
}

#[derive(Default)]
struct Batch {
    queries: Vec<PendingQuery>,
    first_enqueued: Option<Instant>,
}

struct Shared {
    batch: Mutex<Batch>,
    wake: Notify,
    closed: AtomicBool,
    /// Serializes flushes so batches complete in order
    flush_lock: tokio::sync::Mutex<()>,
}

/// A query pipeline bound to one pool
pub struct Pipeline {
    pool: Pool,
    batch_size: usize,
    settings: PipelineSettings,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    flusher: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("batch_size", &self.batch_size)
            .field("strategy", &self.settings.strategy)
            .field("queued", &self.queued())
            .finish()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Pipeline {
    pub(crate) fn new(pool: Pool, batch_size: usize, settings: PipelineSettings) -> Self {
        let shared = Arc::new(Shared {
            batch: Mutex::new(Batch::default()),
            wake: Notify::new(),
            closed: AtomicBool::new(false),
            flush_lock: tokio::sync::Mutex::new(()),
        });
        let cancel = CancellationToken::new();
        let flusher = pool.runtime().spawn(run_flusher(
            pool.clone(),
            shared.clone(),
            settings.clone(),
            batch_size,
            cancel.clone(),
        ));

        Self {
            pool,
            batch_size,
            settings,
            shared,
            cancel,
            flusher: Some(flusher),
        }
    }

    /// Execution strategy
    pub fn strategy(&self) -> ExecutionStrategy {
        self.settings.strategy
    }

    /// Queries waiting for the next flush
    pub fn queued(&self) -> usize {
        self.shared.batch.lock().queries.len()
    }

    /// Enqueue a query. Read-only statements return rows; others return the
    /// affected-row count.
    pub fn add_query(&self, sql: impl Into<String>, params: Vec<Value>) -> Result<PipelineTicket> {
        let sql = sql.into();
        let fetch_mode = if QueryType::from_sql(&sql).is_read_only() {
            FetchMode::All
        } else {
            FetchMode::None
        };
        self.add_query_with_mode(sql, params, fetch_mode)
    }

    /// Enqueue a query with an explicit fetch mode
    pub fn add_query_with_mode(
        &self,
        sql: impl Into<String>,
        params: Vec<Value>,
        fetch_mode: FetchMode,
    ) -> Result<PipelineTicket> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::unsupported("pipeline is closed"));
        }
        let sql = sql.into();
        let query_type = QueryType::from_sql(&sql);
        if self.settings.strategy == ExecutionStrategy::Parallel && !query_type.is_read_only() {
            return Err(Error::unsupported(format!(
                "parallel pipelines only accept read-only statements, got {query_type}"
            )));
        }

        let (reply, rx) = oneshot::channel();
        let queued = {
            let mut batch = self.shared.batch.lock();
            batch.first_enqueued.get_or_insert_with(Instant::now);
            batch.queries.push(PendingQuery {
                sql,
                params,
                query_type,
                fetch_mode,
                reply,
            });
            batch.queries.len()
        };
        if queued == 1 || queued >= self.batch_size {
            self.shared.wake.notify_one();
        }
        Ok(PipelineTicket { rx })
    }

    /// Execute everything queued now
    pub async fn flush(&self) -> BatchOutcome {
        flush_now(&self.pool, &self.shared, &self.settings).await
    }

    /// Stop accepting queries, flush what is queued and stop the flusher
    pub async fn close(mut self) -> BatchOutcome {
        self.shared.closed.store(true, Ordering::Release);
        self.cancel.cancel();
        if let Some(flusher) = self.flusher.take() {
            let _ = flusher.await;
        }
        flush_now(&self.pool, &self.shared, &self.settings).await
    }
}

async fn run_flusher(
    pool: Pool,
    shared: Arc<Shared>,
    settings: PipelineSettings,
    batch_size: usize,
    cancel: CancellationToken,
) {
    loop {
        let (queued, first) = {
            let batch = shared.batch.lock();
            (batch.queries.len(), batch.first_enqueued)
        };

        if queued >= batch_size {
            flush_now(&pool, &shared, &settings).await;
            continue;
        }

        match first {
            Some(at) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep_until(at + settings.flush_interval) => {
                        flush_now(&pool, &shared, &settings).await;
                    }
                    _ = shared.wake.notified() => {}
                }
            }
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = shared.wake.notified() => {}
                }
            }
        }
    }
    debug!("Pipeline flusher stopped");
}

async fn flush_now(pool: &Pool, shared: &Shared, settings: &PipelineSettings) -> BatchOutcome {
    let _serial = shared.flush_lock.lock().await;
    let queries = std::mem::take(&mut *shared.batch.lock()).queries;
    if queries.is_empty() {
        return BatchOutcome::empty(settings.strategy);
    }

    let start = Instant::now();
    let (jobs, replies): (Vec<Job>, Vec<_>) = queries
        .into_iter()
        .map(|q| {
            (
                Job {
                    sql: q.sql,
                    params: q.params,
                    query_type: q.query_type,
                    fetch_mode: q.fetch_mode,
                },
                q.reply,
            )
        })
        .unzip();

    let (statuses, committed) = match settings.strategy {
        ExecutionStrategy::BestEffort => run_on_one_connection(pool, &jobs, false).await,
        ExecutionStrategy::Sequential => run_on_one_connection(pool, &jobs, true).await,
        ExecutionStrategy::Transactional => run_transactional(pool, &jobs).await,
        ExecutionStrategy::Parallel => run_parallel(pool, jobs, settings.max_parallelism).await,
    };

    for (reply, status) in replies.into_iter().zip(statuses.iter()) {
        let _ = reply.send(status.clone());
    }

    let outcome = BatchOutcome {
        strategy: settings.strategy,
        statuses,
        committed,
        duration: start.elapsed(),
    };
    debug!(
        strategy = %outcome.strategy,
        queries = outcome.len(),
        failed = outcome.failed(),
        committed = outcome.committed,
        duration_ms = outcome.duration.as_millis() as u64,
        "Pipeline batch flushed"
    );
    outcome
}

struct Job {
    sql: String,
    params: Vec<Value>,
    query_type: QueryType,
    fetch_mode: FetchMode,
}

fn all(status: QueryStatus, n: usize) -> Vec<QueryStatus> {
    vec![status; n]
}

/// best_effort and sequential
async fn run_on_one_connection(
    pool: &Pool,
    jobs: &[Job],
    stop_on_failure: bool,
) -> (Vec<QueryStatus>, bool) {
    let mut conn: Option<PooledConnection> = None;
    let mut statuses = Vec::with_capacity(jobs.len());
    let mut stopped = false;

    for job in jobs {
        if stopped {
            statuses.push(QueryStatus::Skipped);
            continue;
        }
        if conn.is_none() {
            match pool.acquire_default().await {
                Ok(c) => conn = Some(c),
                Err(e) => {
                    statuses.push(QueryStatus::failed(&e));
                    stopped = stop_on_failure;
                    continue;
                }
            }
        }
        let Some(handle) = conn.as_ref() else {
            continue;
        };

        match pool
            .execute(handle, &job.sql, &job.params, job.fetch_mode)
            .await
        {
            Ok(outcome) => statuses.push(QueryStatus::Succeeded(outcome)),
            Err(e) => {
                statuses.push(QueryStatus::failed(&e));
                stopped = stop_on_failure;
                if e.is_connection_lost() {
                    // returned (and recycled) on drop; the next query gets a fresh one
                    conn = None;
                }
            }
        }
    }

    if let Some(handle) = conn {
        if let Err(e) = pool.release(handle).await {
            debug!(error = %e, "Pipeline connection release failed");
        }
    }
    let clean = statuses.iter().all(QueryStatus::is_success);
    (statuses, clean)
}

async fn run_transactional(pool: &Pool, jobs: &[Job]) -> (Vec<QueryStatus>, bool) {
    let conn = match pool.acquire_default().await {
        Ok(conn) => conn,
        Err(e) => return (all(QueryStatus::failed(&e), jobs.len()), false),
    };
    let permit = match pool.breaker().acquire_permit() {
        Ok(permit) => permit,
        Err(e) => return (all(QueryStatus::failed(&e), jobs.len()), false),
    };
    let tx = match conn.begin().await {
        Ok(tx) => tx,
        Err(e) => {
            let status = QueryStatus::failed(&e);
            pool.note_failure(&conn, &e);
            permit.record(&Err::<(), _>(e));
            return (all(status, jobs.len()), false);
        }
    };

    let mut outcomes = Vec::with_capacity(jobs.len());
    let mut failure: Option<Error> = None;
    for job in jobs {
        let start = Instant::now();
        let result = match job.fetch_mode {
            FetchMode::None => tx
                .execute(&job.sql, &job.params)
                .await
                .map(QueryOutcome::affected),
            mode => tx
                .query(&job.sql, &job.params)
                .await
                .map(|rows| QueryOutcome::rows(mode.apply(rows))),
        };
        let elapsed = start.elapsed();
        match result {
            Ok(outcome) => {
                pool.metrics()
                    .record_query(elapsed, job.query_type, true, None);
                outcomes.push(outcome);
            }
            Err(e) => {
                pool.metrics()
                    .record_query(elapsed, job.query_type, false, Some(e.category()));
                failure = Some(e);
                break;
            }
        }
    }

    let (statuses, committed) = match failure {
        None => match tx.commit().await {
            Ok(()) => {
                permit.success();
                (outcomes.into_iter().map(QueryStatus::Succeeded).collect(), true)
            }
            Err(e) => {
                warn!(error = %e, "Pipeline transaction commit failed");
                pool.note_failure(&conn, &e);
                permit.record(&Err::<(), _>(e));
                (all(QueryStatus::RolledBack, jobs.len()), false)
            }
        },
        Some(e) => {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "Pipeline transaction rollback failed");
            }
            let executed = outcomes.len();
            let mut statuses = all(QueryStatus::RolledBack, executed);
            statuses.push(QueryStatus::failed(&e));
            statuses.extend(all(QueryStatus::Skipped, jobs.len() - executed - 1));
            pool.note_failure(&conn, &e);
            permit.record(&Err::<(), _>(e));
            (statuses, false)
        }
    };

    if let Err(e) = pool.release(conn).await {
        debug!(error = %e, "Pipeline connection release failed");
    }
    (statuses, committed)
}

async fn run_parallel(
    pool: &Pool,
    jobs: Vec<Job>,
    max_parallelism: usize,
) -> (Vec<QueryStatus>, bool) {
    let width = max_parallelism
        .min(pool.config().max_connections)
        .max(1);

    // each future owns its job and a pool handle
    let statuses: Vec<QueryStatus> = stream::iter(jobs.into_iter().map(|job| (pool.clone(), job)))
        .map(|(pool, job)| async move {
            let conn = match pool.acquire_default().await {
                Ok(conn) => conn,
                Err(e) => return QueryStatus::failed(&e),
            };
            let status = match pool
                .execute(&conn, &job.sql, &job.params, job.fetch_mode)
                .await
            {
                Ok(outcome) => QueryStatus::Succeeded(outcome),
                Err(e) => QueryStatus::failed(&e),
            };
            if let Err(e) = pool.release(conn).await {
                debug!(error = %e, "Pipeline connection release failed");
            }
            status
        })
        .buffered(width)
        .collect()
        .await;

    let clean = statuses.iter().all(QueryStatus::is_success);
    (statuses, clean)
}
