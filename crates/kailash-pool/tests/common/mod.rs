//! In-memory database double shared by the integration tests
//!
//! One `kv` table of string keys and values. Statements are dispatched on
//! their leading keyword:
//! - `INSERT ... ($1, $2)` inserts key `$1`; a duplicate key is a constraint
//!   violation
//! - `SELECT COUNT ...` returns the row count, other `SELECT`s every row
//! - `UPDATE` / `DELETE` report the table size as affected rows
//!
//! Statements containing one of the marker words fail on purpose:
//! `BROKEN` (generic failure), `LOSTCONN` (connection dropped),
//! `TIMEOUT` (statement timeout), `SYNTAXERR` (syntax error).
//! `SLOW` makes the statement take 100ms.

#![allow(dead_code)]

use async_trait::async_trait;
use kailash_pool::prelude::*;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("kailash_pool=debug")
        .with_test_writer()
        .try_init();
}

/// Shared state of the fake database server
#[derive(Default)]
pub struct MemoryDb {
    table: Mutex<BTreeMap<String, String>>,
    fail_connects: AtomicUsize,
    probes_fail: AtomicBool,
    probe_delay: Mutex<Duration>,
    connect_delay: Mutex<Duration>,
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub probes: AtomicUsize,
    pub statements: AtomicUsize,
    /// Times a connection was used by two callers at once
    pub overlaps: AtomicUsize,
}

impl MemoryDb {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn factory(self: &Arc<Self>) -> Arc<MemoryFactory> {
        Arc::new(MemoryFactory { db: self.clone() })
    }

    /// Refuse the next `n` connection attempts
    pub fn fail_next_connects(&self, n: usize) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    pub fn set_probes_fail(&self, fail: bool) {
        self.probes_fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_probe_delay(&self, delay: Duration) {
        *self.probe_delay.lock() = delay;
    }

    /// Make every connection attempt take `delay`
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = delay;
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Physical connections currently open
    pub fn live(&self) -> usize {
        self.opened() - self.closed()
    }

    pub fn rows(&self) -> Vec<(String, String)> {
        self.table
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn seed(&self, key: &str, value: &str) {
        self.table.lock().insert(key.into(), value.into());
    }

    fn check_markers(sql: &str) -> Result<()> {
        if sql.contains("LOSTCONN") {
            return Err(Error::connection_lost("server closed the connection"));
        }
        if sql.contains("TIMEOUT") {
            return Err(Error::timeout("canceling statement due to statement timeout"));
        }
        if sql.contains("SYNTAXERR") {
            return Err(Error::query_with_sql(
                QueryErrorKind::Syntax,
                "syntax error at or near \"SYNTAXERR\"",
                sql,
            ));
        }
        if sql.contains("BROKEN") {
            return Err(Error::query_with_sql(
                QueryErrorKind::Other,
                "relation is broken",
                sql,
            ));
        }
        Ok(())
    }

    fn key_value(params: &[Value]) -> Result<(String, String)> {
        match params {
            [k, v, ..] => Ok((
                k.as_str().unwrap_or_default().to_string(),
                v.as_str().unwrap_or_default().to_string(),
            )),
            _ => Err(Error::query(QueryErrorKind::Other, "INSERT needs two parameters")),
        }
    }

    fn select(&self, sql: &str, pending: &[(String, String)]) -> Vec<Row> {
        let table = self.table.lock();
        if sql.to_ascii_uppercase().contains("COUNT") {
            let count = (table.len() + pending.len()) as i64;
            return vec![Row::new(vec!["count".into()], vec![Value::Int64(count)])];
        }
        table
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .chain(pending.iter().cloned())
            .map(|(k, v)| {
                Row::new(
                    vec!["k".into(), "v".into()],
                    vec![Value::String(k), Value::String(v)],
                )
            })
            .collect()
    }
}

pub struct MemoryFactory {
    db: Arc<MemoryDb>,
}

#[async_trait]
impl ConnectionFactory for MemoryFactory {
    async fn connect(&self, _config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let delay = *self.db.connect_delay.lock();
        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }
        let refused = self
            .db
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(Error::connection("connection refused"));
        }
        self.db.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            db: self.db.clone(),
            busy: AtomicBool::new(false),
            dead: AtomicBool::new(false),
        }))
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }
}

pub struct MemoryConnection {
    db: Arc<MemoryDb>,
    busy: AtomicBool,
    dead: AtomicBool,
}

impl MemoryConnection {
    async fn run<T>(&self, sql: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(Error::connection_lost("connection is closed"));
        }
        if self.busy.swap(true, Ordering::SeqCst) {
            self.db.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.db.statements.fetch_add(1, Ordering::SeqCst);

        let delay = if sql.contains("SLOW") {
            Duration::from_millis(100)
        } else {
            Duration::from_millis(1)
        };
        tokio::time::sleep(delay).await;

        let result = MemoryDb::check_markers(sql).and_then(|()| f());
        if matches!(&result, Err(e) if e.is_connection_lost()) {
            self.dead.store(true, Ordering::SeqCst);
        }
        self.busy.store(false, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn query(&self, sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
        self.run(sql, || Ok(self.db.select(sql, &[]))).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.run(sql, || match QueryType::from_sql(sql) {
            QueryType::Insert => {
                let (k, v) = MemoryDb::key_value(params)?;
                let mut table = self.db.table.lock();
                if table.contains_key(&k) {
                    return Err(Error::query_with_sql(
                        QueryErrorKind::ConstraintViolation,
                        format!("duplicate key value violates unique constraint: {k}"),
                        sql,
                    ));
                }
                table.insert(k, v);
                Ok(1)
            }
            QueryType::Delete => {
                let mut table = self.db.table.lock();
                let n = table.len() as u64;
                table.clear();
                Ok(n)
            }
            _ => Ok(self.db.table.lock().len() as u64),
        })
        .await
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(Error::connection_lost("connection is closed"));
        }
        Ok(Box::new(MemoryTransaction {
            db: self.db.clone(),
            pending: Mutex::new(Vec::new()),
        }))
    }

    async fn ping(&self, _probe: &str) -> Result<()> {
        self.db.probes.fetch_add(1, Ordering::SeqCst);
        let delay = *self.db.probe_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.dead.load(Ordering::SeqCst) || self.db.probes_fail.load(Ordering::SeqCst) {
            return Err(Error::connection_lost("probe failed"));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.dead.store(true, Ordering::SeqCst);
        self.db.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Buffers inserts until commit
pub struct MemoryTransaction {
    db: Arc<MemoryDb>,
    pending: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn query(&self, sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
        MemoryDb::check_markers(sql)?;
        let pending = self.pending.lock().clone();
        Ok(self.db.select(sql, &pending))
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        tokio::time::sleep(Duration::from_millis(1)).await;
        MemoryDb::check_markers(sql)?;
        self.db.statements.fetch_add(1, Ordering::SeqCst);
        match QueryType::from_sql(sql) {
            QueryType::Insert => {
                let (k, v) = MemoryDb::key_value(params)?;
                let mut pending = self.pending.lock();
                if self.db.table.lock().contains_key(&k) || pending.iter().any(|(p, _)| *p == k) {
                    return Err(Error::query_with_sql(
                        QueryErrorKind::ConstraintViolation,
                        format!("duplicate key value violates unique constraint: {k}"),
                        sql,
                    ));
                }
                pending.push((k, v));
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let pending = std::mem::take(&mut *self.pending.lock());
        self.db.table.lock().extend(pending);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.pending.lock().clear();
        Ok(())
    }
}

/// Pool configuration against the in-memory database
pub fn config(min: usize, max: usize) -> PoolConfig {
    PoolConfig::new(ConnectionConfig::new(
        DatabaseType::PostgreSQL,
        "localhost",
        "workflow",
    ))
    .with_min_connections(min)
    .with_max_connections(max)
    .with_acquire_timeout(Duration::from_secs(1))
}

pub async fn pool(db: &Arc<MemoryDb>, config: PoolConfig) -> Pool {
    init_tracing();
    Pool::initialize(config, db.factory())
        .await
        .expect("pool initializes")
}

pub fn insert(key: &str) -> (String, Vec<Value>) {
    (
        "INSERT INTO kv (k, v) VALUES ($1, $2)".to_string(),
        vec![Value::from(key), Value::from("v")],
    )
}
