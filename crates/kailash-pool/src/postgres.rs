//! PostgreSQL backend
//!
//! [`PgConnectionFactory`] opens `tokio-postgres` connections from a
//! [`ConnectionConfig`]. Server errors are classified by SQLSTATE so the pool
//! can tell connection loss and timeouts (which count against the circuit
//! breaker and decay health) from constraint and syntax errors (which do not).

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::Client;
use tracing::debug;

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, DatabaseType, Transaction};
use crate::error::{Error, QueryErrorKind, Result};
use crate::types::{Row, Value};

/// Map a SQLSTATE code to a query error kind
pub fn classify_sqlstate(code: &str) -> QueryErrorKind {
    match code {
        // query_canceled (statement_timeout), lock_not_available
        "57014" | "55P03" => QueryErrorKind::Timeout,
        // admin_shutdown, crash_shutdown, cannot_connect_now
        "57P01" | "57P02" | "57P03" => QueryErrorKind::ConnectionLost,
        "42601" => QueryErrorKind::Syntax,
        _ if code.starts_with("08") => QueryErrorKind::ConnectionLost,
        _ if code.starts_with("23") => QueryErrorKind::ConstraintViolation,
        _ if code.starts_with("42") => QueryErrorKind::Syntax,
        _ => QueryErrorKind::Other,
    }
}

fn query_error(e: tokio_postgres::Error, sql: &str) -> Error {
    let kind = if e.is_closed() {
        QueryErrorKind::ConnectionLost
    } else {
        e.code()
            .map(|state| classify_sqlstate(state.code()))
            .unwrap_or(QueryErrorKind::Other)
    };
    Error::Query {
        kind,
        message: e.to_string(),
        sql: Some(sql.to_string()),
        source: Some(Box::new(e)),
    }
}

fn transaction_error(e: tokio_postgres::Error) -> Error {
    if e.is_closed() {
        return Error::connection_lost(e.to_string());
    }
    Error::Transaction {
        message: e.to_string(),
        source: Some(Box::new(e)),
    }
}

fn value_to_sql(value: &Value) -> Box<dyn ToSql + Sync + Send> {
    match value {
        Value::Null => Box::new(Option::<String>::None),
        Value::Bool(b) => Box::new(*b),
        Value::Int32(n) => Box::new(*n),
        Value::Int64(n) => Box::new(*n),
        Value::Float64(n) => Box::new(*n),
        Value::String(s) => Box::new(s.clone()),
        Value::Bytes(b) => Box::new(b.clone()),
        Value::Json(j) => Box::new(j.clone()),
    }
}

fn pg_row_to_row(pg_row: &tokio_postgres::Row) -> Row {
    let columns = pg_row
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    let values = pg_row
        .columns()
        .iter()
        .enumerate()
        .map(|(i, col)| pg_value_to_value(pg_row, i, col.type_()))
        .collect();
    Row::new(columns, values)
}

fn pg_value_to_value(row: &tokio_postgres::Row, idx: usize, pg_type: &Type) -> Value {
    fn get<'a, T: tokio_postgres::types::FromSql<'a>>(
        row: &'a tokio_postgres::Row,
        idx: usize,
    ) -> Option<T> {
        row.try_get::<_, Option<T>>(idx).ok().flatten()
    }

    let value = match *pg_type {
        Type::BOOL => get::<bool>(row, idx).map(Value::Bool),
        Type::INT2 => get::<i16>(row, idx).map(|n| Value::Int32(i32::from(n))),
        Type::INT4 => get::<i32>(row, idx).map(Value::Int32),
        Type::INT8 => get::<i64>(row, idx).map(Value::Int64),
        Type::FLOAT4 => get::<f32>(row, idx).map(|n| Value::Float64(f64::from(n))),
        Type::FLOAT8 => get::<f64>(row, idx).map(Value::Float64),
        Type::BYTEA => get::<Vec<u8>>(row, idx).map(Value::Bytes),
        Type::JSON | Type::JSONB => get::<serde_json::Value>(row, idx).map(Value::Json),
        _ => get::<String>(row, idx).map(Value::String),
    };
    value.unwrap_or(Value::Null)
}

async fn run_query(client: &Client, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
    let owned: Vec<_> = params.iter().map(value_to_sql).collect();
    let bound: Vec<&(dyn ToSql + Sync)> =
        owned.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();
    let rows = client.query(sql, &bound).await.map_err(|e| query_error(e, sql))?;
    Ok(rows.iter().map(pg_row_to_row).collect())
}

async fn run_execute(client: &Client, sql: &str, params: &[Value]) -> Result<u64> {
    let owned: Vec<_> = params.iter().map(value_to_sql).collect();
    let bound: Vec<&(dyn ToSql + Sync)> =
        owned.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();
    client.execute(sql, &bound).await.map_err(|e| query_error(e, sql))
}

/// A pooled `tokio-postgres` session
pub struct PgConnection {
    client: Arc<Client>,
    closed: AtomicBool,
}

impl PgConnection {
    /// Wrap a connected client
    pub fn new(client: Client) -> Self {
        Self {
            client: Arc::new(client),
            closed: AtomicBool::new(false),
        }
    }

    /// Driver client, for statements the pool API does not cover
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) || self.client.is_closed() {
            return Err(Error::connection_lost("connection is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.ensure_open()?;
        run_query(&self.client, sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.ensure_open()?;
        run_execute(&self.client, sql, params).await
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.ensure_open()?;
        self.client
            .batch_execute("BEGIN")
            .await
            .map_err(transaction_error)?;
        Ok(Box::new(PgTransaction {
            client: Arc::clone(&self.client),
        }))
    }

    async fn ping(&self, probe: &str) -> Result<()> {
        self.ensure_open()?;
        self.client
            .simple_query(probe)
            .await
            .map(|_| ())
            .map_err(|e| query_error(e, probe))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// Open transaction on a [`PgConnection`]
pub struct PgTransaction {
    client: Arc<Client>,
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        run_query(&self.client, sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        run_execute(&self.client, sql, params).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.client
            .batch_execute("COMMIT")
            .await
            .map_err(transaction_error)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.client
            .batch_execute("ROLLBACK")
            .await
            .map_err(transaction_error)
    }
}

/// Opens [`PgConnection`]s without TLS
#[derive(Debug, Clone, Default)]
pub struct PgConnectionFactory;

impl PgConnectionFactory {
    fn pg_config(config: &ConnectionConfig) -> tokio_postgres::Config {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&config.host)
            .port(config.effective_port())
            .dbname(&config.database)
            .connect_timeout(config.connect_timeout);
        if let Some(user) = &config.username {
            pg.user(user);
        }
        if let Some(password) = &config.password {
            pg.password(password.expose());
        }
        if let Some(name) = &config.application_name {
            pg.application_name(name);
        }
        pg
    }
}

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let (client, connection) = Self::pg_config(config)
            .connect(tokio_postgres::NoTls)
            .await
            .map_err(|e| Error::connection_with_source("failed to connect to PostgreSQL", e))?;

        let target = config.redacted_url();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(database = %target, error = %e, "PostgreSQL connection closed");
            }
        });

        Ok(Box::new(PgConnection::new(client)))
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }
}
