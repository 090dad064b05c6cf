//! Error types for kailash-pool
//!
//! Caller-visible failures fall into four groups:
//! - Configuration errors (fatal, raised by `initialize`)
//! - Pool exhaustion (retriable with backoff)
//! - Open circuit (apply a fallback, do not retry immediately)
//! - Query errors, sub-classified by [`QueryErrorKind`]
//!
//! Health-check failures never appear here; they only move a connection's
//! health score (see [`crate::health`]).

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::breaker::BreakerMetrics;

/// Result type for kailash-pool operations
pub type Result<T> = std::result::Result<T, Error>;

/// What went wrong with a statement the database received
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryErrorKind {
    /// Deadline passed before the server answered
    Timeout,
    /// The socket went away under the statement
    ConnectionLost,
    /// The data broke a declared constraint
    ConstraintViolation,
    /// The server rejected the statement text
    Syntax,
    /// Anything the server reported that fits none of the above
    Other,
}

impl QueryErrorKind {
    /// Snake-case label
    pub const fn label(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ConnectionLost => "connection_lost",
            Self::ConstraintViolation => "constraint_violation",
            Self::Syntax => "syntax",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for QueryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Coarse bucket an [`Error`] falls into, used for retry decisions and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Bad settings
    Configuration,
    /// Every slot stayed busy past the acquire timeout
    PoolExhausted,
    /// Rejected while the breaker is open
    CircuitOpen,
    /// Connect failed, or the link dropped
    Connection,
    /// A deadline passed
    Timeout,
    /// Data rejected by a constraint
    Constraint,
    /// Malformed statement
    Syntax,
    /// Other statement failure
    Query,
    /// BEGIN, COMMIT or ROLLBACK failed
    Transaction,
    /// Misuse of the pool API (double release, unsupported statement)
    Usage,
    /// Everything else
    Other,
}

impl ErrorCategory {
    /// A caller may try again after backing off
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(
            self,
            Self::Connection | Self::Timeout | Self::PoolExhausted
        )
    }

    /// Whether failures of this category indicate an unhealthy database
    /// (and therefore count against the circuit breaker).
    #[inline]
    pub const fn is_infrastructure(self) -> bool {
        matches!(
            self,
            Self::Connection | Self::Timeout | Self::Query | Self::Transaction
        )
    }

    /// Value of the `category` label in the metrics export
    pub const fn label(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::PoolExhausted => "pool_exhausted",
            Self::CircuitOpen => "circuit_open",
            Self::Connection => "connection",
            Self::Timeout => "timeout",
            Self::Constraint => "constraint",
            Self::Syntax => "syntax",
            Self::Query => "query",
            Self::Transaction => "transaction",
            Self::Usage => "usage",
            Self::Other => "other",
        }
    }

    /// All categories, in exposition order
    pub const ALL: [ErrorCategory; 11] = [
        Self::Configuration,
        Self::PoolExhausted,
        Self::CircuitOpen,
        Self::Connection,
        Self::Timeout,
        Self::Constraint,
        Self::Syntax,
        Self::Query,
        Self::Transaction,
        Self::Usage,
        Self::Other,
    ];
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Failure returned by pool operations
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Invalid bounds or settings at initialization
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// No connection became available within the timeout
    #[error("pool exhausted: {message}")]
    PoolExhausted {
        message: String,
        waited: Duration,
    },

    /// The circuit breaker is protecting the database
    #[error("circuit breaker is open ({metrics})")]
    CircuitOpen { metrics: BreakerMetrics },

    /// Opening a connection failed
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The database rejected or lost a statement
    #[error("query error ({kind}): {message}")]
    Query {
        kind: QueryErrorKind,
        message: String,
        sql: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Transaction control failed
    #[error("transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Release of a connection that is not checked out under this lease
    #[error("invalid release of connection {id}: {message}")]
    InvalidRelease { id: u64, message: String },

    /// A handle was used after its connection was released
    #[error("connection {id} is no longer checked out by this handle")]
    StaleHandle { id: u64 },

    /// The pool refuses this request
    #[error("unsupported: {message}")]
    Unsupported { message: String },

    /// Bookkeeping went wrong inside the pool
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Bucket for metrics and retry decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::PoolExhausted { .. } => ErrorCategory::PoolExhausted,
            Self::CircuitOpen { .. } => ErrorCategory::CircuitOpen,
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Query { kind, .. } => match kind {
                QueryErrorKind::Timeout => ErrorCategory::Timeout,
                QueryErrorKind::ConnectionLost => ErrorCategory::Connection,
                QueryErrorKind::ConstraintViolation => ErrorCategory::Constraint,
                QueryErrorKind::Syntax => ErrorCategory::Syntax,
                QueryErrorKind::Other => ErrorCategory::Query,
            },
            Self::Transaction { .. } => ErrorCategory::Transaction,
            Self::InvalidRelease { .. } | Self::StaleHandle { .. } | Self::Unsupported { .. } => {
                ErrorCategory::Usage
            }
            Self::Internal { .. } => ErrorCategory::Other,
        }
    }

    /// Shorthand for `self.category().is_retriable()`
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Whether this error means the physical connection is no longer usable
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::Query {
                    kind: QueryErrorKind::ConnectionLost,
                    ..
                }
        )
    }

    /// [`Error::Configuration`]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// [`Error::PoolExhausted`] after waiting `waited`
    pub fn exhausted(message: impl Into<String>, waited: Duration) -> Self {
        Self::PoolExhausted {
            message: message.into(),
            waited,
        }
    }

    /// [`Error::Connection`]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// [`Error::Connection`] wrapping a driver error
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// [`Error::Query`]
    pub fn query(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Self::Query {
            kind,
            message: message.into(),
            sql: None,
            source: None,
        }
    }

    /// [`Error::Query`] carrying the failed statement text
    pub fn query_with_sql(
        kind: QueryErrorKind,
        message: impl Into<String>,
        sql: impl Into<String>,
    ) -> Self {
        Self::Query {
            kind,
            message: message.into(),
            sql: Some(sql.into()),
            source: None,
        }
    }

    /// Query that ran out of time
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::query(QueryErrorKind::Timeout, message)
    }

    /// Query whose connection dropped
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::query(QueryErrorKind::ConnectionLost, message)
    }

    /// [`Error::Transaction`]
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            source: None,
        }
    }

    /// [`Error::Unsupported`]
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// [`Error::Internal`]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_match_display() {
        for category in ErrorCategory::ALL {
            assert_eq!(category.to_string(), category.label());
        }
        assert_eq!(QueryErrorKind::ConstraintViolation.to_string(), "constraint_violation");
    }

    #[test]
    fn test_connection_lost_detection() {
        assert!(Error::connection("refused").is_connection_lost());
        assert!(Error::connection_lost("eof").is_connection_lost());
        assert!(!Error::timeout("slow").is_connection_lost());
        assert!(!Error::transaction("commit failed").is_connection_lost());
    }

    #[test]
    fn test_exhausted_display() {
        let err = Error::exhausted("timed out after 1000ms", Duration::from_secs(1));
        assert_eq!(err.to_string(), "pool exhausted: timed out after 1000ms");
        assert!(err.is_retriable());
    }
}
