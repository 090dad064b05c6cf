//! Value and result types for kailash-pool
//!
//! The pool treats the database protocol as opaque, so the value model only
//! covers what callers pass as parameters and read back from rows:
//! - Scalar values (bool, integers, floats, text, bytes, JSON)
//! - Rows with named columns
//! - Fetch modes and query outcomes for `execute`
//! - Statement classification used for metrics labels

use serde::{Deserialize, Serialize};
use std::fmt;

/// A parameter bound to a statement, or a column read back from a row.
///
/// Integer and float widths follow what the drivers hand back; narrower
/// database types are widened on the way in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL
    Null,
    /// Boolean
    Bool(bool),
    /// 4-byte integer
    Int32(i32),
    /// 8-byte integer
    Int64(i64),
    /// Double precision float
    Float64(f64),
    /// Text of any length
    String(String),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Structured document
    Json(serde_json::Value),
}

impl Value {
    /// `true` for `Value::Null`
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Borrow the text payload
    pub fn as_str(&self) -> Option<&str> {
        if let Self::String(text) = self {
            Some(text)
        } else {
            None
        }
    }

    /// Integer view of the value; parses text and drops float fractions
    pub fn as_int(&self) -> Option<i64> {
        match *self {
            Self::Int32(n) => Some(n.into()),
            Self::Int64(n) => Some(n),
            Self::Float64(f) if f.is_finite() => Some(f.trunc() as i64),
            Self::String(ref text) => text.trim().parse().ok(),
            _ => None,
        }
    }

    /// Short name of the variant
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int32(_) => "int32",
            Self::Int64(_) => "int64",
            Self::Float64(_) => "float64",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(inner: $ty) -> Self {
                    Self::$variant(inner.into())
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i32 => Int32,
    i64 => Int64,
    f64 => Float64,
    String => String,
    &str => String,
    Vec<u8> => Bytes,
    serde_json::Value => Json,
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(inner: Option<T>) -> Self {
        inner.map_or(Self::Null, Into::into)
    }
}

/// One result row: column names paired with their values
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    /// Build a row; `columns` and `values` are positional pairs
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Number of columns
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no columns
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Column names in result order
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Values in result order
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Value at a column position
    pub fn get(&self, position: usize) -> Option<&Value> {
        self.values.get(position)
    }

    /// Value under a column name (ASCII case-insensitive)
    pub fn get_by_name(&self, column: &str) -> Option<&Value> {
        let position = self
            .columns
            .iter()
            .position(|name| name.eq_ignore_ascii_case(column))?;
        self.values.get(position)
    }

    /// Iterate `(column, value)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(String::as_str).zip(&self.values)
    }
}

/// How many rows `execute` should return
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchMode {
    /// Return every row
    #[default]
    All,
    /// Return at most the first row
    One,
    /// Return at most `n` rows
    Many(usize),
    /// Run as a statement; only the affected-row count is returned
    None,
}

impl FetchMode {
    /// Truncate a row set according to this mode
    pub fn apply(self, mut rows: Vec<Row>) -> Vec<Row> {
        match self {
            Self::All => rows,
            Self::One => {
                rows.truncate(1);
                rows
            }
            Self::Many(n) => {
                rows.truncate(n);
                rows
            }
            Self::None => Vec::new(),
        }
    }
}

/// Result of one executed statement
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOutcome {
    /// Rows returned (empty for statements)
    pub rows: Vec<Row>,
    /// Rows affected (0 for queries)
    pub rows_affected: u64,
}

impl QueryOutcome {
    /// Outcome of a row-returning query
    pub fn rows(rows: Vec<Row>) -> Self {
        Self {
            rows,
            rows_affected: 0,
        }
    }

    /// Outcome of a data-modifying statement
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows: Vec::new(),
            rows_affected,
        }
    }

    /// First row, if any
    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }
}

/// Statement classification, used as a metrics label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryType {
    /// SELECT / WITH / SHOW / EXPLAIN / VALUES
    Select,
    /// INSERT
    Insert,
    /// UPDATE
    Update,
    /// DELETE
    Delete,
    /// CREATE / ALTER / DROP / TRUNCATE
    Ddl,
    /// BEGIN / COMMIT / ROLLBACK / SAVEPOINT
    Transaction,
    /// Anything else
    Other,
}

impl QueryType {
    /// Classify a statement by its leading keyword
    pub fn from_sql(sql: &str) -> Self {
        let keyword = sql
            .trim_start_matches(|c: char| c.is_whitespace() || c == '(')
            .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();

        match keyword.as_str() {
            "SELECT" | "WITH" | "SHOW" | "EXPLAIN" | "VALUES" | "TABLE" => Self::Select,
            "INSERT" => Self::Insert,
            "UPDATE" => Self::Update,
            "DELETE" => Self::Delete,
            "CREATE" | "ALTER" | "DROP" | "TRUNCATE" => Self::Ddl,
            "BEGIN" | "START" | "COMMIT" | "ROLLBACK" | "SAVEPOINT" | "RELEASE" => {
                Self::Transaction
            }
            _ => Self::Other,
        }
    }

    /// Whether statements of this type leave data untouched
    #[inline]
    pub const fn is_read_only(self) -> bool {
        matches!(self, Self::Select)
    }

    /// Label value for metrics
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Ddl => "ddl",
            Self::Transaction => "transaction",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
