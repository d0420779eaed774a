//! Error types for rowmap.
//!
//! Two families exist. [`ConfigError`] covers faults in how records, tags or
//! statements are described; these are detected before any SQL runs and never
//! change between calls. [`QueryError`] covers everything that happens while
//! talking to the database, classified into a small set of [`ErrorKind`]s that
//! callers can branch on.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Result alias used throughout rowmap.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone)]
pub enum Error {
    /// Record, tag or statement description fault.
    Config(ConfigError),
    /// Failure reported while preparing or executing a statement.
    Query(QueryError),
}

/// Classification of database-side failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A single-row read found nothing.
    NotFound,
    /// SQLSTATE 23505.
    UniqueViolation,
    /// SQLSTATE 23514.
    CheckViolation,
    /// The connection is gone or was never usable.
    ConnectionLost,
    /// Any other execution failure.
    Execution,
    /// The server rejected the statement at preparation time.
    Preparation,
    /// The operation was cancelled through its context.
    Cancelled,
    /// The prepared statement was closed underneath the caller.
    StatementClosed,
}

impl ErrorKind {
    /// Map a five-character SQLSTATE to a kind.
    pub fn from_sqlstate(code: &str) -> Self {
        match code {
            "23505" => ErrorKind::UniqueViolation,
            "23514" => ErrorKind::CheckViolation,
            "57014" => ErrorKind::Cancelled,
            "26000" => ErrorKind::StatementClosed,
            // Class 08 codes that mean the session is gone. Protocol
            // violations (08P01) leave it usable.
            "08000" | "08001" | "08003" | "08004" | "08006" => ErrorKind::ConnectionLost,
            _ => ErrorKind::Execution,
        }
    }

    /// HTTP-style status code for surfacing errors at a service boundary.
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::UniqueViolation => 409,
            ErrorKind::CheckViolation => 400,
            ErrorKind::ConnectionLost => 503,
            ErrorKind::Execution => 500,
            ErrorKind::Preparation => 500,
            ErrorKind::Cancelled => 499,
            ErrorKind::StatementClosed => 503,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::UniqueViolation => "unique violation",
            ErrorKind::CheckViolation => "check violation",
            ErrorKind::ConnectionLost => "connection lost",
            ErrorKind::Execution => "execution failed",
            ErrorKind::Preparation => "preparation failed",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::StatementClosed => "statement closed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    UnknownLabel { field: String, label: String },
    MalformedTag { field: String, tag: String },
    MalformedTagRule { rule: String },
    UninitializedEmbedded { field: String },
    CyclicEmbedding { type_name: String },
    DuplicateColumn { table: String, column: String },
    /// The operation needs a column the record does not map.
    MissingColumn { table: String, column: String },
    UnknownColumn { table: String, column: String },
    EmptyColumnList { table: String, statement: &'static str },
    ParamCountMismatch { expected: usize, got: usize },
    InvalidOptions { message: String },
    /// Table construction panicked inside a binder worker.
    BindPanicked { table: String },
    /// One binder received several registrations under the same name.
    DuplicateTable { table: String, count: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::UnknownLabel { field, label } => {
                write!(f, "field '{field}': unknown tag label '{label}'")
            }
            ConfigError::MalformedTag { field, tag } => {
                write!(f, "field '{field}': malformed tag '{tag}'")
            }
            ConfigError::MalformedTagRule { rule } => write!(f, "malformed tag rule '{rule}'"),
            ConfigError::UninitializedEmbedded { field } => {
                write!(f, "embedded record '{field}' is not initialized")
            }
            ConfigError::CyclicEmbedding { type_name } => {
                write!(f, "record '{type_name}' embeds itself")
            }
            ConfigError::DuplicateColumn { table, column } => {
                write!(f, "table '{table}': column '{column}' is mapped twice")
            }
            ConfigError::MissingColumn { table, column } => {
                write!(f, "table '{table}': operation requires column '{column}'")
            }
            ConfigError::UnknownColumn { table, column } => {
                write!(f, "table '{table}': no field maps to column '{column}'")
            }
            ConfigError::EmptyColumnList { table, statement } => {
                write!(f, "table '{table}': {statement} has no columns to write")
            }
            ConfigError::ParamCountMismatch { expected, got } => write!(
                f,
                "condition has {expected} placeholders but {got} parameters were given"
            ),
            ConfigError::InvalidOptions { message } => write!(f, "invalid options: {message}"),
            ConfigError::BindPanicked { table } => {
                write!(f, "table '{table}': construction panicked")
            }
            ConfigError::DuplicateTable { table, count } => {
                write!(f, "table '{table}' is registered {count} times")
            }
        }
    }
}

/// A classified database failure with statement context.
#[derive(Debug, Clone)]
pub struct QueryError {
    pub kind: ErrorKind,
    pub message: String,
    /// SQLSTATE reported by the driver, if any.
    pub sqlstate: Option<String>,
    pub constraint: Option<String>,
    pub column: Option<String>,
    pub table: Option<String>,
    pub sql: Option<String>,
    /// Bound parameters, with secret-tagged values already masked.
    pub params: Vec<Value>,
    /// Zero-based index of the row being processed when a fetch failed.
    pub row: Option<u64>,
}

impl QueryError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            sqlstate: None,
            constraint: None,
            column: None,
            table: None,
            sql: None,
            params: Vec::new(),
            row: None,
        }
    }

    /// Classify a raw driver failure.
    pub fn classify(err: DriverError) -> Self {
        let kind = match err.kind {
            DriverErrorKind::NoRows => ErrorKind::NotFound,
            DriverErrorKind::ConnectionDone => ErrorKind::ConnectionLost,
            DriverErrorKind::Cancelled => ErrorKind::Cancelled,
            DriverErrorKind::StatementClosed => ErrorKind::StatementClosed,
            DriverErrorKind::Database => err
                .code
                .as_deref()
                .map_or(ErrorKind::Execution, ErrorKind::from_sqlstate),
        };
        Self {
            kind,
            message: err.message,
            sqlstate: err.code,
            constraint: err.constraint,
            column: err.column,
            table: err.table,
            sql: None,
            params: Vec::new(),
            row: None,
        }
    }

    /// Structured representation for logs and API responses.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": self.kind,
            "status": self.kind.status_code(),
            "message": self.message,
            "sqlstate": self.sqlstate,
            "constraint": self.constraint,
            "column": self.column,
            "table": self.table,
            "sql": self.sql,
            "params": self.params,
            "row": self.row,
        })
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(code) = &self.sqlstate {
            write!(f, " [{code}]")?;
        }
        if let Some(table) = &self.table {
            write!(f, " (table: {table})")?;
        }
        if let Some(row) = self.row {
            write!(f, " (row: {row})")?;
        }
        if let Some(sql) = &self.sql {
            write!(f, " sql: {sql}")?;
            if !self.params.is_empty() {
                let params = self
                    .params
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, " params: [{params}]")?;
            }
        }
        Ok(())
    }
}

impl Error {
    pub fn query(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error::Query(QueryError::new(kind, message))
    }

    /// Value could not be converted to the requested Rust type.
    pub fn conversion(message: impl Into<String>) -> Self {
        Error::query(ErrorKind::Execution, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Error::query(ErrorKind::NotFound, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Error::query(ErrorKind::Cancelled, message)
    }

    /// Query failure kind, `None` for configuration faults.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::Query(q) => Some(q.kind),
            Error::Config(_) => None,
        }
    }

    pub fn is_kind(&self, kind: ErrorKind) -> bool {
        self.kind() == Some(kind)
    }

    pub fn is_not_found(&self) -> bool {
        self.is_kind(ErrorKind::NotFound)
    }

    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_))
    }

    /// Failures that may succeed when the same call is repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            Some(ErrorKind::Cancelled | ErrorKind::ConnectionLost | ErrorKind::StatementClosed)
        )
    }

    /// Failures that indicate the connection or program state is broken.
    pub fn is_critical(&self) -> bool {
        match self {
            Error::Config(_) => true,
            Error::Query(q) => matches!(q.kind, ErrorKind::ConnectionLost),
        }
    }

    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            Error::Config(_) => None,
        }
    }

    /// Attach the statement text and parameters, keeping any already set.
    pub fn with_statement(mut self, sql: &str, params: &[Value]) -> Self {
        if let Error::Query(q) = &mut self {
            if q.sql.is_none() {
                q.sql = Some(sql.to_string());
                q.params = params.to_vec();
            }
        }
        self
    }

    /// Attach the table name and replace parameters with their masked form.
    pub fn with_table(mut self, table: &str, masked: &[Value]) -> Self {
        if let Error::Query(q) = &mut self {
            q.table = Some(table.to_string());
            q.params = masked.to_vec();
        }
        self
    }

    pub fn with_row(mut self, row: u64) -> Self {
        if let Error::Query(q) = &mut self {
            q.row.get_or_insert(row);
        }
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(e) => write!(f, "configuration error: {e}"),
            Error::Query(e) => write!(f, "query error: {e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<DriverError> for Error {
    fn from(err: DriverError) -> Self {
        Error::Query(QueryError::classify(err))
    }
}

/// Raw failure as reported by a driver, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub message: String,
    pub code: Option<String>,
    pub constraint: Option<String>,
    pub column: Option<String>,
    pub table: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    NoRows,
    ConnectionDone,
    Cancelled,
    StatementClosed,
    /// Server-reported error; `code` carries the SQLSTATE.
    Database,
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            constraint: None,
            column: None,
            table: None,
        }
    }

    pub fn database(code: &str, message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Database, message).with_code(code)
    }

    pub fn with_code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }

    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraint = Some(constraint.into());
        self
    }

    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({code})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for DriverError {}
