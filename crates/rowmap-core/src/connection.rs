//! The driver seam.
//!
//! rowmap never speaks a wire protocol itself. A driver implements
//! [`Connection`] (and [`TransactionOps`] for its transaction handle); every
//! method takes the caller's [`Cx`] so cancellation reaches the driver, and
//! reports failures as raw [`DriverError`]s that rowmap classifies.

use std::future::Future;

use asupersync::{Cx, Outcome};

use crate::dialect::PlaceholderStyle;
use crate::error::DriverError;
use crate::row::Row;
use crate::value::Value;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub const fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Server-side prepared statement handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    id: u64,
    sql: String,
    param_count: usize,
}

impl PreparedStatement {
    pub fn new(id: u64, sql: String, param_count: usize) -> Self {
        Self {
            id,
            sql,
            param_count,
        }
    }

    /// Driver-assigned identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn param_count(&self) -> usize {
        self.param_count
    }
}

/// A database connection as seen by rowmap.
///
/// Implementations must be safe to share between concurrent callers; rowmap
/// holds one connection per `Db` and issues statements on it from many tasks.
pub trait Connection: Send + Sync {
    /// Transaction handle returned by [`Connection::begin`].
    type Tx: TransactionOps;

    /// Placeholder syntax understood by the server.
    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::Dollar
    }

    fn prepare(
        &self,
        cx: &Cx,
        sql: &str,
    ) -> impl Future<Output = Outcome<PreparedStatement, DriverError>> + Send;

    /// Release a server-side statement.
    fn close_prepared(
        &self,
        cx: &Cx,
        stmt: &PreparedStatement,
    ) -> impl Future<Output = Outcome<(), DriverError>> + Send;

    fn query_prepared(
        &self,
        cx: &Cx,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, DriverError>> + Send;

    /// Execute a statement, returning the number of affected rows.
    fn execute_prepared(
        &self,
        cx: &Cx,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, DriverError>> + Send;

    fn begin(
        &self,
        cx: &Cx,
        isolation: IsolationLevel,
    ) -> impl Future<Output = Outcome<Self::Tx, DriverError>> + Send;

    fn ping(&self, cx: &Cx) -> impl Future<Output = Outcome<(), DriverError>> + Send;

    fn close(&self, cx: &Cx) -> impl Future<Output = Outcome<(), DriverError>> + Send;
}

/// Statements issued inside an open transaction.
pub trait TransactionOps: Send + Sync {
    fn query_prepared(
        &self,
        cx: &Cx,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, DriverError>> + Send;

    fn execute_prepared(
        &self,
        cx: &Cx,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, DriverError>> + Send;

    fn commit(self, cx: &Cx) -> impl Future<Output = Outcome<(), DriverError>> + Send;

    fn rollback(self, cx: &Cx) -> impl Future<Output = Outcome<(), DriverError>> + Send;
}
