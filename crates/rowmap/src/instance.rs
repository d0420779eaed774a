//! Single executions of a cached statement.

use std::sync::Arc;
use std::time::{Duration, Instant};

use asupersync::{Cx, Outcome};
use serde::Serialize;

use rowmap_core::{
    Connection, DriverError, Error, ErrorKind, PreparedStatement, Result, Row, Timestamp,
    TransactionOps, Value,
};

use crate::db::Db;
use crate::statement::CachedStatement;
use crate::transaction::Transaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Created,
    /// Sent to the driver; for queries, rows may still be pending fetch.
    Executing,
    Succeeded,
    Failed,
    Closed,
}

/// Per-execution statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstanceStats {
    pub key: String,
    /// 1-based execution number for the statement.
    pub seq: u64,
    pub tx_id: Option<u64>,
    pub started_at: Option<Timestamp>,
    /// Time until the driver responded.
    pub responded_in: Duration,
    pub rows_fetched: u64,
    /// Time spent handing rows to the caller.
    pub fetched_in: Duration,
    pub rows_affected: u64,
    pub failed: bool,
}

/// One use of a [`CachedStatement`], optionally inside a transaction.
///
/// An instance executes once. If execution or row processing fails, the
/// error is kept and returned again by every later call.
pub struct Instance<'a, C: Connection> {
    db: &'a Db<C>,
    stmt: Arc<CachedStatement>,
    tx: Option<&'a Transaction<C>>,
    state: InstanceState,
    stats: InstanceStats,
    error: Option<Error>,
    params: Vec<Value>,
    secret: Vec<bool>,
    rows: std::vec::IntoIter<Row>,
}

impl<'a, C: Connection> Instance<'a, C> {
    pub(crate) fn new(
        db: &'a Db<C>,
        stmt: Arc<CachedStatement>,
        tx: Option<&'a Transaction<C>>,
    ) -> Self {
        let seq = stmt.touch();
        let stats = InstanceStats {
            key: stmt.key().to_string(),
            seq,
            tx_id: tx.map(Transaction::id),
            ..InstanceStats::default()
        };
        Self {
            db,
            stmt,
            tx,
            state: InstanceState::Created,
            stats,
            error: None,
            params: Vec::new(),
            secret: Vec::new(),
            rows: Vec::new().into_iter(),
        }
    }

    /// Flag parameters holding secret values. They are masked in the frozen
    /// error and in everything the observer is handed.
    pub fn masking(mut self, secret: &[bool]) -> Self {
        self.secret = secret.to_vec();
        self
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn stats(&self) -> InstanceStats {
        self.stats.clone()
    }

    /// The frozen error, if execution or row processing failed.
    pub fn err(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub fn statement(&self) -> &CachedStatement {
        &self.stmt
    }

    /// Execute without reading rows. Returns the affected row count.
    pub async fn exec(&mut self, cx: &Cx, params: &[Value]) -> Result<u64> {
        let stmt = self.start(cx, params)?;
        let prepared = self.prepared(&stmt)?;
        let started = Instant::now();
        let outcome = match self.tx {
            Some(tx) => match tx.native() {
                Ok(native) => native.execute_prepared(cx, prepared, params).await,
                Err(e) => return Err(self.fail(e)),
            },
            None => {
                self.db
                    .connection()
                    .execute_prepared(cx, prepared, params)
                    .await
            }
        };
        self.stats.responded_in = started.elapsed();
        match settle(outcome) {
            Ok(affected) => {
                self.stats.rows_affected = affected;
                self.succeed();
                Ok(affected)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Execute and open the result rows for [`fetch`](Self::fetch) or
    /// [`next_row`](Self::next_row).
    pub async fn query(&mut self, cx: &Cx, params: &[Value]) -> Result<()> {
        let rows = self.run_query(cx, params).await?;
        self.stats.rows_affected = rows.len() as u64;
        self.rows = rows.into_iter();
        Ok(())
    }

    /// Execute and return the first row; no row is a `NotFound` error.
    pub async fn query_row(&mut self, cx: &Cx, params: &[Value]) -> Result<Row> {
        let rows = self.run_query(cx, params).await?;
        match rows.into_iter().next() {
            Some(row) => {
                self.stats.rows_fetched = 1;
                self.succeed();
                Ok(row)
            }
            None => Err(self.fail(Error::not_found("no rows in result set"))),
        }
    }

    /// Execute and collect every row.
    pub async fn query_all(&mut self, cx: &Cx, params: &[Value]) -> Result<Vec<Row>> {
        let rows = self.run_query(cx, params).await?;
        self.stats.rows_fetched = rows.len() as u64;
        self.succeed();
        Ok(rows)
    }

    /// Hand each pending row to `f`, in order. Stops at the first error,
    /// which is frozen with the index of the failing row.
    pub fn fetch<F>(&mut self, mut f: F) -> Result<u64>
    where
        F: FnMut(Row) -> Result<()>,
    {
        self.expect_open_cursor()?;
        let started = Instant::now();
        while let Some(row) = self.rows.next() {
            let index = self.stats.rows_fetched;
            if let Err(e) = f(row) {
                self.stats.fetched_in += started.elapsed();
                return Err(self.fail(e.with_row(index)));
            }
            self.stats.rows_fetched += 1;
        }
        self.stats.fetched_in += started.elapsed();
        self.succeed();
        Ok(self.stats.rows_fetched)
    }

    /// Next pending row, `None` once the rows are exhausted.
    pub fn next_row(&mut self) -> Option<Row> {
        if self.state != InstanceState::Executing {
            return None;
        }
        match self.rows.next() {
            Some(row) => {
                self.stats.rows_fetched += 1;
                Some(row)
            }
            None => {
                self.succeed();
                None
            }
        }
    }

    /// Release pending rows. Returns the frozen error, if any.
    pub fn close(&mut self) -> Result<()> {
        self.rows = Vec::new().into_iter();
        if self.state == InstanceState::Executing {
            self.succeed();
        }
        self.state = InstanceState::Closed;
        match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn run_query(&mut self, cx: &Cx, params: &[Value]) -> Result<Vec<Row>> {
        let stmt = self.start(cx, params)?;
        let prepared = self.prepared(&stmt)?;
        let started = Instant::now();
        let outcome = match self.tx {
            Some(tx) => match tx.native() {
                Ok(native) => native.query_prepared(cx, prepared, params).await,
                Err(e) => return Err(self.fail(e)),
            },
            None => {
                self.db
                    .connection()
                    .query_prepared(cx, prepared, params)
                    .await
            }
        };
        self.stats.responded_in = started.elapsed();
        settle(outcome).map_err(|e| self.fail(e))
    }

    /// Move from `Created` to `Executing`.
    fn start(&mut self, cx: &Cx, params: &[Value]) -> Result<Arc<CachedStatement>> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if self.state != InstanceState::Created {
            return Err(Error::query(
                ErrorKind::Execution,
                format!("statement {} instance {} already executed", self.stats.key, self.stats.seq),
            ));
        }
        self.params = mask_secrets(params, &self.secret);
        self.stats.started_at = Some(Timestamp::now());
        self.state = InstanceState::Executing;

        if self.stmt.is_closed() {
            let err = self.stmt.closed_error();
            return Err(self.fail(err));
        }
        if let Some(reason) = cx.cancel_reason() {
            return Err(self.fail(Error::cancelled(format!(
                "cancelled before execution: {reason:?}"
            ))));
        }
        Ok(Arc::clone(&self.stmt))
    }

    fn prepared<'s>(&mut self, stmt: &'s CachedStatement) -> Result<&'s PreparedStatement> {
        match stmt.prepared() {
            Some(Ok(prepared)) => Ok(prepared),
            Some(Err(e)) => Err(self.fail(e)),
            None => Err(self.fail(Error::query(
                ErrorKind::Preparation,
                format!("statement {} is not prepared", self.stats.key),
            ))),
        }
    }

    fn expect_open_cursor(&self) -> Result<()> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if self.state == InstanceState::Executing {
            Ok(())
        } else {
            Err(Error::query(
                ErrorKind::Execution,
                format!("statement {} has no open result rows", self.stats.key),
            ))
        }
    }

    fn succeed(&mut self) {
        if self.state == InstanceState::Executing {
            self.state = InstanceState::Succeeded;
            self.db.observer().on_finish(&self.stats, None);
        }
    }

    /// Freeze `err` as this instance's outcome and return it.
    fn fail(&mut self, err: Error) -> Error {
        let err = err.with_statement(self.stmt.sql(), &self.params);
        self.state = InstanceState::Failed;
        self.stats.failed = true;
        self.rows = Vec::new().into_iter();
        self.error = Some(err.clone());
        self.db.observer().on_finish(&self.stats, Some(&err));
        err
    }
}

pub(crate) const MASK: &str = "***";

/// Replace non-null values flagged in `secret` with [`MASK`].
pub(crate) fn mask_secrets(values: &[Value], secret: &[bool]) -> Vec<Value> {
    values
        .iter()
        .enumerate()
        .map(|(i, value)| {
            if secret.get(i).copied().unwrap_or(false) && !value.is_null() {
                Value::Text(MASK.to_string())
            } else {
                value.clone()
            }
        })
        .collect()
}

fn settle<T>(outcome: Outcome<T, DriverError>) -> Result<T> {
    match outcome {
        Outcome::Ok(value) => Ok(value),
        Outcome::Err(e) => Err(e.into()),
        Outcome::Cancelled(reason) => Err(Error::cancelled(format!(
            "statement cancelled: {reason:?}"
        ))),
        Outcome::Panicked(info) => Err(Error::query(
            ErrorKind::Execution,
            format!("driver panicked: {info:?}"),
        )),
    }
}

impl<C: Connection> std::fmt::Debug for Instance<'_, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("key", &self.stats.key)
            .field("seq", &self.stats.seq)
            .field("state", &self.state)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}
