//! The shared connection handle and its statement cache.

use std::collections::HashMap;
use std::ops::AsyncFnOnce;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use asupersync::{Cx, Outcome};

use rowmap_core::{
    Connection, Error, ErrorKind, IsolationLevel, LabelRegistry, PlaceholderStyle, Result, Row,
    Value,
};

use crate::config::DbConfig;
use crate::instance::Instance;
use crate::observer::{StatementObserver, TracingObserver};
use crate::statement::{CachedStatement, statement_key};
use crate::transaction::Transaction;

/// A database connection shared by every table bound to it.
///
/// `Db` owns the statement cache: each distinct statement is prepared once
/// per `Db` and reused by all callers. Cache reads never wait on a
/// preparation in progress for a different statement.
pub struct Db<C: Connection> {
    conn: C,
    statements: RwLock<HashMap<String, Arc<CachedStatement>>>,
    epoch: Instant,
    tx_seq: AtomicU64,
    style: PlaceholderStyle,
    labels: LabelRegistry,
    config: DbConfig,
    observer: Arc<dyn StatementObserver>,
}

impl<C: Connection> Db<C> {
    /// Wrap a connection with the default configuration.
    pub fn new(conn: C) -> Self {
        let style = conn.placeholder_style();
        Self {
            conn,
            statements: RwLock::new(HashMap::new()),
            epoch: Instant::now(),
            tx_seq: AtomicU64::new(0),
            style,
            labels: LabelRegistry::new(),
            config: DbConfig::default(),
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_config(conn: C, config: DbConfig) -> Result<Self> {
        let labels = config.label_registry()?;
        let mut db = Self::new(conn);
        if let Some(style) = config.placeholder {
            db.style = style;
        }
        db.labels = labels;
        db.config = config;
        Ok(db)
    }

    pub fn with_observer(mut self, observer: Arc<dyn StatementObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn connection(&self) -> &C {
        &self.conn
    }

    pub fn placeholder_style(&self) -> PlaceholderStyle {
        self.style
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    pub fn labels(&self) -> &LabelRegistry {
        &self.labels
    }

    pub(crate) fn observer(&self) -> &dyn StatementObserver {
        self.observer.as_ref()
    }

    // ==================== Statement cache ====================

    /// Prepared statement for `sql`, keyed by its content hash.
    pub async fn prepare(&self, cx: &Cx, sql: &str) -> Result<Arc<CachedStatement>> {
        let key = statement_key(sql);
        self.resolve(cx, &key, || Ok(sql.to_string())).await
    }

    /// Prepared statement for `sql` under a caller-chosen key.
    pub async fn prepare_named(
        &self,
        cx: &Cx,
        key: &str,
        sql: &str,
    ) -> Result<Arc<CachedStatement>> {
        self.resolve(cx, key, || Ok(sql.to_string())).await
    }

    /// Cached statement for `key`, generating its text with `source` only
    /// when the key is not cached yet.
    ///
    /// If two callers race on a new key, one entry wins and both use it. The
    /// winner's preparation outcome, success or failure, is what every
    /// caller of that key sees until it is evicted.
    pub async fn resolve<F>(&self, cx: &Cx, key: &str, source: F) -> Result<Arc<CachedStatement>>
    where
        F: FnOnce() -> Result<String>,
    {
        let stmt = match self.statement(key) {
            Some(stmt) => stmt,
            None => {
                let sql = source()?;
                let candidate = Arc::new(CachedStatement::new(
                    key.to_string(),
                    sql.trim().to_string(),
                    self.epoch,
                ));
                let mut statements = self
                    .statements
                    .write()
                    .unwrap_or_else(PoisonError::into_inner);
                Arc::clone(statements.entry(key.to_string()).or_insert(candidate))
            }
        };
        stmt.ensure_prepared(cx, &self.conn, self.observer()).await?;
        Ok(stmt)
    }

    /// Cached statement for `key`, without preparing anything.
    pub fn statement(&self, key: &str) -> Option<Arc<CachedStatement>> {
        self.statements
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn statement_count(&self) -> usize {
        self.statements
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Remove `key` from the cache and close it. Returns whether it was
    /// cached.
    ///
    /// Executions already holding the statement may fail with
    /// `StatementClosed`; retrying resolves a fresh entry.
    pub async fn evict(&self, cx: &Cx, key: &str) -> Result<bool> {
        let removed = self
            .statements
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        let Some(stmt) = removed else {
            return Ok(false);
        };
        self.observer.on_evict(key);
        stmt.close(cx, &self.conn).await?;
        Ok(true)
    }

    /// Evict every statement not instantiated within `max_idle`. Returns the
    /// number evicted.
    pub async fn evict_idle(&self, cx: &Cx, max_idle: Duration) -> usize {
        let idle: Vec<Arc<CachedStatement>> = self
            .statements
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|stmt| stmt.idle_for() >= max_idle)
            .cloned()
            .collect();

        let mut evicted = 0;
        for stmt in idle {
            let removed = {
                let mut statements = self
                    .statements
                    .write()
                    .unwrap_or_else(PoisonError::into_inner);
                let same = statements
                    .get(stmt.key())
                    .is_some_and(|current| Arc::ptr_eq(current, &stmt));
                if same {
                    statements.remove(stmt.key());
                }
                same
            };
            if !removed {
                continue;
            }
            self.observer.on_evict(stmt.key());
            if let Err(error) = stmt.close(cx, &self.conn).await {
                tracing::warn!(key = stmt.key(), %error, "failed to close idle statement");
            }
            evicted += 1;
        }
        if evicted > 0 {
            tracing::debug!(evicted, ?max_idle, "evicted idle statements");
        }
        evicted
    }

    /// Evict statements idle longer than the configured TTL, if any.
    pub async fn sweep(&self, cx: &Cx) -> usize {
        match self.config.statement_idle_ttl {
            Some(ttl) => self.evict_idle(cx, ttl).await,
            None => 0,
        }
    }

    // ==================== Execution ====================

    /// Execution instance on the connection.
    pub fn instance(&self, stmt: &Arc<CachedStatement>) -> Instance<'_, C> {
        Instance::new(self, Arc::clone(stmt), None)
    }

    /// Execution instance inside `tx` when given, on the connection otherwise.
    pub fn instance_in<'a>(
        &'a self,
        stmt: &Arc<CachedStatement>,
        tx: Option<&'a Transaction<C>>,
    ) -> Instance<'a, C> {
        Instance::new(self, Arc::clone(stmt), tx)
    }

    pub async fn exec(&self, cx: &Cx, sql: &str, params: &[Value]) -> Result<u64> {
        let stmt = self.prepare(cx, sql).await?;
        self.instance(&stmt).exec(cx, params).await
    }

    pub async fn query(&self, cx: &Cx, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let stmt = self.prepare(cx, sql).await?;
        self.instance(&stmt).query_all(cx, params).await
    }

    pub async fn query_row(&self, cx: &Cx, sql: &str, params: &[Value]) -> Result<Row> {
        let stmt = self.prepare(cx, sql).await?;
        self.instance(&stmt).query_row(cx, params).await
    }

    pub async fn exec_in(
        &self,
        cx: &Cx,
        tx: &Transaction<C>,
        sql: &str,
        params: &[Value],
    ) -> Result<u64> {
        let stmt = self.prepare(cx, sql).await?;
        self.instance_in(&stmt, Some(tx)).exec(cx, params).await
    }

    pub async fn query_in(
        &self,
        cx: &Cx,
        tx: &Transaction<C>,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<Row>> {
        let stmt = self.prepare(cx, sql).await?;
        self.instance_in(&stmt, Some(tx)).query_all(cx, params).await
    }

    pub async fn query_row_in(
        &self,
        cx: &Cx,
        tx: &Transaction<C>,
        sql: &str,
        params: &[Value],
    ) -> Result<Row> {
        let stmt = self.prepare(cx, sql).await?;
        self.instance_in(&stmt, Some(tx)).query_row(cx, params).await
    }

    // ==================== Transactions ====================

    pub async fn begin(&self, cx: &Cx) -> Result<Transaction<C>> {
        self.begin_with(cx, IsolationLevel::default()).await
    }

    pub async fn begin_with(&self, cx: &Cx, isolation: IsolationLevel) -> Result<Transaction<C>> {
        match self.conn.begin(cx, isolation).await {
            Outcome::Ok(native) => {
                let id = self.tx_seq.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(tx = id, isolation = isolation.as_sql(), "transaction begin");
                Ok(Transaction::new(id, native))
            }
            Outcome::Err(e) => Err(e.into()),
            Outcome::Cancelled(reason) => Err(Error::cancelled(format!(
                "begin cancelled: {reason:?}"
            ))),
            Outcome::Panicked(info) => Err(Error::query(
                ErrorKind::Execution,
                format!("driver panicked during begin: {info:?}"),
            )),
        }
    }

    /// Run `f` in a new transaction, committing on `Ok` and rolling back on
    /// `Err`.
    pub async fn in_tx<T, F>(&self, cx: &Cx, f: F) -> Result<T>
    where
        F: AsyncFnOnce(&Transaction<C>) -> Result<T>,
    {
        let mut tx = self.begin(cx).await?;
        match f(&tx).await {
            Ok(value) => {
                tx.commit(cx).await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback(cx).await {
                    tracing::warn!(tx = tx.id(), error = %rollback, "rollback after failure failed");
                }
                Err(err)
            }
        }
    }

    // ==================== Lifecycle ====================

    pub async fn ping(&self, cx: &Cx) -> Result<()> {
        match self.conn.ping(cx).await {
            Outcome::Ok(()) => Ok(()),
            Outcome::Err(e) => Err(e.into()),
            Outcome::Cancelled(reason) => Err(Error::cancelled(format!(
                "ping cancelled: {reason:?}"
            ))),
            Outcome::Panicked(info) => Err(Error::query(
                ErrorKind::ConnectionLost,
                format!("driver panicked during ping: {info:?}"),
            )),
        }
    }

    /// Close every cached statement, then the connection.
    pub async fn close(&self, cx: &Cx) -> Result<()> {
        let drained: Vec<Arc<CachedStatement>> = self
            .statements
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, stmt)| stmt)
            .collect();
        for stmt in drained {
            if let Err(error) = stmt.close(cx, &self.conn).await {
                tracing::warn!(key = stmt.key(), %error, "failed to close statement");
            }
        }
        match self.conn.close(cx).await {
            Outcome::Ok(()) => Ok(()),
            Outcome::Err(e) => Err(e.into()),
            Outcome::Cancelled(reason) => Err(Error::cancelled(format!(
                "close cancelled: {reason:?}"
            ))),
            Outcome::Panicked(info) => Err(Error::query(
                ErrorKind::ConnectionLost,
                format!("driver panicked during close: {info:?}"),
            )),
        }
    }
}

impl<C: Connection> std::fmt::Debug for Db<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("statements", &self.statement_count())
            .field("placeholder", &self.style)
            .field("transactions", &self.tx_seq.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
