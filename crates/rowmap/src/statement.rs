//! Cached prepared statements.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering, fence};
use std::time::{Duration, Instant};

use asupersync::sync::Mutex;
use asupersync::{Cx, Outcome};

use rowmap_core::{Connection, Error, ErrorKind, PreparedStatement, QueryError, Result};

use crate::observer::StatementObserver;

/// Cache key for an anonymous statement: hex MD5 of the trimmed text.
pub fn statement_key(sql: &str) -> String {
    format!("{:x}", md5::compute(sql.trim().as_bytes()))
}

/// One entry of the statement cache.
///
/// The entry is published in the cache before it is prepared. The first
/// caller to need it prepares it while holding the entry's gate; concurrent
/// callers wait on the gate and then observe the stored outcome, so the
/// driver sees exactly one preparation per entry. A failed preparation is
/// stored too and returned to every later caller.
pub struct CachedStatement {
    key: String,
    sql: String,
    prepared: OnceLock<std::result::Result<PreparedStatement, Error>>,
    gate: Mutex<()>,
    epoch: Instant,
    /// Microseconds after `epoch` of the most recent instantiation.
    last_used: AtomicU64,
    instances: AtomicU64,
    closed: AtomicBool,
    /// Set by whoever hands the server-side statement back to the driver.
    released: AtomicBool,
}

impl CachedStatement {
    pub(crate) fn new(key: String, sql: String, epoch: Instant) -> Self {
        let now = epoch.elapsed().as_micros() as u64;
        Self {
            key,
            sql,
            prepared: OnceLock::new(),
            gate: Mutex::new(()),
            epoch,
            last_used: AtomicU64::new(now),
            instances: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Preparation outcome, `None` while not yet prepared.
    pub fn prepared(&self) -> Option<Result<&PreparedStatement>> {
        self.prepared.get().map(|stored| match stored {
            Ok(stmt) => Ok(stmt),
            Err(err) => Err(err.clone()),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of execution instances created from this statement.
    pub fn instance_count(&self) -> u64 {
        self.instances.load(Ordering::Relaxed)
    }

    /// Time since the statement was last instantiated.
    pub fn idle_for(&self) -> Duration {
        let now = self.epoch.elapsed().as_micros() as u64;
        Duration::from_micros(now.saturating_sub(self.last_used.load(Ordering::Relaxed)))
    }

    /// Record one instantiation. Returns its 1-based sequence number.
    pub(crate) fn touch(&self) -> u64 {
        let now = self.epoch.elapsed().as_micros() as u64;
        self.last_used.fetch_max(now, Ordering::Relaxed);
        self.instances.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Prepare on first use; later callers get the stored outcome.
    pub(crate) async fn ensure_prepared<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        observer: &dyn StatementObserver,
    ) -> Result<&PreparedStatement> {
        if let Some(stored) = self.prepared() {
            return stored;
        }

        let Ok(_gate) = self.gate.lock(cx).await else {
            return Err(Error::cancelled(format!(
                "cancelled while waiting to prepare statement {}",
                self.key
            )));
        };

        if let Some(stored) = self.prepared() {
            return stored;
        }
        if let Some(reason) = cx.cancel_reason() {
            return Err(Error::cancelled(format!(
                "cancelled before preparing statement {}: {reason:?}",
                self.key
            )));
        }

        let result = match conn.prepare(cx, &self.sql).await {
            Outcome::Ok(stmt) => Ok(stmt),
            Outcome::Err(e) => {
                let mut err = QueryError::classify(e);
                if err.kind == ErrorKind::Execution {
                    err.kind = ErrorKind::Preparation;
                }
                err.sql = Some(self.sql.clone());
                Err(Error::Query(err))
            }
            // Cancellation is not a property of the statement; leave the
            // entry unprepared so the next caller retries.
            Outcome::Cancelled(reason) => {
                return Err(Error::cancelled(format!(
                    "preparation of statement {} cancelled: {reason:?}",
                    self.key
                )));
            }
            Outcome::Panicked(info) => Err(Error::query(
                ErrorKind::Preparation,
                format!("driver panicked while preparing: {info:?}"),
            )
            .with_statement(&self.sql, &[])),
        };

        observer.on_prepare(&self.key, &self.sql, result.as_ref().map(|_| ()));

        let stored = self.prepared.get_or_init(|| result);
        fence(Ordering::SeqCst);
        if self.is_closed() {
            // Evicted while the driver was preparing; `close` saw no handle.
            if let Err(error) = self.release(cx, conn).await {
                tracing::warn!(key = %self.key, %error, "failed to release evicted statement");
            }
            return Err(self.closed_error());
        }
        match stored {
            Ok(stmt) => Ok(stmt),
            Err(err) => Err(err.clone()),
        }
    }

    pub(crate) fn closed_error(&self) -> Error {
        Error::query(
            ErrorKind::StatementClosed,
            format!("statement {} was closed", self.key),
        )
    }

    /// Mark closed and release the server-side statement if one exists.
    pub(crate) async fn close<C: Connection>(&self, cx: &Cx, conn: &C) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        fence(Ordering::SeqCst);
        self.release(cx, conn).await
    }

    /// Close the server-side statement, once, if preparation produced one.
    async fn release<C: Connection>(&self, cx: &Cx, conn: &C) -> Result<()> {
        let Some(Ok(stmt)) = self.prepared.get() else {
            return Ok(());
        };
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match conn.close_prepared(cx, stmt).await {
            Outcome::Ok(()) => Ok(()),
            Outcome::Err(e) => Err(Error::from(e).with_statement(&self.sql, &[])),
            Outcome::Cancelled(reason) => Err(Error::cancelled(format!(
                "closing statement {} cancelled: {reason:?}",
                self.key
            ))),
            Outcome::Panicked(info) => Err(Error::query(
                ErrorKind::Execution,
                format!("driver panicked while closing statement: {info:?}"),
            )),
        }
    }
}

impl std::fmt::Debug for CachedStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedStatement")
            .field("key", &self.key)
            .field("sql", &self.sql)
            .field("prepared", &self.prepared.get().map(|r| r.is_ok()))
            .field("instances", &self.instance_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
