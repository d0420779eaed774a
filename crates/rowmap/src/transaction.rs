//! Transactions bound to a [`Db`](crate::Db).

use std::time::{Duration, Instant};

use asupersync::{Cx, Outcome};

use rowmap_core::{Connection, Error, ErrorKind, Result, Timestamp, TransactionOps};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Open,
    Committed,
    RolledBack,
}

/// An open database transaction.
///
/// Statements run inside it by passing `&Transaction` to an execution
/// instance or a table operation. A transaction is meant for one caller at a
/// time; finishing it requires `&mut self`, so no statement can still be
/// borrowing it at that point. Dropping an open transaction logs a warning
/// and leaves the rollback to the driver.
pub struct Transaction<C: Connection> {
    id: u64,
    native: Option<C::Tx>,
    state: TxState,
    started: Instant,
    started_at: Timestamp,
    finished: Option<Instant>,
}

impl<C: Connection> Transaction<C> {
    pub(crate) fn new(id: u64, native: C::Tx) -> Self {
        Self {
            id,
            native: Some(native),
            state: TxState::Open,
            started: Instant::now(),
            started_at: Timestamp::now(),
            finished: None,
        }
    }

    /// Identifier, unique and increasing within one `Db`.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == TxState::Open
    }

    pub fn started_at(&self) -> Timestamp {
        self.started_at
    }

    /// Time from begin to commit or rollback, or to now while still open.
    pub fn duration(&self) -> Duration {
        match self.finished {
            Some(finished) => finished.duration_since(self.started),
            None => self.started.elapsed(),
        }
    }

    pub(crate) fn native(&self) -> Result<&C::Tx> {
        self.native.as_ref().ok_or_else(|| self.finished_error())
    }

    fn finished_error(&self) -> Error {
        Error::query(
            ErrorKind::Execution,
            format!("transaction {} is already finished", self.id),
        )
    }

    pub async fn commit(&mut self, cx: &Cx) -> Result<()> {
        let native = self.native.take().ok_or_else(|| self.finished_error())?;
        let outcome = native.commit(cx).await;
        self.finished = Some(Instant::now());
        let result = settle(outcome, self.id, "commit");
        self.state = if result.is_ok() {
            TxState::Committed
        } else {
            TxState::RolledBack
        };
        tracing::debug!(
            tx = self.id,
            state = ?self.state,
            duration = ?self.duration(),
            "transaction commit"
        );
        result
    }

    pub async fn rollback(&mut self, cx: &Cx) -> Result<()> {
        let native = self.native.take().ok_or_else(|| self.finished_error())?;
        let outcome = native.rollback(cx).await;
        self.finished = Some(Instant::now());
        self.state = TxState::RolledBack;
        tracing::debug!(tx = self.id, duration = ?self.duration(), "transaction rollback");
        settle(outcome, self.id, "rollback")
    }
}

fn settle(outcome: Outcome<(), rowmap_core::DriverError>, id: u64, op: &str) -> Result<()> {
    match outcome {
        Outcome::Ok(()) => Ok(()),
        Outcome::Err(e) => Err(e.into()),
        Outcome::Cancelled(reason) => Err(Error::cancelled(format!(
            "transaction {id} {op} cancelled: {reason:?}"
        ))),
        Outcome::Panicked(info) => Err(Error::query(
            ErrorKind::Execution,
            format!("driver panicked during transaction {id} {op}: {info:?}"),
        )),
    }
}

impl<C: Connection> Drop for Transaction<C> {
    fn drop(&mut self) {
        if self.state == TxState::Open {
            tracing::warn!(
                tx = self.id,
                open_for = ?self.started.elapsed(),
                "transaction dropped without commit or rollback"
            );
        }
    }
}

impl<C: Connection> std::fmt::Debug for Transaction<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("duration", &self.duration())
            .finish_non_exhaustive()
    }
}
