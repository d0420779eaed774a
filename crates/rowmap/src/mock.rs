//! Scripted connection for unit tests.

use std::collections::HashMap;
use std::future::{Future, poll_fn};
use std::pin::pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Poll;

use asupersync::{Cx, Outcome};

use rowmap_core::{
    Connection, DriverError, IsolationLevel, PreparedStatement, Row, TransactionOps, Value,
};

#[derive(Default)]
struct State {
    prepares: Mutex<HashMap<String, usize>>,
    closed: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    executed: Mutex<Vec<(String, Vec<Value>)>>,
    /// Rows returned for statements starting with a given prefix.
    scripted: Mutex<Vec<(String, Vec<Row>)>>,
}

/// Answers every SELECT with a single `1` unless rows are scripted for the
/// statement, and reports one affected row for everything else. Statements
/// mentioning `missing_table` fail to prepare.
#[derive(Clone, Default)]
pub struct MockConnection {
    state: Arc<State>,
    next_id: Arc<AtomicU64>,
    yield_on_prepare: bool,
}

impl MockConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspend once inside every preparation.
    pub fn yield_on_prepare(mut self) -> Self {
        self.yield_on_prepare = true;
        self
    }

    pub fn script(&self, prefix: &str, rows: Vec<Row>) {
        self.state
            .scripted
            .lock()
            .unwrap()
            .push((prefix.to_string(), rows));
    }

    pub fn prepare_count(&self, sql: &str) -> usize {
        self.state
            .prepares
            .lock()
            .unwrap()
            .get(sql)
            .copied()
            .unwrap_or(0)
    }

    pub fn closed_count(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.state.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.state.rollbacks.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<(String, Vec<Value>)> {
        self.state.executed.lock().unwrap().clone()
    }
}

fn answer(state: &State, sql: &str, params: &[Value]) -> Vec<Row> {
    state
        .executed
        .lock()
        .unwrap()
        .push((sql.to_string(), params.to_vec()));
    let scripted = state.scripted.lock().unwrap();
    if let Some((_, rows)) = scripted.iter().find(|(prefix, _)| sql.starts_with(prefix)) {
        return rows.clone();
    }
    if sql.starts_with("SELECT") {
        vec![Row::new(vec!["?column?".into()], vec![Value::BigInt(1)])]
    } else {
        Vec::new()
    }
}

async fn yield_now() {
    let mut yielded = false;
    poll_fn(|task| {
        if yielded {
            Poll::Ready(())
        } else {
            yielded = true;
            task.waker().wake_by_ref();
            Poll::Pending
        }
    })
    .await;
}

impl Connection for MockConnection {
    type Tx = MockTx;

    fn prepare(
        &self,
        _cx: &Cx,
        sql: &str,
    ) -> impl Future<Output = Outcome<PreparedStatement, DriverError>> + Send {
        async move {
            if self.yield_on_prepare {
                yield_now().await;
            }
            *self
                .state
                .prepares
                .lock()
                .unwrap()
                .entry(sql.to_string())
                .or_default() += 1;
            if sql.contains("missing_table") {
                return Outcome::Err(DriverError::database(
                    "42P01",
                    "relation \"missing_table\" does not exist",
                ));
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            let params = sql.matches('$').count();
            Outcome::Ok(PreparedStatement::new(id, sql.to_string(), params))
        }
    }

    fn close_prepared(
        &self,
        _cx: &Cx,
        _stmt: &PreparedStatement,
    ) -> impl Future<Output = Outcome<(), DriverError>> + Send {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        async { Outcome::Ok(()) }
    }

    fn query_prepared(
        &self,
        _cx: &Cx,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, DriverError>> + Send {
        let rows = answer(&self.state, stmt.sql(), params);
        async move { Outcome::Ok(rows) }
    }

    fn execute_prepared(
        &self,
        _cx: &Cx,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, DriverError>> + Send {
        answer(&self.state, stmt.sql(), params);
        async { Outcome::Ok(1) }
    }

    fn begin(
        &self,
        _cx: &Cx,
        _isolation: IsolationLevel,
    ) -> impl Future<Output = Outcome<Self::Tx, DriverError>> + Send {
        let tx = MockTx {
            state: Arc::clone(&self.state),
        };
        async move { Outcome::Ok(tx) }
    }

    fn ping(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), DriverError>> + Send {
        async { Outcome::Ok(()) }
    }

    fn close(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), DriverError>> + Send {
        async { Outcome::Ok(()) }
    }
}

pub struct MockTx {
    state: Arc<State>,
}

impl TransactionOps for MockTx {
    fn query_prepared(
        &self,
        _cx: &Cx,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, DriverError>> + Send {
        let rows = answer(&self.state, stmt.sql(), params);
        async move { Outcome::Ok(rows) }
    }

    fn execute_prepared(
        &self,
        _cx: &Cx,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, DriverError>> + Send {
        answer(&self.state, stmt.sql(), params);
        async { Outcome::Ok(1) }
    }

    fn commit(self, _cx: &Cx) -> impl Future<Output = Outcome<(), DriverError>> + Send {
        self.state.commits.fetch_add(1, Ordering::SeqCst);
        async { Outcome::Ok(()) }
    }

    fn rollback(self, _cx: &Cx) -> impl Future<Output = Outcome<(), DriverError>> + Send {
        self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        async { Outcome::Ok(()) }
    }
}

/// Poll two futures on the current task until both finish.
pub async fn join2<A: Future, B: Future>(a: A, b: B) -> (A::Output, B::Output) {
    let mut a = pin!(a);
    let mut b = pin!(b);
    let mut left = None;
    let mut right = None;
    poll_fn(|task| {
        if left.is_none() {
            if let Poll::Ready(v) = a.as_mut().poll(task) {
                left = Some(v);
            }
        }
        if right.is_none() {
            if let Poll::Ready(v) = b.as_mut().poll(task) {
                right = Some(v);
            }
        }
        if left.is_some() && right.is_some() {
            Poll::Ready((left.take().unwrap(), right.take().unwrap()))
        } else {
            Poll::Pending
        }
    })
    .await
}
