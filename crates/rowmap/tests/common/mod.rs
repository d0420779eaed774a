//! In-memory connection for integration tests.
//!
//! Understands the statement shapes rowmap generates: INSERT with an
//! optional sequence value, conflict clause and RETURNING; UPDATE and DELETE
//! with AND-joined equality and `IS NULL` conditions; SELECT of columns,
//! `COUNT(*)` or `1` with ordering and paging. Tables are declared up front
//! with their columns, unique columns and check constraints. Only `$n`
//! placeholders are understood.

#![allow(dead_code)]

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::future::{Future, ready};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, OnceLock};

use regex::Regex;

use rowmap::{
    Connection, Cx, DriverError, DriverErrorKind, IsolationLevel, Outcome, PreparedStatement, Row,
    TransactionOps, Value,
};

type Check = fn(&Value) -> bool;

#[derive(Clone)]
struct TableDef {
    columns: Vec<String>,
    unique: Vec<String>,
    checks: Vec<(String, Check)>,
}

#[derive(Clone, Default)]
struct Data {
    rows: HashMap<String, Vec<HashMap<String, Value>>>,
    sequences: HashMap<String, i64>,
}

#[derive(Default)]
struct Shared {
    schema: Mutex<HashMap<String, TableDef>>,
    data: Mutex<Data>,
    prepares: AtomicUsize,
    next_id: AtomicU64,
    closed: Mutex<HashSet<u64>>,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct MemoryConnection {
    shared: Arc<Shared>,
}

impl MemoryConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(self, name: &str, columns: &[&str]) -> Self {
        self.shared
            .schema
            .lock()
            .unwrap()
            .insert(
                name.to_string(),
                TableDef {
                    columns: columns.iter().map(|c| c.to_string()).collect(),
                    unique: Vec::new(),
                    checks: Vec::new(),
                },
            );
        self.shared
            .data
            .lock()
            .unwrap()
            .rows
            .insert(name.to_string(), Vec::new());
        self
    }

    pub fn unique(self, table: &str, column: &str) -> Self {
        if let Some(def) = self.shared.schema.lock().unwrap().get_mut(table) {
            def.unique.push(column.to_string());
        }
        self
    }

    pub fn check(self, table: &str, column: &str, check: Check) -> Self {
        if let Some(def) = self.shared.schema.lock().unwrap().get_mut(table) {
            def.checks.push((column.to_string(), check));
        }
        self
    }

    pub fn prepare_count(&self) -> usize {
        self.shared.prepares.load(AtomicOrdering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.shared.commits.load(AtomicOrdering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.shared.rollbacks.load(AtomicOrdering::SeqCst)
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.shared
            .data
            .lock()
            .unwrap()
            .rows
            .get(table)
            .map_or(0, Vec::len)
    }

    /// Stored value of `column` in the row whose `id` is `id`.
    pub fn stored(&self, table: &str, id: i64, column: &str) -> Option<Value> {
        let data = self.shared.data.lock().unwrap();
        data.rows
            .get(table)?
            .iter()
            .find(|row| row.get("id").and_then(Value::as_i64) == Some(id))?
            .get(column)
            .cloned()
    }

    fn run(&self, stmt: &PreparedStatement, params: &[Value]) -> Result<Vec<Row>, DriverError> {
        if self.shared.closed.lock().unwrap().contains(&stmt.id()) {
            return Err(DriverError::new(
                DriverErrorKind::StatementClosed,
                "prepared statement does not exist",
            ));
        }
        let statement = parse(stmt.sql())?;
        let schema = self.shared.schema.lock().unwrap();
        let mut data = self.shared.data.lock().unwrap();
        statement.execute(&schema, &mut data, params)
    }
}

// ==================== Statement shapes ====================

enum Statement {
    Insert {
        table: String,
        columns: Vec<String>,
        values: Vec<String>,
        ignore_conflict: bool,
        returning: Vec<String>,
    },
    Update {
        table: String,
        assignments: Vec<String>,
        conditions: Vec<String>,
        returning: Vec<String>,
    },
    Delete {
        table: String,
        conditions: Vec<String>,
        returning: Vec<String>,
    },
    Select {
        table: String,
        projection: String,
        conditions: Vec<String>,
        order_by: Option<String>,
        offset: Option<String>,
        limit: Option<String>,
    },
}

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).unwrap())
}

fn list(text: Option<regex::Match<'_>>) -> Vec<String> {
    text.map(|m| m.as_str().split(", ").map(|s| s.trim().to_string()).collect())
        .unwrap_or_default()
}

fn conditions(text: Option<regex::Match<'_>>) -> Vec<String> {
    text.map(|m| {
        m.as_str()
            .split(" AND ")
            .map(|c| c.trim_matches(|ch| ch == '(' || ch == ')').to_string())
            .collect()
    })
    .unwrap_or_default()
}

fn syntax_error(sql: &str) -> DriverError {
    DriverError::database("42601", format!("syntax error in: {sql}"))
}

fn parse(sql: &str) -> Result<Statement, DriverError> {
    static INSERT: OnceLock<Regex> = OnceLock::new();
    static UPDATE: OnceLock<Regex> = OnceLock::new();
    static DELETE: OnceLock<Regex> = OnceLock::new();
    static SELECT: OnceLock<Regex> = OnceLock::new();

    let insert = regex(
        &INSERT,
        r"^INSERT INTO (\w+) \(([^)]*)\) VALUES \((.*?)\)( ON CONFLICT(?: \([^)]*\))? DO NOTHING)?(?: RETURNING (.+))?$",
    );
    let update = regex(
        &UPDATE,
        r"^UPDATE (\w+) SET (.+?)(?: WHERE (.+?))?(?: RETURNING (.+))?$",
    );
    let delete = regex(&DELETE, r"^DELETE FROM (\w+)(?: WHERE (.+?))?(?: RETURNING (.+))?$");
    let select = regex(
        &SELECT,
        r"^SELECT (.+?) FROM (\w+)(?: WHERE (.+?))?(?: ORDER BY (.+?))?(?: OFFSET (\$\d+))?(?: LIMIT (\$\d+|\d+))?$",
    );

    if let Some(c) = insert.captures(sql) {
        return Ok(Statement::Insert {
            table: c[1].to_string(),
            columns: list(c.get(2)),
            values: list(c.get(3)),
            ignore_conflict: c.get(4).is_some(),
            returning: list(c.get(5)),
        });
    }
    if let Some(c) = update.captures(sql) {
        return Ok(Statement::Update {
            table: c[1].to_string(),
            assignments: list(c.get(2)),
            conditions: conditions(c.get(3)),
            returning: list(c.get(4)),
        });
    }
    if let Some(c) = delete.captures(sql) {
        return Ok(Statement::Delete {
            table: c[1].to_string(),
            conditions: conditions(c.get(2)),
            returning: list(c.get(3)),
        });
    }
    if let Some(c) = select.captures(sql) {
        return Ok(Statement::Select {
            projection: c[1].to_string(),
            table: c[2].to_string(),
            conditions: conditions(c.get(3)),
            order_by: c.get(4).map(|m| m.as_str().to_string()),
            offset: c.get(5).map(|m| m.as_str().to_string()),
            limit: c.get(6).map(|m| m.as_str().to_string()),
        });
    }
    Err(syntax_error(sql))
}

fn param(params: &[Value], placeholder: &str) -> Result<Value, DriverError> {
    let index: usize = placeholder
        .strip_prefix('$')
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| syntax_error(placeholder))?;
    params
        .get(index - 1)
        .cloned()
        .ok_or_else(|| DriverError::database("08P01", format!("missing parameter {placeholder}")))
}

fn same(a: &Value, b: &Value) -> bool {
    match (a.as_i64(), b.as_i64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,
        (Value::Text(x), Value::Text(y)) => x.cmp(y),
        (Value::TimestampTz(x), Value::TimestampTz(y)) => x.cmp(y),
        _ => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => Ordering::Equal,
        },
    }
}

type Record = HashMap<String, Value>;

fn matches(row: &Record, conditions: &[String], params: &[Value]) -> Result<bool, DriverError> {
    for condition in conditions {
        if let Some(column) = condition.strip_suffix(" IS NULL") {
            if !row.get(column).is_none_or(Value::is_null) {
                return Ok(false);
            }
        } else if let Some((column, placeholder)) = condition.split_once(" = ") {
            let expected = param(params, placeholder.trim())?;
            let actual = row.get(column.trim()).cloned().unwrap_or(Value::Null);
            if actual.is_null() || !same(&actual, &expected) {
                return Ok(false);
            }
        } else {
            return Err(syntax_error(condition));
        }
    }
    Ok(true)
}

fn project(row: &Record, columns: &[String]) -> Row {
    Row::new(
        columns.to_vec(),
        columns
            .iter()
            .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
            .collect(),
    )
}

fn check_columns(table: &str, def: &TableDef, columns: &[String]) -> Result<(), DriverError> {
    for column in columns {
        if !def.columns.contains(column) {
            return Err(DriverError::database(
                "42703",
                format!("column \"{column}\" of relation \"{table}\" does not exist"),
            )
            .with_column(column.as_str())
            .with_table(table));
        }
    }
    Ok(())
}

fn condition_columns(conditions: &[String]) -> Vec<String> {
    conditions
        .iter()
        .filter_map(|c| {
            c.strip_suffix(" IS NULL")
                .or_else(|| c.split_once(" = ").map(|(column, _)| column))
                .map(|column| column.trim().to_string())
        })
        .collect()
}

impl Statement {
    fn table(&self) -> &str {
        match self {
            Statement::Insert { table, .. }
            | Statement::Update { table, .. }
            | Statement::Delete { table, .. }
            | Statement::Select { table, .. } => table,
        }
    }

    /// Check the statement against the schema, as PREPARE would.
    fn validate(&self, schema: &HashMap<String, TableDef>) -> Result<(), DriverError> {
        let table = self.table();
        let def = schema.get(table).ok_or_else(|| {
            DriverError::database("42P01", format!("relation \"{table}\" does not exist"))
                .with_table(table)
        })?;
        match self {
            Statement::Insert {
                columns, returning, ..
            } => {
                check_columns(table, def, columns)?;
                check_columns(table, def, returning)
            }
            Statement::Update {
                assignments,
                conditions,
                returning,
                ..
            } => {
                let assigned: Vec<String> = assignments
                    .iter()
                    .filter_map(|a| a.split_once(" = ").map(|(c, _)| c.trim().to_string()))
                    .collect();
                check_columns(table, def, &assigned)?;
                check_columns(table, def, &condition_columns(conditions))?;
                check_columns(table, def, returning)
            }
            Statement::Delete {
                conditions,
                returning,
                ..
            } => {
                check_columns(table, def, &condition_columns(conditions))?;
                check_columns(table, def, returning)
            }
            Statement::Select {
                projection,
                conditions,
                ..
            } => {
                if projection != "COUNT(*)" && projection != "1" {
                    let columns: Vec<String> =
                        projection.split(", ").map(str::to_string).collect();
                    check_columns(table, def, &columns)?;
                }
                check_columns(table, def, &condition_columns(conditions))
            }
        }
    }

    fn execute(
        &self,
        schema: &HashMap<String, TableDef>,
        data: &mut Data,
        params: &[Value],
    ) -> Result<Vec<Row>, DriverError> {
        self.validate(schema)?;
        let table = self.table().to_string();
        let def = &schema[&table];
        match self {
            Statement::Insert {
                columns,
                values,
                ignore_conflict,
                returning,
                ..
            } => {
                let mut row = Record::new();
                for column in &def.columns {
                    row.insert(column.clone(), Value::Null);
                }
                for (column, value) in columns.iter().zip(values) {
                    let value = if value.starts_with("NEXTVAL(") {
                        let next = data.sequences.entry(table.clone()).or_insert(0);
                        *next += 1;
                        Value::BigInt(*next)
                    } else {
                        param(params, value)?
                    };
                    row.insert(column.clone(), value);
                }
                let rows = data.rows.entry(table.clone()).or_default();
                match constraint_violation(&table, def, rows, &row, None) {
                    Some(_) if *ignore_conflict => return Ok(Vec::new()),
                    Some(e) => return Err(e),
                    None => {}
                }
                let out = project(&row, returning);
                rows.push(row);
                Ok(vec![out])
            }
            Statement::Update {
                assignments,
                conditions,
                returning,
                ..
            } => {
                let rows = data.rows.entry(table.clone()).or_default();
                let mut updated = Vec::new();
                for index in 0..rows.len() {
                    if !matches(&rows[index], conditions, params)? {
                        continue;
                    }
                    let mut row = rows[index].clone();
                    for assignment in assignments {
                        let (column, expr) = assignment
                            .split_once(" = ")
                            .ok_or_else(|| syntax_error(assignment))?;
                        let value = if expr.starts_with('$') {
                            param(params, expr)?
                        } else if expr == format!("{column} + 1") {
                            Value::BigInt(row.get(column).and_then(Value::as_i64).unwrap_or(0) + 1)
                        } else {
                            return Err(syntax_error(assignment));
                        };
                        row.insert(column.to_string(), value);
                    }
                    if let Some(e) = constraint_violation(&table, def, rows, &row, Some(index)) {
                        return Err(e);
                    }
                    updated.push(project(&row, returning));
                    rows[index] = row;
                }
                Ok(updated)
            }
            Statement::Delete {
                conditions,
                returning,
                ..
            } => {
                let rows = data.rows.entry(table.clone()).or_default();
                let mut kept = Vec::new();
                let mut removed = Vec::new();
                for row in rows.drain(..) {
                    if matches(&row, conditions, params)? {
                        removed.push(project(&row, returning));
                    } else {
                        kept.push(row);
                    }
                }
                *rows = kept;
                Ok(removed)
            }
            Statement::Select {
                projection,
                conditions,
                order_by,
                offset,
                limit,
                ..
            } => {
                let rows = data.rows.get(&table).map(Vec::as_slice).unwrap_or(&[]);
                let mut selected = Vec::new();
                for row in rows {
                    if matches(row, conditions, params)? {
                        selected.push(row);
                    }
                }
                if let Some(order) = order_by {
                    let (column, descending) = match order.split_once(' ') {
                        Some((column, direction)) => (column, direction == "DESC"),
                        None => (order.as_str(), false),
                    };
                    selected.sort_by(|a, b| {
                        let ordering = compare(
                            a.get(column).unwrap_or(&Value::Null),
                            b.get(column).unwrap_or(&Value::Null),
                        );
                        if descending { ordering.reverse() } else { ordering }
                    });
                }
                let skip = match offset {
                    Some(p) => param(params, p)?.as_i64().unwrap_or(0).max(0) as usize,
                    None => 0,
                };
                let take = match limit {
                    Some(p) if p.starts_with('$') => {
                        param(params, p)?.as_i64().unwrap_or(0).max(0) as usize
                    }
                    Some(p) => p.parse().unwrap_or(usize::MAX),
                    None => usize::MAX,
                };
                let selected: Vec<&Record> = selected.into_iter().skip(skip).take(take).collect();

                match projection.as_str() {
                    "COUNT(*)" => Ok(vec![Row::new(
                        vec!["count".to_string()],
                        vec![Value::BigInt(selected.len() as i64)],
                    )]),
                    "1" => Ok(selected
                        .iter()
                        .map(|_| Row::new(vec!["?column?".to_string()], vec![Value::Int(1)]))
                        .collect()),
                    columns => {
                        let columns: Vec<String> =
                            columns.split(", ").map(str::to_string).collect();
                        Ok(selected.iter().map(|row| project(row, &columns)).collect())
                    }
                }
            }
        }
    }
}

fn constraint_violation(
    table: &str,
    def: &TableDef,
    rows: &[Record],
    candidate: &Record,
    skip: Option<usize>,
) -> Option<DriverError> {
    for (column, check) in &def.checks {
        let value = candidate.get(column).cloned().unwrap_or(Value::Null);
        if !check(&value) {
            return Some(
                DriverError::database(
                    "23514",
                    format!(
                        "new row for relation \"{table}\" violates check constraint \"{table}_{column}_check\""
                    ),
                )
                .with_constraint(format!("{table}_{column}_check"))
                .with_column(column.as_str())
                .with_table(table),
            );
        }
    }
    for column in &def.unique {
        let Some(value) = candidate.get(column).filter(|v| !v.is_null()) else {
            continue;
        };
        let clash = rows.iter().enumerate().any(|(index, row)| {
            Some(index) != skip && row.get(column).is_some_and(|other| same(other, value))
        });
        if clash {
            return Some(
                DriverError::database(
                    "23505",
                    format!(
                        "duplicate key value violates unique constraint \"{table}_{column}_key\""
                    ),
                )
                .with_constraint(format!("{table}_{column}_key"))
                .with_column(column.as_str())
                .with_table(table),
            );
        }
    }
    None
}

fn settle<T>(result: Result<T, DriverError>) -> Outcome<T, DriverError> {
    match result {
        Ok(value) => Outcome::Ok(value),
        Err(e) => Outcome::Err(e),
    }
}

impl Connection for MemoryConnection {
    type Tx = MemoryTx;

    fn prepare(
        &self,
        _cx: &Cx,
        sql: &str,
    ) -> impl Future<Output = Outcome<PreparedStatement, DriverError>> + Send {
        self.shared.prepares.fetch_add(1, AtomicOrdering::SeqCst);
        let result = parse(sql).and_then(|statement| {
            statement.validate(&self.shared.schema.lock().unwrap())?;
            let id = self.shared.next_id.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            Ok(PreparedStatement::new(
                id,
                sql.to_string(),
                sql.matches('$').count(),
            ))
        });
        ready(settle(result))
    }

    fn close_prepared(
        &self,
        _cx: &Cx,
        stmt: &PreparedStatement,
    ) -> impl Future<Output = Outcome<(), DriverError>> + Send {
        self.shared.closed.lock().unwrap().insert(stmt.id());
        ready(Outcome::Ok(()))
    }

    fn query_prepared(
        &self,
        _cx: &Cx,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, DriverError>> + Send {
        ready(settle(self.run(stmt, params)))
    }

    fn execute_prepared(
        &self,
        _cx: &Cx,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, DriverError>> + Send {
        ready(settle(self.run(stmt, params).map(|rows| rows.len() as u64)))
    }

    fn begin(
        &self,
        _cx: &Cx,
        _isolation: IsolationLevel,
    ) -> impl Future<Output = Outcome<Self::Tx, DriverError>> + Send {
        let snapshot = self.shared.data.lock().unwrap().clone();
        ready(Outcome::Ok(MemoryTx {
            conn: self.clone(),
            snapshot,
        }))
    }

    fn ping(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), DriverError>> + Send {
        ready(Outcome::Ok(()))
    }

    fn close(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), DriverError>> + Send {
        ready(Outcome::Ok(()))
    }
}

/// Statements apply to the shared tables immediately; rollback restores the
/// snapshot taken at begin.
pub struct MemoryTx {
    conn: MemoryConnection,
    snapshot: Data,
}

impl TransactionOps for MemoryTx {
    fn query_prepared(
        &self,
        cx: &Cx,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, DriverError>> + Send {
        self.conn.query_prepared(cx, stmt, params)
    }

    fn execute_prepared(
        &self,
        cx: &Cx,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, DriverError>> + Send {
        self.conn.execute_prepared(cx, stmt, params)
    }

    fn commit(self, _cx: &Cx) -> impl Future<Output = Outcome<(), DriverError>> + Send {
        self.conn.shared.commits.fetch_add(1, AtomicOrdering::SeqCst);
        ready(Outcome::Ok(()))
    }

    fn rollback(self, _cx: &Cx) -> impl Future<Output = Outcome<(), DriverError>> + Send {
        *self.conn.shared.data.lock().unwrap() = self.snapshot;
        self.conn.shared.rollbacks.fetch_add(1, AtomicOrdering::SeqCst);
        ready(Outcome::Ok(()))
    }
}
