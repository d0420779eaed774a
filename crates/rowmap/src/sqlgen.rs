//! SQL text generation for table statements.
//!
//! Generators are pure: given a mapping, the columns involved and a
//! placeholder style, they return statement text. Placeholders are numbered
//! in this order everywhere: written column values, then the primary key,
//! then the expected row version, then caller condition parameters, then
//! OFFSET and LIMIT. Table operations bind parameters in the same order.

use rowmap_core::{ConfigError, PlaceholderStyle, Result};

use crate::builder::SqlBuilder;
use crate::mapping::{ColumnMeta, ColumnRole, TableMapping};

/// WHERE clause ingredients.
#[derive(Debug, Clone, Copy, Default)]
pub struct Filter<'q> {
    /// `id = ?`
    pub by_id: bool,
    /// `row_version = ?`
    pub check_version: bool,
    /// Caller fragment using `?` markers, and its parameter count.
    pub condition: Option<(&'q str, usize)>,
    /// `deleted_at IS NULL`
    pub live_only: bool,
}

impl<'q> Filter<'q> {
    pub fn by_id() -> Self {
        Self {
            by_id: true,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.by_id && !self.check_version && self.condition.is_none() && !self.live_only
    }
}

fn connective(b: &mut SqlBuilder, first: &mut bool) {
    if *first {
        b.clause("WHERE ");
        *first = false;
    } else {
        b.push(" AND ");
    }
}

fn push_filter(b: &mut SqlBuilder, filter: &Filter<'_>) -> Result<()> {
    let mut first = true;
    if filter.by_id {
        connective(b, &mut first);
        b.push("id = ").param();
    }
    if filter.check_version {
        connective(b, &mut first);
        b.push("row_version = ").param();
    }
    if let Some((condition, params)) = filter.condition {
        connective(b, &mut first);
        b.push("(");
        b.push_condition(condition, params)?;
        b.push(")");
    }
    if filter.live_only {
        connective(b, &mut first);
        b.push("deleted_at IS NULL");
    }
    Ok(())
}

fn push_returning(b: &mut SqlBuilder, returning: &[String]) {
    if !returning.is_empty() {
        b.clause("RETURNING ").push(&returning.join(", "));
    }
}

fn column_list<R>(columns: &[&ColumnMeta<R>]) -> String {
    columns
        .iter()
        .map(|c| c.column.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn non_empty<R>(
    mapping: &TableMapping<R>,
    columns: &[&ColumnMeta<R>],
    statement: &'static str,
) -> Result<()> {
    if columns.is_empty() {
        Err(ConfigError::EmptyColumnList {
            table: mapping.table().to_string(),
            statement,
        }
        .into())
    } else {
        Ok(())
    }
}

/// Sequence expression for a sequence-backed primary key.
pub fn sequence_expr(table: &str) -> String {
    format!("NEXTVAL('{table}_seq')")
}

/// Paging applied after filtering.
#[derive(Debug, Clone, Default)]
pub struct Paging<'q> {
    pub order_by: Option<&'q str>,
    pub offset: bool,
    pub limit: bool,
}

pub fn select<R>(
    mapping: &TableMapping<R>,
    columns: &[&ColumnMeta<R>],
    filter: &Filter<'_>,
    paging: &Paging<'_>,
    style: PlaceholderStyle,
) -> Result<String> {
    non_empty(mapping, columns, "SELECT")?;
    let mut b = SqlBuilder::new(style);
    b.clause("SELECT ")
        .push(&column_list(columns))
        .push(" FROM ")
        .push(mapping.table());
    push_filter(&mut b, filter)?;
    if let Some(order_by) = paging.order_by {
        b.clause("ORDER BY ").push(order_by);
    }
    if paging.offset {
        b.clause("OFFSET ").param();
    }
    if paging.limit {
        b.clause("LIMIT ").param();
    }
    Ok(b.finish())
}

pub fn count<R>(
    mapping: &TableMapping<R>,
    filter: &Filter<'_>,
    style: PlaceholderStyle,
) -> Result<String> {
    let mut b = SqlBuilder::new(style);
    b.clause("SELECT COUNT(*) FROM ").push(mapping.table());
    push_filter(&mut b, filter)?;
    Ok(b.finish())
}

pub fn exists<R>(
    mapping: &TableMapping<R>,
    filter: &Filter<'_>,
    style: PlaceholderStyle,
) -> Result<String> {
    let mut b = SqlBuilder::new(style);
    b.clause("SELECT 1 FROM ").push(mapping.table());
    push_filter(&mut b, filter)?;
    b.clause("LIMIT 1");
    Ok(b.finish())
}

/// Conflict handling for INSERT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
    /// `ON CONFLICT DO NOTHING`
    Any,
    /// `ON CONFLICT (cols) DO NOTHING`
    On(Vec<String>),
}

pub fn insert<R>(
    mapping: &TableMapping<R>,
    columns: &[&ColumnMeta<R>],
    conflict: Option<&Conflict>,
    returning: &[String],
    style: PlaceholderStyle,
) -> Result<String> {
    non_empty(mapping, columns, "INSERT")?;
    let sequence = mapping.is_sequence_backed();
    let mut b = SqlBuilder::new(style);
    b.clause("INSERT INTO ")
        .push(mapping.table())
        .push(" (")
        .push(&column_list(columns))
        .push(")");
    b.clause("VALUES (");
    b.push_list(columns, ", ", |b, meta| {
        if sequence && meta.role == ColumnRole::PrimaryKey {
            b.push(&sequence_expr(mapping.table()));
        } else {
            b.param();
        }
    });
    b.push(")");
    match conflict {
        Some(Conflict::Any) => {
            b.clause("ON CONFLICT DO NOTHING");
        }
        Some(Conflict::On(target)) => {
            b.clause("ON CONFLICT (")
                .push(&target.join(", "))
                .push(") DO NOTHING");
        }
        None => {}
    }
    push_returning(&mut b, returning);
    Ok(b.finish())
}

pub fn update<R>(
    mapping: &TableMapping<R>,
    columns: &[&ColumnMeta<R>],
    filter: &Filter<'_>,
    returning: &[String],
    style: PlaceholderStyle,
) -> Result<String> {
    let versioned = mapping.is_versioned();
    if columns.is_empty() && !versioned {
        return Err(ConfigError::EmptyColumnList {
            table: mapping.table().to_string(),
            statement: "UPDATE",
        }
        .into());
    }
    let mut b = SqlBuilder::new(style);
    b.clause("UPDATE ").push(mapping.table());
    b.clause("SET ");
    b.push_list(columns, ", ", |b, meta| {
        b.push(&meta.column).push(" = ").param();
    });
    if versioned {
        if !columns.is_empty() {
            b.push(", ");
        }
        b.push("row_version = row_version + 1");
    }
    push_filter(&mut b, filter)?;
    push_returning(&mut b, returning);
    Ok(b.finish())
}

pub fn soft_delete<R>(
    mapping: &TableMapping<R>,
    filter: &Filter<'_>,
    returning: &[String],
    style: PlaceholderStyle,
) -> Result<String> {
    mapping.require(ColumnRole::DeletedAt, "deleted_at")?;
    let mut b = SqlBuilder::new(style);
    b.clause("UPDATE ").push(mapping.table());
    b.clause("SET deleted_at = ").param();
    if mapping.is_versioned() {
        b.push(", row_version = row_version + 1");
    }
    push_filter(&mut b, filter)?;
    push_returning(&mut b, returning);
    Ok(b.finish())
}

pub fn hard_delete<R>(
    mapping: &TableMapping<R>,
    filter: &Filter<'_>,
    returning: &[String],
    style: PlaceholderStyle,
) -> Result<String> {
    let mut b = SqlBuilder::new(style);
    b.clause("DELETE FROM ").push(mapping.table());
    push_filter(&mut b, filter)?;
    push_returning(&mut b, returning);
    Ok(b.finish())
}

/// Stamp `updated_at` (when mapped) and bump the row version of one row.
pub fn touch<R>(
    mapping: &TableMapping<R>,
    returning: &[String],
    style: PlaceholderStyle,
) -> Result<String> {
    let stamped = mapping.role(ColumnRole::UpdatedAt).is_some();
    let versioned = mapping.is_versioned();
    if !stamped && !versioned {
        return Err(ConfigError::MissingColumn {
            table: mapping.table().to_string(),
            column: "updated_at".to_string(),
        }
        .into());
    }
    let mut b = SqlBuilder::new(style);
    b.clause("UPDATE ").push(mapping.table());
    b.clause("SET ");
    if stamped {
        b.push("updated_at = ").param();
    }
    if versioned {
        if stamped {
            b.push(", ");
        }
        b.push("row_version = row_version + 1");
    }
    push_filter(&mut b, &Filter::by_id())?;
    push_returning(&mut b, returning);
    Ok(b.finish())
}
