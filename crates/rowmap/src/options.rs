//! Per-call options for table operations.

use rowmap_core::{Connection, TagRule, Value};

use crate::sqlgen::Conflict;
use crate::transaction::Transaction;

/// Columns a write statement hands back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Returning {
    /// What the operation needs: the generated id on insert, the new row
    /// version on update or soft delete, every column on WHERE-driven
    /// deletes.
    #[default]
    Default,
    Nothing,
    All,
    Columns(Vec<String>),
}

/// Options for insert, update and delete.
///
/// # Example
///
/// ```ignore
/// let opts = Options::new()
///     .tx(&tx)
///     .only(TagRule::include("perms")?)
///     .check_version();
/// users.update(&cx, &mut user, &opts).await?;
/// ```
pub struct Options<'a, C: Connection> {
    pub(crate) tx: Option<&'a Transaction<C>>,
    pub(crate) returning: Returning,
    pub(crate) conflict: Option<Conflict>,
    pub(crate) rule: TagRule,
    pub(crate) condition: Option<(String, Vec<Value>)>,
    pub(crate) check_version: bool,
}

impl<C: Connection> Default for Options<'_, C> {
    fn default() -> Self {
        Self {
            tx: None,
            returning: Returning::Default,
            conflict: None,
            rule: TagRule::All,
            condition: None,
            check_version: false,
        }
    }
}

impl<'a, C: Connection> Options<'a, C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run inside `tx` instead of directly on the connection.
    pub fn tx(mut self, tx: &'a Transaction<C>) -> Self {
        self.tx = Some(tx);
        self
    }

    pub fn returning_all(mut self) -> Self {
        self.returning = Returning::All;
        self
    }

    pub fn returning_nothing(mut self) -> Self {
        self.returning = Returning::Nothing;
        self
    }

    pub fn returning<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.returning = Returning::Columns(columns.into_iter().map(Into::into).collect());
        self
    }

    /// `ON CONFLICT ... DO NOTHING` on insert. An empty column list ignores
    /// any conflict.
    pub fn on_conflict_ignore(mut self, columns: &[&str]) -> Self {
        self.conflict = Some(if columns.is_empty() {
            Conflict::Any
        } else {
            Conflict::On(columns.iter().map(|c| c.to_string()).collect())
        });
        self
    }

    /// Restrict written columns to those admitted by `rule` (partial update).
    pub fn only(mut self, rule: TagRule) -> Self {
        self.rule = rule;
        self
    }

    /// Extra WHERE fragment with `?` markers, ANDed with the id match on
    /// record operations and used alone on `*_where` operations.
    pub fn condition(mut self, fragment: impl Into<String>, params: Vec<Value>) -> Self {
        self.condition = Some((fragment.into(), params));
        self
    }

    /// Require the stored row version to equal the record's on update.
    pub fn check_version(mut self) -> Self {
        self.check_version = true;
        self
    }

    pub(crate) fn condition_parts(&self) -> Option<(&str, usize)> {
        self.condition
            .as_ref()
            .map(|(fragment, params)| (fragment.as_str(), params.len()))
    }

    pub(crate) fn condition_params(&self) -> &[Value] {
        self.condition
            .as_ref()
            .map_or(&[][..], |(_, params)| params.as_slice())
    }
}

/// Parameters of a SELECT, COUNT or EXISTS query.
pub struct SelectQuery<'a, C: Connection> {
    pub(crate) tx: Option<&'a Transaction<C>>,
    pub(crate) condition: Option<String>,
    pub(crate) params: Vec<Value>,
    pub(crate) order_by: Option<String>,
    pub(crate) offset: Option<i64>,
    pub(crate) limit: Option<i64>,
    pub(crate) live_only: bool,
    pub(crate) columns: TagRule,
}

impl<C: Connection> Default for SelectQuery<'_, C> {
    fn default() -> Self {
        Self {
            tx: None,
            condition: None,
            params: Vec::new(),
            order_by: None,
            offset: None,
            limit: None,
            live_only: false,
            columns: TagRule::All,
        }
    }
}

impl<'a, C: Connection> SelectQuery<'a, C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tx(mut self, tx: &'a Transaction<C>) -> Self {
        self.tx = Some(tx);
        self
    }

    /// WHERE fragment with `?` markers.
    pub fn filter(mut self, fragment: impl Into<String>, params: Vec<Value>) -> Self {
        self.condition = Some(fragment.into());
        self.params = params;
        self
    }

    pub fn order_by(mut self, order: impl Into<String>) -> Self {
        self.order_by = Some(order.into());
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skip soft-deleted rows.
    pub fn live_only(mut self) -> Self {
        self.live_only = true;
        self
    }

    /// Select only the columns admitted by `rule`.
    pub fn columns(mut self, rule: TagRule) -> Self {
        self.columns = rule;
        self
    }
}

/// Outcome of a WHERE-driven write.
#[derive(Debug, Clone, PartialEq)]
pub struct Affected<R> {
    pub rows_affected: u64,
    /// Rows from the RETURNING clause, if one was requested.
    pub returned: Vec<R>,
}

impl<R> Affected<R> {
    pub fn is_empty(&self) -> bool {
        self.rows_affected == 0
    }
}
