//! Table facade: one record type bound to one table.
//!
//! Every operation resolves its statement from the [`Db`] statement cache
//! under a key derived from the table, the record layout, the operation and
//! the options that shape its text, so SQL is generated once per variant.
//! Errors leaving a table operation carry the table name and the bound
//! parameters, with values of `secret`-tagged columns masked.

use std::sync::Arc;

use asupersync::Cx;

use rowmap_core::{ConfigError, Error, Record, Result, Row, TagRule, Timestamp, Value};

use crate::builder::check_markers;
use crate::db::Db;
use crate::instance::mask_secrets;
use crate::mapping::{ColumnMeta, ColumnRole, TableMapping};
use crate::options::{Affected, Options, Returning, SelectQuery};
use crate::sqlgen::{self, Filter, Paging};
use crate::statement::CachedStatement;
use crate::transaction::Transaction;

use rowmap_core::Connection;

/// Bound parameters, remembering which ones must not leave the process in
/// clear text.
#[derive(Default)]
struct Binds {
    values: Vec<Value>,
    secret: Vec<bool>,
}

impl Binds {
    fn column<R>(&mut self, meta: &ColumnMeta<R>, record: &R) -> Result<()> {
        self.values.push(meta.read(record)?);
        self.secret.push(meta.is_secret());
        Ok(())
    }

    fn value(&mut self, value: Value) {
        self.values.push(value);
        self.secret.push(false);
    }

    fn extend(&mut self, values: &[Value]) {
        for value in values {
            self.value(value.clone());
        }
    }

    fn masked(&self) -> Vec<Value> {
        mask_secrets(&self.values, &self.secret)
    }
}

/// Generated values written into a record before execution, with the
/// values they replaced.
struct Stamps<'m, R> {
    saved: Vec<(&'m ColumnMeta<R>, Value)>,
}

impl<'m, R> Stamps<'m, R> {
    fn apply(
        record: &mut R,
        stamps: impl IntoIterator<Item = (&'m ColumnMeta<R>, Value)>,
    ) -> Result<Self> {
        let mut applied = Self { saved: Vec::new() };
        for (meta, value) in stamps {
            let previous = match meta.read(record) {
                Ok(previous) => previous,
                Err(e) => {
                    applied.restore(record);
                    return Err(e);
                }
            };
            if let Err(e) = meta.write(record, &value) {
                applied.restore(record);
                return Err(e);
            }
            applied.saved.push((meta, previous));
        }
        Ok(applied)
    }

    fn restore(self, record: &mut R) {
        for (meta, previous) in self.saved.into_iter().rev() {
            if let Err(error) = meta.write(record, &previous) {
                tracing::warn!(column = %meta.column, %error, "failed to restore column value");
            }
        }
    }
}

/// Typed access to one table.
///
/// # Example
///
/// ```ignore
/// let users: Table<User, PgConnection> = Table::open(&cx, db.clone(), "users").await?;
/// let mut user = User { name: "Robert".into(), ..User::default() };
/// users.insert(&cx, &mut user, &Options::new()).await?;
/// user.name = "Rimma".into();
/// users.update(&cx, &mut user, &Options::new().check_version()).await?;
/// ```
pub struct Table<R: Record, C: Connection> {
    db: Arc<Db<C>>,
    mapping: TableMapping<R>,
    /// Record type and column layout; part of every statement key so two
    /// record types bound to one table never share generated SQL.
    layout: String,
}

impl<R: Record + Default, C: Connection> Table<R, C> {
    /// Resolve the mapping of `R` for `table` without touching the database.
    ///
    /// Fails with a configuration fault when the record layout is invalid or
    /// `R::default()` leaves an embedded record uninitialized.
    pub fn new(db: Arc<Db<C>>, table: &str) -> Result<Self> {
        let mapping = TableMapping::<R>::resolve(table, db.labels())?;
        mapping.check_initialized(&R::default())?;
        tracing::debug!(
            table,
            columns = mapping.columns().len(),
            sequence = mapping.is_sequence_backed(),
            versioned = mapping.is_versioned(),
            soft_delete = mapping.is_soft_deletable(),
            "table mapped"
        );
        let columns: Vec<String> = mapping
            .columns()
            .iter()
            .map(|meta| format!("{}={:?}", meta.column, meta.tags))
            .collect();
        let layout = format!("{}[{}]", std::any::type_name::<R>(), columns.join(","));
        Ok(Self {
            db,
            mapping,
            layout,
        })
    }

    /// Like [`new`](Self::new), then check the table exists when the `Db` is
    /// configured to check table existence.
    pub async fn open(cx: &Cx, db: Arc<Db<C>>, table: &str) -> Result<Self> {
        let table = Self::new(db, table)?;
        if table.db.config().check_table_existence {
            table.check_exists(cx).await?;
        }
        Ok(table)
    }

    pub fn name(&self) -> &str {
        self.mapping.table()
    }

    pub fn mapping(&self) -> &TableMapping<R> {
        &self.mapping
    }

    pub fn db(&self) -> &Arc<Db<C>> {
        &self.db
    }

    // ==================== Writes ====================

    /// Insert `record`.
    ///
    /// `created_at` is stamped with the current time and `row_version` set
    /// to 1 before execution; both are restored if the insert fails or a
    /// conflict is ignored. Returned columns (the generated id by default)
    /// are written back into `record`.
    pub async fn insert(&self, cx: &Cx, record: &mut R, opts: &Options<'_, C>) -> Result<u64> {
        self.mapping.check_initialized(record)?;
        let default = if self.mapping.is_sequence_backed() {
            vec!["id".to_string()]
        } else {
            Vec::new()
        };
        let returning = self.returning(&opts.returning, default)?;

        let mut stamps = Vec::new();
        if let Some(created_at) = self.mapping.role(ColumnRole::CreatedAt) {
            stamps.push((created_at, Value::from(Timestamp::now())));
        }
        if let Some(version) = self.mapping.role(ColumnRole::RowVersion) {
            stamps.push((version, Value::BigInt(1)));
        }
        let stamps = Stamps::apply(record, stamps)?;

        match self.insert_stamped(cx, record, opts, &returning).await {
            Ok(affected) if affected > 0 => Ok(affected),
            Ok(affected) => {
                stamps.restore(record);
                Ok(affected)
            }
            Err(e) => {
                stamps.restore(record);
                Err(e)
            }
        }
    }

    async fn insert_stamped(
        &self,
        cx: &Cx,
        record: &mut R,
        opts: &Options<'_, C>,
        returning: &[String],
    ) -> Result<u64> {
        let columns = self.mapping.insert_columns();
        let sequence = self.mapping.is_sequence_backed();
        let mut binds = Binds::default();
        for meta in &columns {
            if !(sequence && meta.role == ColumnRole::PrimaryKey) {
                binds.column(meta, record)?;
            }
        }

        let variant = format!("{:?}|{:?}", opts.conflict, returning);
        let stmt = self
            .statement(cx, "insert", &variant, None, || {
                sqlgen::insert(
                    &self.mapping,
                    &columns,
                    opts.conflict.as_ref(),
                    returning,
                    self.db.placeholder_style(),
                )
            })
            .await?;
        let (affected, rows) = self
            .execute(cx, &stmt, opts.tx, &binds, !returning.is_empty())
            .await?;
        if let Some(row) = rows.first() {
            self.write_back(record, row, &binds)?;
        }
        Ok(affected)
    }

    /// Update `record` by primary key.
    ///
    /// Written columns are the plain columns admitted by the options' tag
    /// rule and not tagged `noupd`, plus `updated_at`, which is stamped
    /// before execution and restored on failure. A versioned table bumps
    /// `row_version` and the new value is written back. No matching row
    /// (including a row version mismatch under `check_version`) is
    /// `NotFound`.
    pub async fn update(&self, cx: &Cx, record: &mut R, opts: &Options<'_, C>) -> Result<u64> {
        self.mapping.check_initialized(record)?;
        opts.rule.validate(self.db.labels())?;
        let id = self.mapping.require(ColumnRole::PrimaryKey, "id")?;
        let version = if opts.check_version {
            Some(self.mapping.require(ColumnRole::RowVersion, "row_version")?)
        } else {
            None
        };
        let returning = self.versioned_returning(&opts.returning)?;

        let stamps = match self.mapping.role(ColumnRole::UpdatedAt) {
            Some(updated_at) => vec![(updated_at, Value::from(Timestamp::now()))],
            None => Vec::new(),
        };
        let stamps = Stamps::apply(record, stamps)?;

        let result = self
            .update_stamped(cx, record, opts, id, version, &returning)
            .await;
        if result.is_err() {
            stamps.restore(record);
        }
        result
    }

    async fn update_stamped(
        &self,
        cx: &Cx,
        record: &mut R,
        opts: &Options<'_, C>,
        id: &ColumnMeta<R>,
        version: Option<&ColumnMeta<R>>,
        returning: &[String],
    ) -> Result<u64> {
        let columns = self.mapping.update_columns(&opts.rule);
        let mut binds = Binds::default();
        for meta in &columns {
            binds.column(meta, record)?;
        }
        binds.column(id, record)?;
        if let Some(version) = version {
            binds.column(version, record)?;
        }
        binds.extend(opts.condition_params());

        let filter = Filter {
            by_id: true,
            check_version: version.is_some(),
            condition: opts.condition_parts(),
            live_only: false,
        };
        let variant = format!(
            "{}|{}|{:?}|{:?}",
            opts.rule,
            filter.check_version,
            filter.condition.map(|(fragment, _)| fragment),
            returning
        );
        let stmt = self
            .statement(cx, "update", &variant, filter.condition, || {
                sqlgen::update(
                    &self.mapping,
                    &columns,
                    &filter,
                    returning,
                    self.db.placeholder_style(),
                )
            })
            .await?;
        let (affected, rows) = self
            .execute(cx, &stmt, opts.tx, &binds, !returning.is_empty())
            .await?;
        if affected == 0 {
            return Err(self.no_match("update", &binds));
        }
        if let Some(row) = rows.first() {
            self.write_back(record, row, &binds)?;
        }
        Ok(affected)
    }

    /// Soft-delete `record`: stamp `deleted_at` and bump `row_version`.
    /// Requires a `deleted_at` column.
    pub async fn delete(&self, cx: &Cx, record: &mut R, opts: &Options<'_, C>) -> Result<u64> {
        self.mapping.check_initialized(record)?;
        let deleted_at = self.mapping.require(ColumnRole::DeletedAt, "deleted_at")?;
        let id = self.mapping.require(ColumnRole::PrimaryKey, "id")?;
        let version = if opts.check_version {
            Some(self.mapping.require(ColumnRole::RowVersion, "row_version")?)
        } else {
            None
        };
        let returning = self.versioned_returning(&opts.returning)?;
        let stamps = Stamps::apply(record, [(deleted_at, Value::from(Timestamp::now()))])?;

        let result = self
            .delete_stamped(cx, record, opts, [deleted_at, id], version, &returning)
            .await;
        if result.is_err() {
            stamps.restore(record);
        }
        result
    }

    async fn delete_stamped(
        &self,
        cx: &Cx,
        record: &mut R,
        opts: &Options<'_, C>,
        [deleted_at, id]: [&ColumnMeta<R>; 2],
        version: Option<&ColumnMeta<R>>,
        returning: &[String],
    ) -> Result<u64> {
        let mut binds = Binds::default();
        binds.column(deleted_at, record)?;
        binds.column(id, record)?;
        if let Some(version) = version {
            binds.column(version, record)?;
        }
        binds.extend(opts.condition_params());

        let filter = Filter {
            by_id: true,
            check_version: version.is_some(),
            condition: opts.condition_parts(),
            live_only: false,
        };
        let variant = format!(
            "{}|{:?}|{:?}",
            filter.check_version,
            filter.condition.map(|(fragment, _)| fragment),
            returning
        );
        let stmt = self
            .statement(cx, "delete", &variant, filter.condition, || {
                sqlgen::soft_delete(
                    &self.mapping,
                    &filter,
                    returning,
                    self.db.placeholder_style(),
                )
            })
            .await?;
        let (affected, rows) = self
            .execute(cx, &stmt, opts.tx, &binds, !returning.is_empty())
            .await?;
        if affected == 0 {
            return Err(self.no_match("delete", &binds));
        }
        if let Some(row) = rows.first() {
            self.write_back(record, row, &binds)?;
        }
        Ok(affected)
    }

    /// Soft-delete every live row matching the options' condition. Returns
    /// all columns of the deleted rows unless told otherwise.
    pub async fn delete_where(&self, cx: &Cx, opts: &Options<'_, C>) -> Result<Affected<R>> {
        self.mapping.require(ColumnRole::DeletedAt, "deleted_at")?;
        let condition = self.required_condition(opts, "delete_where")?;
        let returning = self.returning(&opts.returning, self.all_columns())?;

        let mut binds = Binds::default();
        binds.value(Value::from(Timestamp::now()));
        binds.extend(opts.condition_params());

        let filter = Filter {
            condition: Some(condition),
            live_only: true,
            ..Filter::default()
        };
        let variant = format!("{}|{:?}", condition.0, returning);
        let stmt = self
            .statement(cx, "delete_where", &variant, Some(condition), || {
                sqlgen::soft_delete(
                    &self.mapping,
                    &filter,
                    &returning,
                    self.db.placeholder_style(),
                )
            })
            .await?;
        let (rows_affected, rows) = self
            .execute(cx, &stmt, opts.tx, &binds, !returning.is_empty())
            .await?;
        Ok(Affected {
            rows_affected,
            returned: self.records_from(&rows, &binds)?,
        })
    }

    /// Remove the row with primary key `id`. No such row is `NotFound`.
    pub async fn hard_delete(
        &self,
        cx: &Cx,
        id: impl Into<Value>,
        opts: &Options<'_, C>,
    ) -> Result<Affected<R>> {
        self.mapping.require(ColumnRole::PrimaryKey, "id")?;
        let returning = self.returning(&opts.returning, Vec::new())?;
        let mut binds = Binds::default();
        binds.value(id.into());
        binds.extend(opts.condition_params());

        let filter = Filter {
            by_id: true,
            condition: opts.condition_parts(),
            ..Filter::default()
        };
        let variant = format!("{:?}|{:?}", filter.condition.map(|(f, _)| f), returning);
        let stmt = self
            .statement(cx, "hard_delete", &variant, filter.condition, || {
                sqlgen::hard_delete(
                    &self.mapping,
                    &filter,
                    &returning,
                    self.db.placeholder_style(),
                )
            })
            .await?;
        let (rows_affected, rows) = self
            .execute(cx, &stmt, opts.tx, &binds, !returning.is_empty())
            .await?;
        if rows_affected == 0 {
            return Err(self.no_match("hard_delete", &binds));
        }
        Ok(Affected {
            rows_affected,
            returned: self.records_from(&rows, &binds)?,
        })
    }

    /// Remove every row matching the options' condition. Returns all
    /// columns of the removed rows unless told otherwise.
    pub async fn hard_delete_where(&self, cx: &Cx, opts: &Options<'_, C>) -> Result<Affected<R>> {
        let condition = self.required_condition(opts, "hard_delete_where")?;
        let returning = self.returning(&opts.returning, self.all_columns())?;
        let mut binds = Binds::default();
        binds.extend(opts.condition_params());

        let filter = Filter {
            condition: Some(condition),
            ..Filter::default()
        };
        let variant = format!("{}|{:?}", condition.0, returning);
        let stmt = self
            .statement(cx, "hard_delete_where", &variant, Some(condition), || {
                sqlgen::hard_delete(
                    &self.mapping,
                    &filter,
                    &returning,
                    self.db.placeholder_style(),
                )
            })
            .await?;
        let (rows_affected, rows) = self
            .execute(cx, &stmt, opts.tx, &binds, !returning.is_empty())
            .await?;
        Ok(Affected {
            rows_affected,
            returned: self.records_from(&rows, &binds)?,
        })
    }

    /// Stamp `updated_at` and bump `row_version` of `record`'s row without
    /// writing other columns.
    pub async fn touch(
        &self,
        cx: &Cx,
        record: &mut R,
        tx: Option<&Transaction<C>>,
    ) -> Result<()> {
        let id = self.mapping.require(ColumnRole::PrimaryKey, "id")?;
        let returning = self.versioned_returning(&Returning::Default)?;
        let stamps = match self.mapping.role(ColumnRole::UpdatedAt) {
            Some(updated_at) => vec![(updated_at, Value::from(Timestamp::now()))],
            None => Vec::new(),
        };
        let stamps = Stamps::apply(record, stamps)?;

        let result = self.touch_stamped(cx, record, tx, id, &returning).await;
        if result.is_err() {
            stamps.restore(record);
        }
        result
    }

    async fn touch_stamped(
        &self,
        cx: &Cx,
        record: &mut R,
        tx: Option<&Transaction<C>>,
        id: &ColumnMeta<R>,
        returning: &[String],
    ) -> Result<()> {
        let mut binds = Binds::default();
        if let Some(updated_at) = self.mapping.role(ColumnRole::UpdatedAt) {
            binds.column(updated_at, record)?;
        }
        binds.column(id, record)?;
        let stmt = self
            .statement(cx, "touch", "", None, || {
                sqlgen::touch(&self.mapping, returning, self.db.placeholder_style())
            })
            .await?;
        let (affected, rows) = self
            .execute(cx, &stmt, tx, &binds, !returning.is_empty())
            .await?;
        if affected == 0 {
            return Err(self.no_match("touch", &binds));
        }
        if let Some(row) = rows.first() {
            self.write_back(record, row, &binds)?;
        }
        Ok(())
    }

    // ==================== Reads ====================

    /// Run a SELECT and hand each row, mapped into a fresh record, to `f`.
    /// Returns the number of rows delivered. Rows delivered before a failure
    /// stay delivered; the error names the failing row.
    pub async fn select<F>(&self, cx: &Cx, query: &SelectQuery<'_, C>, mut f: F) -> Result<u64>
    where
        F: FnMut(R) -> Result<()>,
    {
        query.columns.validate(self.db.labels())?;
        if query.live_only {
            self.mapping.require(ColumnRole::DeletedAt, "deleted_at")?;
        }
        let columns = self.mapping.select_columns(&query.columns);
        let mut binds = Binds::default();
        binds.extend(&query.params);
        if let Some(offset) = query.offset {
            binds.value(Value::BigInt(offset));
        }
        if let Some(limit) = query.limit {
            binds.value(Value::BigInt(limit));
        }

        let filter = Filter {
            condition: query
                .condition
                .as_deref()
                .map(|fragment| (fragment, query.params.len())),
            live_only: query.live_only,
            ..Filter::default()
        };
        let paging = Paging {
            order_by: query.order_by.as_deref(),
            offset: query.offset.is_some(),
            limit: query.limit.is_some(),
        };
        let variant = format!(
            "{}|{:?}|{}|{:?}|{}|{}",
            query.columns,
            query.condition,
            query.live_only,
            query.order_by,
            paging.offset,
            paging.limit
        );
        let stmt = self
            .statement(cx, "select", &variant, filter.condition, || {
                sqlgen::select(
                    &self.mapping,
                    &columns,
                    &filter,
                    &paging,
                    self.db.placeholder_style(),
                )
            })
            .await?;

        let mut instance = self.db.instance_in(&stmt, query.tx).masking(&binds.secret);
        instance
            .query(cx, &binds.values)
            .await
            .map_err(|e| self.decorate(e, &binds))?;
        instance
            .fetch(|row| {
                let mut record = R::default();
                self.mapping.write_positional(&mut record, &columns, &row)?;
                f(record)
            })
            .map_err(|e| self.decorate(e, &binds))
    }

    pub async fn select_all(&self, cx: &Cx, query: &SelectQuery<'_, C>) -> Result<Vec<R>> {
        let mut records = Vec::new();
        self.select(cx, query, |record| {
            records.push(record);
            Ok(())
        })
        .await?;
        Ok(records)
    }

    /// Row with primary key `id`, soft-deleted or not. No such row is
    /// `NotFound`.
    pub async fn select_by_id(
        &self,
        cx: &Cx,
        id: impl Into<Value>,
        tx: Option<&Transaction<C>>,
    ) -> Result<R> {
        self.mapping.require(ColumnRole::PrimaryKey, "id")?;
        let columns = self.mapping.select_columns(&TagRule::All);
        let mut binds = Binds::default();
        binds.value(id.into());
        let stmt = self
            .statement(cx, "select_by_id", "", None, || {
                sqlgen::select(
                    &self.mapping,
                    &columns,
                    &Filter::by_id(),
                    &Paging::default(),
                    self.db.placeholder_style(),
                )
            })
            .await?;
        let row = self
            .db
            .instance_in(&stmt, tx)
            .masking(&binds.secret)
            .query_row(cx, &binds.values)
            .await
            .map_err(|e| self.decorate(e, &binds))?;
        let mut record = R::default();
        self.mapping
            .write_positional(&mut record, &columns, &row)
            .map_err(|e| self.decorate(e, &binds))?;
        Ok(record)
    }

    /// Every row, without columns tagged `nocache`; soft-deleted rows only
    /// when `include_deleted` is set.
    pub async fn select_cached(&self, cx: &Cx, include_deleted: bool) -> Result<Vec<R>> {
        let columns = self.mapping.cache_columns();
        let live_only = !include_deleted && self.mapping.is_soft_deletable();
        let filter = Filter {
            live_only,
            ..Filter::default()
        };
        let stmt = self
            .statement(cx, "select_cached", &live_only.to_string(), None, || {
                sqlgen::select(
                    &self.mapping,
                    &columns,
                    &filter,
                    &Paging::default(),
                    self.db.placeholder_style(),
                )
            })
            .await?;
        let binds = Binds::default();
        let rows = self
            .db
            .instance(&stmt)
            .query_all(cx, &[])
            .await
            .map_err(|e| self.decorate(e, &binds))?;
        rows.iter()
            .enumerate()
            .map(|(index, row)| -> Result<R> {
                let mut record = R::default();
                self.mapping
                    .write_positional(&mut record, &columns, row)
                    .map_err(|e| self.decorate(e.with_row(index as u64), &binds))?;
                Ok(record)
            })
            .collect()
    }

    pub async fn count(&self, cx: &Cx, query: &SelectQuery<'_, C>) -> Result<i64> {
        if query.live_only {
            self.mapping.require(ColumnRole::DeletedAt, "deleted_at")?;
        }
        let mut binds = Binds::default();
        binds.extend(&query.params);
        let filter = Filter {
            condition: query
                .condition
                .as_deref()
                .map(|fragment| (fragment, query.params.len())),
            live_only: query.live_only,
            ..Filter::default()
        };
        let variant = format!("{:?}|{}", query.condition, query.live_only);
        let stmt = self
            .statement(cx, "count", &variant, filter.condition, || {
                sqlgen::count(&self.mapping, &filter, self.db.placeholder_style())
            })
            .await?;
        let row = self
            .db
            .instance_in(&stmt, query.tx)
            .masking(&binds.secret)
            .query_row(cx, &binds.values)
            .await
            .map_err(|e| self.decorate(e, &binds))?;
        row.get_as::<i64>(0).map_err(|e| self.decorate(e, &binds))
    }

    /// Whether a row with primary key `id` exists, soft-deleted or not.
    pub async fn exists(
        &self,
        cx: &Cx,
        id: impl Into<Value>,
        tx: Option<&Transaction<C>>,
    ) -> Result<bool> {
        self.mapping.require(ColumnRole::PrimaryKey, "id")?;
        let mut binds = Binds::default();
        binds.value(id.into());
        let stmt = self
            .statement(cx, "exists", "", None, || {
                sqlgen::exists(&self.mapping, &Filter::by_id(), self.db.placeholder_style())
            })
            .await?;
        let rows = self
            .db
            .instance_in(&stmt, tx)
            .masking(&binds.secret)
            .query_all(cx, &binds.values)
            .await
            .map_err(|e| self.decorate(e, &binds))?;
        Ok(!rows.is_empty())
    }

    pub async fn exists_where(&self, cx: &Cx, query: &SelectQuery<'_, C>) -> Result<bool> {
        if query.live_only {
            self.mapping.require(ColumnRole::DeletedAt, "deleted_at")?;
        }
        let mut binds = Binds::default();
        binds.extend(&query.params);
        let filter = Filter {
            condition: query
                .condition
                .as_deref()
                .map(|fragment| (fragment, query.params.len())),
            live_only: query.live_only,
            ..Filter::default()
        };
        let variant = format!("{:?}|{}", query.condition, query.live_only);
        let stmt = self
            .statement(cx, "exists_where", &variant, filter.condition, || {
                sqlgen::exists(&self.mapping, &filter, self.db.placeholder_style())
            })
            .await?;
        let rows = self
            .db
            .instance_in(&stmt, query.tx)
            .masking(&binds.secret)
            .query_all(cx, &binds.values)
            .await
            .map_err(|e| self.decorate(e, &binds))?;
        Ok(!rows.is_empty())
    }

    // ==================== Schema checks ====================

    /// Fail unless the table exists.
    pub async fn check_exists(&self, cx: &Cx) -> Result<()> {
        let stmt = self
            .statement(cx, "check_exists", "", None, || {
                sqlgen::exists(&self.mapping, &Filter::default(), self.db.placeholder_style())
            })
            .await?;
        self.db
            .instance(&stmt)
            .query_all(cx, &[])
            .await
            .map(|_| ())
            .map_err(|e| self.decorate(e, &Binds::default()))
    }

    /// Fail unless every mapped column exists in the table.
    pub async fn check_columns(&self, cx: &Cx) -> Result<()> {
        let columns = self.mapping.select_columns(&TagRule::All);
        let paging = Paging {
            limit: true,
            ..Paging::default()
        };
        let stmt = self
            .statement(cx, "check_columns", "", None, || {
                sqlgen::select(
                    &self.mapping,
                    &columns,
                    &Filter::default(),
                    &paging,
                    self.db.placeholder_style(),
                )
            })
            .await?;
        let mut binds = Binds::default();
        binds.value(Value::BigInt(1));
        self.db
            .instance(&stmt)
            .masking(&binds.secret)
            .query_all(cx, &binds.values)
            .await
            .map(|_| ())
            .map_err(|e| self.decorate(e, &binds))
    }

    // ==================== Internals ====================

    /// Resolve the cached statement for one operation variant. A caller
    /// condition is checked against its parameters on every call, not only
    /// when the SQL is first generated.
    async fn statement<F>(
        &self,
        cx: &Cx,
        operation: &str,
        variant: &str,
        condition: Option<(&str, usize)>,
        generate: F,
    ) -> Result<Arc<CachedStatement>>
    where
        F: FnOnce() -> Result<String>,
    {
        if let Some((fragment, params)) = condition {
            check_markers(fragment, params).map_err(Error::from)?;
        }
        let key = self.statement_key(operation, variant);
        self.db
            .resolve(cx, &key, generate)
            .await
            .map_err(|e| e.with_table(self.mapping.table(), &[]))
    }

    fn statement_key(&self, operation: &str, variant: &str) -> String {
        let digest = md5::compute(format!("{}|{variant}", self.layout).as_bytes());
        format!("{}:{operation}:{digest:x}", self.mapping.table())
    }

    /// Execute, reading rows when the statement has a RETURNING clause.
    async fn execute(
        &self,
        cx: &Cx,
        stmt: &Arc<CachedStatement>,
        tx: Option<&Transaction<C>>,
        binds: &Binds,
        returning: bool,
    ) -> Result<(u64, Vec<Row>)> {
        let mut instance = self.db.instance_in(stmt, tx).masking(&binds.secret);
        let result = if returning {
            instance
                .query_all(cx, &binds.values)
                .await
                .map(|rows| (rows.len() as u64, rows))
        } else {
            instance
                .exec(cx, &binds.values)
                .await
                .map(|affected| (affected, Vec::new()))
        };
        result.map_err(|e| self.decorate(e, binds))
    }

    fn decorate(&self, err: Error, binds: &Binds) -> Error {
        err.with_table(self.mapping.table(), &binds.masked())
    }

    fn no_match(&self, operation: &str, binds: &Binds) -> Error {
        self.decorate(
            Error::not_found(format!(
                "{operation} matched no row in {}",
                self.mapping.table()
            )),
            binds,
        )
    }

    fn write_back(&self, record: &mut R, row: &Row, binds: &Binds) -> Result<()> {
        self.mapping
            .write_named(record, row)
            .map_err(|e| self.decorate(e, binds))
    }

    fn records_from(&self, rows: &[Row], binds: &Binds) -> Result<Vec<R>> {
        rows.iter()
            .map(|row| -> Result<R> {
                let mut record = R::default();
                self.write_back(&mut record, row, binds)?;
                Ok(record)
            })
            .collect()
    }

    fn all_columns(&self) -> Vec<String> {
        self.mapping
            .columns()
            .iter()
            .map(|c| c.column.clone())
            .collect()
    }

    /// RETURNING column list, checking caller-named columns against the
    /// mapping.
    fn returning(&self, returning: &Returning, default: Vec<String>) -> Result<Vec<String>> {
        match returning {
            Returning::Default => Ok(default),
            Returning::Nothing => Ok(Vec::new()),
            Returning::All => Ok(self.all_columns()),
            Returning::Columns(columns) => {
                for column in columns {
                    if self.mapping.column(column).is_none() {
                        return Err(ConfigError::UnknownColumn {
                            table: self.mapping.table().to_string(),
                            column: column.clone(),
                        }
                        .into());
                    }
                }
                Ok(columns.clone())
            }
        }
    }

    /// RETURNING list for writes that bump the row version: the new version
    /// always comes back so the record stays in step with the row.
    fn versioned_returning(&self, returning: &Returning) -> Result<Vec<String>> {
        let mut columns = self.returning(returning, Vec::new())?;
        if self.mapping.is_versioned() && !columns.iter().any(|c| c == "row_version") {
            columns.insert(0, "row_version".to_string());
        }
        Ok(columns)
    }

    fn required_condition<'o>(
        &self,
        opts: &'o Options<'_, C>,
        operation: &str,
    ) -> Result<(&'o str, usize)> {
        opts.condition_parts().ok_or_else(|| {
            Error::Config(ConfigError::InvalidOptions {
                message: format!(
                    "{operation} on {} requires a condition",
                    self.mapping.table()
                ),
            })
        })
    }
}

impl<R: Record, C: Connection> std::fmt::Debug for Table<R, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("mapping", &self.mapping)
            .finish_non_exhaustive()
    }
}
