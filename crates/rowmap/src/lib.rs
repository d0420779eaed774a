//! Record-to-table mapping over cached prepared statements.
//!
//! Describe a table once as a struct deriving [`Record`], bind it to a
//! [`Db`] as a [`Table`], and get generated, cached, parameterized SQL for
//! select, insert, update, delete, exists and count, with row-version
//! optimistic concurrency and classified errors.
//!
//! ```ignore
//! use rowmap::{Db, Options, Record, SelectQuery, Table, Timestamp};
//!
//! #[derive(Debug, Default, Record)]
//! pub struct User {
//!     pub id: i64,
//!     pub name: String,
//!     #[rowmap(tags = "secret")]
//!     pub password: String,
//!     pub row_version: i64,
//!     pub created_at: Timestamp,
//!     pub updated_at: Timestamp,
//!     pub deleted_at: Option<Timestamp>,
//! }
//!
//! let db = Arc::new(Db::new(conn));
//! let users: Table<User, _> = Table::open(&cx, db, "users").await?;
//! let mut user = User { name: "Robert".into(), ..User::default() };
//! users.insert(&cx, &mut user, &Options::new()).await?;
//! let live = users.select_all(&cx, &SelectQuery::new().live_only()).await?;
//! ```
//!
//! Every database call takes an asupersync [`Cx`]; a cancelled context
//! aborts the call with a retryable `Cancelled` error.

extern crate self as rowmap;

pub mod binder;
pub mod builder;
pub mod config;
pub mod db;
pub mod instance;
pub mod mapping;
pub mod observer;
pub mod options;
pub mod sqlgen;
pub mod statement;
pub mod table;
pub mod transaction;

#[cfg(test)]
mod mock;

pub use rowmap_core::{
    Access, ConfigError, Connection, Cx, DriverError, DriverErrorKind, Embedded, Error, ErrorKind,
    FieldDef, FieldKind, FromValue, IsolationLevel, Label, LabelRegistry, Outcome,
    PlaceholderStyle, PreparedStatement, QueryError, Record, Result, Row, SqlField, TagRule,
    TagSet, Timestamp, TransactionOps, Value, to_snake_case,
};
pub use rowmap_macros::Record;

pub use binder::{BoundTables, TableBinder};
pub use builder::SqlBuilder;
pub use config::DbConfig;
pub use db::Db;
pub use instance::{Instance, InstanceState, InstanceStats};
pub use mapping::{ColumnMeta, ColumnRole, TableMapping};
pub use observer::{StatementObserver, TracingObserver};
pub use options::{Affected, Options, Returning, SelectQuery};
pub use sqlgen::Conflict;
pub use statement::{CachedStatement, statement_key};
pub use table::Table;
pub use transaction::{Transaction, TxState};
