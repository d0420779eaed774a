//! Core types and traits for rowmap.
//!
//! `rowmap-core` is the contract layer shared by the `rowmap` facade, the
//! derive macro and database drivers:
//!
//! - **Record contract**: [`Record`] and [`FieldDef`] describe how a struct's
//!   fields map to columns, including embedded records.
//! - **Driver seam**: [`Connection`] and [`TransactionOps`] are implemented by
//!   drivers; rowmap issues every statement through them.
//! - **Data model**: [`Value`], [`Row`] and [`Timestamp`].
//! - **Errors**: [`Error`] separates configuration faults from classified
//!   query failures.
//! - **Structured concurrency**: re-exports `Cx` and `Outcome` from asupersync
//!   so every database call is cancel-aware.

pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod dialect;
pub mod error;
pub mod naming;
pub mod record;
pub mod row;
pub mod tags;
pub mod value;

pub use connection::{Connection, IsolationLevel, PreparedStatement, TransactionOps};
pub use dialect::PlaceholderStyle;
pub use error::{ConfigError, DriverError, DriverErrorKind, Error, ErrorKind, QueryError, Result};
pub use naming::to_snake_case;
pub use record::{Access, Embedded, FieldDef, FieldKind, Getter, Presence, Record, Setter, SqlField};
pub use row::Row;
pub use tags::{Label, LabelRegistry, SKIP, Tag, TagRule, TagSet};
pub use value::{FromValue, Timestamp, Value};
