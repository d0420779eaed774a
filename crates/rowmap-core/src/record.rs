//! The record contract: how a Rust struct exposes its fields to rowmap.
//!
//! A [`Record`] returns one [`FieldDef`] per mapped field, in declaration
//! order. A definition either reads and writes a single column through typed
//! accessors, or embeds another record whose fields are flattened into the
//! parent. The derive macro in `rowmap-macros` generates these definitions;
//! they can also be written by hand.

use std::any::TypeId;
use std::sync::Arc;

use crate::error::{ConfigError, Error, Result};
use crate::value::{FromValue, Timestamp, Value};

/// A struct mapped to table rows.
pub trait Record: Send + Sync + 'static {
    /// Field definitions in declaration order.
    fn fields() -> Vec<FieldDef<Self>>
    where
        Self: Sized;
}

/// Broad storage class of a mapped field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Bool,
    Integer,
    Float,
    Text,
    Bytes,
    Timestamp,
    Json,
    /// Nested record flattened into the parent.
    Embedded,
}

/// A Rust type that can be stored in a single column.
pub trait SqlField: Clone + Into<Value> + FromValue + Send + Sync + 'static {
    const KIND: FieldKind;
    const NULLABLE: bool = false;
}

macro_rules! impl_sql_field {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(
            impl SqlField for $ty {
                const KIND: FieldKind = FieldKind::$kind;
            }
        )*
    };
}

impl_sql_field! {
    bool => Bool,
    i16 => Integer,
    i32 => Integer,
    i64 => Integer,
    f64 => Float,
    String => Text,
    Vec<u8> => Bytes,
    Timestamp => Timestamp,
    serde_json::Value => Json,
}

impl<T: SqlField> SqlField for Option<T> {
    const KIND: FieldKind = T::KIND;
    const NULLABLE: bool = true;
}

pub type Getter<R> = Arc<dyn Fn(&R) -> Result<Value> + Send + Sync>;
pub type Setter<R> = Arc<dyn Fn(&mut R, &Value) -> Result<()> + Send + Sync>;
/// Reports whether every embedded record on a path is present.
pub type Presence<R> = Arc<dyn Fn(&R) -> bool + Send + Sync>;

/// How a field is reached from its owning record.
pub enum Access<R> {
    Column { get: Getter<R>, set: Setter<R> },
    Embedded(Embedded<R>),
}

/// A nested record whose fields are expanded lazily.
pub struct Embedded<R> {
    type_id: TypeId,
    type_name: &'static str,
    presence: Presence<R>,
    expand: Box<dyn Fn() -> Vec<FieldDef<R>> + Send + Sync>,
}

impl<R> Embedded<R> {
    /// `TypeId` of the embedded record, used to detect embedding cycles.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// True when the embedded record (and every record above it) is present.
    pub fn is_present(&self, record: &R) -> bool {
        (self.presence)(record)
    }

    pub fn presence(&self) -> Presence<R> {
        Arc::clone(&self.presence)
    }

    /// Child definitions, already lifted to operate on the owning record.
    pub fn expand(&self) -> Vec<FieldDef<R>> {
        (self.expand)()
    }
}

/// Description of one record field.
pub struct FieldDef<R> {
    /// Rust field name
    pub name: &'static str,
    /// Raw tag string, parsed when the table is bound
    pub tags: &'static str,
    pub kind: FieldKind,
    /// Rust type name, for diagnostics
    pub type_name: &'static str,
    pub nullable: bool,
    /// Dotted path from the root record, for nested fields
    pub path: String,
    pub access: Access<R>,
}

impl<R: 'static> FieldDef<R> {
    /// Column field read and written through plain references.
    pub fn field<T: SqlField>(
        name: &'static str,
        get_ref: fn(&R) -> &T,
        get_mut: fn(&mut R) -> &mut T,
    ) -> Self {
        let get: Getter<R> = Arc::new(move |record: &R| Ok(get_ref(record).clone().into()));
        let set: Setter<R> = Arc::new(move |record: &mut R, value: &Value| {
            *get_mut(record) = T::from_value(value)?;
            Ok(())
        });
        Self {
            name,
            tags: "",
            kind: T::KIND,
            type_name: std::any::type_name::<T>(),
            nullable: T::NULLABLE,
            path: name.to_string(),
            access: Access::Column { get, set },
        }
    }

    /// Column field with arbitrary accessors.
    pub fn column<G, S>(name: &'static str, kind: FieldKind, get: G, set: S) -> Self
    where
        G: Fn(&R) -> Result<Value> + Send + Sync + 'static,
        S: Fn(&mut R, &Value) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name,
            tags: "",
            kind,
            type_name: "",
            nullable: true,
            path: name.to_string(),
            access: Access::Column {
                get: Arc::new(get),
                set: Arc::new(set),
            },
        }
    }

    /// Nested record flattened into this one.
    ///
    /// The projections return `None` when the nested record is absent, for
    /// example an `Option<Box<S>>` field left empty.
    pub fn embedded<S: Record>(
        name: &'static str,
        project: fn(&R) -> Option<&S>,
        project_mut: fn(&mut R) -> Option<&mut S>,
    ) -> Self {
        let presence: Presence<R> = Arc::new(move |record: &R| project(record).is_some());
        let expand = Box::new(move || {
            S::fields()
                .into_iter()
                .map(|child| child.lift(name, project, project_mut))
                .collect::<Vec<_>>()
        });
        Self {
            name,
            tags: "",
            kind: FieldKind::Embedded,
            type_name: std::any::type_name::<S>(),
            nullable: false,
            path: name.to_string(),
            access: Access::Embedded(Embedded {
                type_id: TypeId::of::<S>(),
                type_name: std::any::type_name::<S>(),
                presence,
                expand,
            }),
        }
    }

    pub fn tags(mut self, tags: &'static str) -> Self {
        self.tags = tags;
        self
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    pub fn type_name(mut self, type_name: &'static str) -> Self {
        self.type_name = type_name;
        self
    }

    pub fn is_embedded(&self) -> bool {
        matches!(self.access, Access::Embedded(_))
    }

    /// Re-root this definition under a parent record `P` that holds `R` in
    /// the field `parent`.
    fn lift<P: 'static>(
        self,
        parent: &'static str,
        project: fn(&P) -> Option<&R>,
        project_mut: fn(&mut P) -> Option<&mut R>,
    ) -> FieldDef<P> {
        let path = format!("{parent}.{}", self.path);
        let access = match self.access {
            Access::Column { get, set } => {
                let get: Getter<P> = Arc::new(move |record: &P| match project(record) {
                    Some(inner) => get(inner),
                    None => Err(uninitialized(parent)),
                });
                let set: Setter<P> =
                    Arc::new(move |record: &mut P, value: &Value| match project_mut(record) {
                        Some(inner) => set(inner, value),
                        None => Err(uninitialized(parent)),
                    });
                Access::Column { get, set }
            }
            Access::Embedded(inner) => {
                let Embedded {
                    type_id,
                    type_name,
                    presence,
                    expand,
                } = inner;
                let lifted_presence: Presence<P> =
                    Arc::new(move |record: &P| project(record).is_some_and(|r| presence(r)));
                let lifted_expand = Box::new(move || {
                    expand()
                        .into_iter()
                        .map(|child| child.lift(parent, project, project_mut))
                        .collect::<Vec<_>>()
                });
                Access::Embedded(Embedded {
                    type_id,
                    type_name,
                    presence: lifted_presence,
                    expand: lifted_expand,
                })
            }
        };
        FieldDef {
            name: self.name,
            tags: self.tags,
            kind: self.kind,
            type_name: self.type_name,
            nullable: self.nullable,
            path,
            access,
        }
    }
}

fn uninitialized(field: &str) -> Error {
    Error::Config(ConfigError::UninitializedEmbedded {
        field: field.to_string(),
    })
}

impl<R> std::fmt::Debug for FieldDef<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldDef")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("tags", &self.tags)
            .field("kind", &self.kind)
            .field("type_name", &self.type_name)
            .field("nullable", &self.nullable)
            .finish_non_exhaustive()
    }
}
