//! Column metadata derived from a record's field definitions.
//!
//! Resolution walks the record's [`FieldDef`]s depth-first, flattening
//! embedded records in declaration order, and produces one [`ColumnMeta`] per
//! mapped column. Fields with well-known column names take on special roles
//! (primary key, row version, timestamps) that drive statement generation.

use std::any::TypeId;
use std::collections::HashSet;

use rowmap_core::{
    Access, ConfigError, Error, FieldDef, FieldKind, Getter, Label, LabelRegistry, Presence, Record,
    Result, Setter, TagRule, TagSet, Value, to_snake_case,
};

/// Special meaning of a column, detected from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRole {
    /// `id`
    PrimaryKey,
    /// `row_version`
    RowVersion,
    /// `created_at`
    CreatedAt,
    /// `updated_at`
    UpdatedAt,
    /// `deleted_at`; its presence makes the table soft-deletable.
    DeletedAt,
    Plain,
}

impl ColumnRole {
    pub fn from_column(column: &str) -> Self {
        match column {
            "id" => ColumnRole::PrimaryKey,
            "row_version" => ColumnRole::RowVersion,
            "created_at" => ColumnRole::CreatedAt,
            "updated_at" => ColumnRole::UpdatedAt,
            "deleted_at" => ColumnRole::DeletedAt,
            _ => ColumnRole::Plain,
        }
    }
}

/// One mapped column.
pub struct ColumnMeta<R> {
    pub column: String,
    /// Dotted field path from the root record
    pub path: String,
    pub kind: FieldKind,
    pub type_name: &'static str,
    pub nullable: bool,
    pub tags: TagSet,
    pub role: ColumnRole,
    get: Getter<R>,
    set: Setter<R>,
}

impl<R> ColumnMeta<R> {
    pub fn read(&self, record: &R) -> Result<Value> {
        (self.get)(record)
    }

    pub fn write(&self, record: &mut R, value: &Value) -> Result<()> {
        (self.set)(record, value)
    }

    pub fn has(&self, label: &Label) -> bool {
        self.tags.contains(label)
    }

    pub fn is_secret(&self) -> bool {
        self.has(&Label::Secret)
    }
}

impl<R> std::fmt::Debug for ColumnMeta<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnMeta")
            .field("column", &self.column)
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("role", &self.role)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

struct EmbedPresence<R> {
    path: String,
    presence: Presence<R>,
}

/// Flattened column layout of a record bound to a table.
pub struct TableMapping<R> {
    table: String,
    columns: Vec<ColumnMeta<R>>,
    embeds: Vec<EmbedPresence<R>>,
    sequence_backed: bool,
}

impl<R: Record> TableMapping<R> {
    /// Resolve the layout of `R` for `table`.
    pub fn resolve(table: &str, registry: &LabelRegistry) -> Result<Self> {
        let mut mapping = Self {
            table: table.to_string(),
            columns: Vec::new(),
            embeds: Vec::new(),
            sequence_backed: false,
        };
        let mut stack = vec![TypeId::of::<R>()];
        mapping.flatten(R::fields(), &TagSet::default(), registry, &mut stack)?;

        let mut seen = HashSet::new();
        for meta in &mapping.columns {
            if !seen.insert(meta.column.as_str()) {
                return Err(ConfigError::DuplicateColumn {
                    table: mapping.table.clone(),
                    column: meta.column.clone(),
                }
                .into());
            }
        }

        mapping.sequence_backed = mapping
            .role(ColumnRole::PrimaryKey)
            .is_some_and(|id| id.kind == FieldKind::Integer && !id.has(&Label::NoSeq));
        Ok(mapping)
    }

    fn flatten(
        &mut self,
        defs: Vec<FieldDef<R>>,
        inherited: &TagSet,
        registry: &LabelRegistry,
        stack: &mut Vec<TypeId>,
    ) -> Result<()> {
        for def in defs {
            let own = TagSet::parse(&def.path, def.tags, registry)?;
            let tags = own.inherit(inherited);
            if tags.is_skip() {
                continue;
            }
            match def.access {
                Access::Column { get, set } => {
                    let column = to_snake_case(def.name);
                    let role = ColumnRole::from_column(&column);
                    self.columns.push(ColumnMeta {
                        column,
                        path: def.path,
                        kind: def.kind,
                        type_name: def.type_name,
                        nullable: def.nullable,
                        tags,
                        role,
                        get,
                        set,
                    });
                }
                Access::Embedded(embedded) => {
                    if stack.contains(&embedded.type_id()) {
                        return Err(ConfigError::CyclicEmbedding {
                            type_name: embedded.type_name().to_string(),
                        }
                        .into());
                    }
                    self.embeds.push(EmbedPresence {
                        path: def.path,
                        presence: embedded.presence(),
                    });
                    stack.push(embedded.type_id());
                    self.flatten(embedded.expand(), &tags, registry, stack)?;
                    stack.pop();
                }
            }
        }
        Ok(())
    }
}

impl<R> TableMapping<R> {
    pub fn table(&self) -> &str {
        &self.table
    }

    /// All mapped columns in declaration order.
    pub fn columns(&self) -> &[ColumnMeta<R>] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&ColumnMeta<R>> {
        self.columns.iter().find(|c| c.column == name)
    }

    pub fn role(&self, role: ColumnRole) -> Option<&ColumnMeta<R>> {
        self.columns.iter().find(|c| c.role == role)
    }

    /// Required role column, or a configuration fault naming it.
    pub fn require(&self, role: ColumnRole, column: &str) -> Result<&ColumnMeta<R>> {
        self.role(role).ok_or_else(|| {
            Error::Config(ConfigError::MissingColumn {
                table: self.table.clone(),
                column: column.to_string(),
            })
        })
    }

    /// The primary key is an integer drawn from `<table>_seq`.
    pub fn is_sequence_backed(&self) -> bool {
        self.sequence_backed
    }

    pub fn is_soft_deletable(&self) -> bool {
        self.role(ColumnRole::DeletedAt).is_some()
    }

    pub fn is_versioned(&self) -> bool {
        self.role(ColumnRole::RowVersion).is_some()
    }

    /// Columns admitted by `rule`, for SELECT lists.
    pub fn select_columns(&self, rule: &TagRule) -> Vec<&ColumnMeta<R>> {
        self.columns.iter().filter(|c| rule.admits(&c.tags)).collect()
    }

    /// Columns for the cached select: everything not tagged `nocache`.
    pub fn cache_columns(&self) -> Vec<&ColumnMeta<R>> {
        self.select_columns(&TagRule::Exclude(vec![Label::NoCache]))
    }

    /// Columns written by INSERT: everything not tagged `noins`.
    pub fn insert_columns(&self) -> Vec<&ColumnMeta<R>> {
        self.select_columns(&TagRule::Exclude(vec![Label::NoIns]))
    }

    /// Columns written by UPDATE from the record: plain columns admitted by
    /// `rule` and not tagged `noupd`, followed by `updated_at` when mapped.
    pub fn update_columns(&self, rule: &TagRule) -> Vec<&ColumnMeta<R>> {
        let mut columns: Vec<_> = self
            .columns
            .iter()
            .filter(|c| c.role == ColumnRole::Plain)
            .filter(|c| !c.has(&Label::NoUpd) && rule.admits(&c.tags))
            .collect();
        if let Some(updated_at) = self.role(ColumnRole::UpdatedAt) {
            columns.push(updated_at);
        }
        columns
    }

    /// Fail when an embedded record on any path is absent from `record`.
    pub fn check_initialized(&self, record: &R) -> Result<()> {
        match self.embeds.iter().find(|e| !(e.presence)(record)) {
            Some(missing) => Err(ConfigError::UninitializedEmbedded {
                field: missing.path.clone(),
            }
            .into()),
            None => Ok(()),
        }
    }

    /// Write a result row into `record`, matching values to columns by name.
    pub fn write_named(&self, record: &mut R, row: &rowmap_core::Row) -> Result<()> {
        for (name, value) in row.iter() {
            let meta = self.column(name).ok_or_else(|| {
                Error::Config(ConfigError::UnknownColumn {
                    table: self.table.clone(),
                    column: name.to_string(),
                })
            })?;
            meta.write(record, value)?;
        }
        Ok(())
    }

    /// Write a result row into `record`, matching values to `columns` by
    /// position.
    pub fn write_positional(
        &self,
        record: &mut R,
        columns: &[&ColumnMeta<R>],
        row: &rowmap_core::Row,
    ) -> Result<()> {
        if row.len() != columns.len() {
            return Err(Error::conversion(format!(
                "table {}: row has {} values for {} selected columns",
                self.table,
                row.len(),
                columns.len()
            )));
        }
        for (meta, value) in columns.iter().zip(row.values()) {
            meta.write(record, value)?;
        }
        Ok(())
    }
}

impl<R> std::fmt::Debug for TableMapping<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableMapping")
            .field("table", &self.table)
            .field("columns", &self.columns)
            .field("sequence_backed", &self.sequence_backed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Record;
    use rowmap_core::Timestamp;

    #[derive(Debug, Default, Clone, Record)]
    pub struct Stamps {
        pub created_at: Timestamp,
        pub updated_at: Timestamp,
        #[rowmap(tags = "nocache")]
        pub deleted_at: Option<Timestamp>,
    }

    #[derive(Debug, Default, Clone, Record)]
    pub struct User {
        pub id: i64,
        #[rowmap(tags = "noupd")]
        pub email: String,
        pub name: String,
        #[rowmap(tags = "secret")]
        pub password: String,
        #[rowmap(skip)]
        pub scratch: String,
        pub row_version: i64,
        #[rowmap(embed, tags = "perms")]
        pub stamps: Stamps,
        local: u8,
    }

    fn registry() -> LabelRegistry {
        LabelRegistry::with_labels(["perms"]).unwrap()
    }

    fn names<R>(columns: &[&ColumnMeta<R>]) -> Vec<String> {
        columns.iter().map(|c| c.column.clone()).collect()
    }

    #[test]
    fn test_flatten_in_declaration_order() {
        let mapping = TableMapping::<User>::resolve("users", &registry()).unwrap();
        let all: Vec<_> = mapping.columns().iter().map(|c| c.column.as_str()).collect();
        assert_eq!(
            all,
            [
                "id",
                "email",
                "name",
                "password",
                "row_version",
                "created_at",
                "updated_at",
                "deleted_at"
            ]
        );
        assert!(mapping.is_sequence_backed());
        assert!(mapping.is_soft_deletable());
        assert!(mapping.is_versioned());
        assert_eq!(
            mapping.column("deleted_at").unwrap().path,
            "stamps.deleted_at"
        );
        let _ = User::default().local;
    }

    #[test]
    fn test_embedded_tags_are_inherited() {
        let mapping = TableMapping::<User>::resolve("users", &registry()).unwrap();
        let rule = TagRule::include("perms").unwrap();
        assert_eq!(
            names(&mapping.select_columns(&rule)),
            ["created_at", "updated_at", "deleted_at"]
        );
    }

    #[test]
    fn test_column_sets() {
        let mapping = TableMapping::<User>::resolve("users", &registry()).unwrap();
        assert_eq!(
            names(&mapping.update_columns(&TagRule::All)),
            ["name", "password", "updated_at"]
        );
        assert!(!names(&mapping.cache_columns()).contains(&"deleted_at".to_string()));
        assert_eq!(mapping.insert_columns().len(), 8);
    }

    #[test]
    fn test_unknown_label_is_config_error() {
        let err = TableMapping::<User>::resolve("users", &LabelRegistry::new()).unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::UnknownLabel { ref label, .. }) if label == "perms"
        ));
    }

    #[derive(Debug, Default, Clone, Record)]
    pub struct Clash {
        pub id: i64,
        #[rowmap(embed)]
        pub inner: Inner,
    }

    #[derive(Debug, Default, Clone, Record)]
    pub struct Inner {
        pub id: i64,
    }

    #[test]
    fn test_duplicate_column_rejected() {
        let err = TableMapping::<Clash>::resolve("clash", &registry()).unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::DuplicateColumn { .. })
        ));
    }

    #[derive(Debug, Default, Clone, Record)]
    pub struct Node {
        pub name: String,
        #[rowmap(embed)]
        pub next: Option<Box<Node>>,
    }

    #[test]
    fn test_cyclic_embedding_rejected() {
        let err = TableMapping::<Node>::resolve("nodes", &registry()).unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::CyclicEmbedding { .. })
        ));
    }

    #[derive(Debug, Default, Clone, Record)]
    pub struct Doc {
        pub id: String,
        #[rowmap(embed)]
        pub audit: Option<Box<Audit>>,
    }

    #[derive(Debug, Default, Clone, Record)]
    pub struct Audit {
        pub created_by: String,
    }

    #[test]
    fn test_uninitialized_embedded_detected() {
        let mapping = TableMapping::<Doc>::resolve("docs", &registry()).unwrap();
        assert!(!mapping.is_sequence_backed());
        let err = mapping.check_initialized(&Doc::default()).unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::UninitializedEmbedded { ref field }) if field == "audit"
        ));
        let doc = Doc {
            id: "a".into(),
            audit: Some(Box::default()),
        };
        assert!(mapping.check_initialized(&doc).is_ok());
    }

    #[test]
    fn test_write_positional_and_named() {
        let mapping = TableMapping::<Doc>::resolve("docs", &registry()).unwrap();
        let mut doc = Doc {
            audit: Some(Box::default()),
            ..Doc::default()
        };
        let columns = mapping.select_columns(&TagRule::All);
        let row = rowmap_core::Row::new(
            vec!["id".into(), "created_by".into()],
            vec![Value::Text("d1".into()), Value::Text("robert".into())],
        );
        mapping.write_positional(&mut doc, &columns, &row).unwrap();
        assert_eq!(doc.id, "d1");
        assert_eq!(doc.audit.as_ref().unwrap().created_by, "robert");

        let returned = rowmap_core::Row::new(vec!["id".into()], vec![Value::Text("d2".into())]);
        mapping.write_named(&mut doc, &returned).unwrap();
        assert_eq!(doc.id, "d2");

        let short = rowmap_core::Row::new(vec!["id".into()], vec![Value::Text("x".into())]);
        assert!(mapping.write_positional(&mut doc, &columns, &short).is_err());
    }
}
