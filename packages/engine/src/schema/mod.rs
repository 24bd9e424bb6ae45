use std::fmt;
use std::sync::Arc;

use crate::error::{DbError, MigrationFailureKind};
use crate::query::Query;
use crate::types::Value;

mod builder;
pub mod migrate;

pub use builder::{ColumnBuilder, KeyBuilder, SchemaBuilder, TableBuilder};

pub const SYSTEM_ID: &str = "system_id";
pub const SYSTEM_CREATED_AT: &str = "system_created_at";
pub const SYSTEM_VERSION: &str = "system_version";
pub const FILES_TABLE: &str = "__files";
pub const DIRTY_ROWS_TABLE: &str = "__dirty_rows";

/// Shadow column carrying the LWW arbitration clock for `column`.
pub fn hlc_shadow_column(column: &str) -> String {
    format!("{column}__hlc")
}

pub fn is_system_column(name: &str) -> bool {
    name.starts_with("system_")
}

pub fn is_hlc_shadow_column(name: &str) -> bool {
    name.ends_with("__hlc")
}

/// Logical column types. Physical storage is derived: `guid`, `date`,
/// `fileset` and `hlc` are stored as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalType {
    Guid,
    Text,
    Integer,
    Real,
    Date,
    Fileset,
    Hlc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysicalType {
    Text,
    Integer,
    Real,
}

impl LogicalType {
    pub fn physical(self) -> PhysicalType {
        match self {
            LogicalType::Integer => PhysicalType::Integer,
            LogicalType::Real => PhysicalType::Real,
            LogicalType::Guid
            | LogicalType::Text
            | LogicalType::Date
            | LogicalType::Fileset
            | LogicalType::Hlc => PhysicalType::Text,
        }
    }
}

impl PhysicalType {
    pub fn sql(self) -> &'static str {
        match self {
            PhysicalType::Text => "TEXT",
            PhysicalType::Integer => "INTEGER",
            PhysicalType::Real => "REAL",
        }
    }
}

/// Column default: a static value or a generator invoked per inserted row.
#[derive(Clone)]
pub enum DefaultValue {
    Static(Value),
    Generated(Arc<dyn Fn() -> Value + Send + Sync>),
}

impl DefaultValue {
    pub fn resolve(&self) -> Value {
        match self {
            DefaultValue::Static(value) => value.clone(),
            DefaultValue::Generated(generate) => generate(),
        }
    }
}

impl fmt::Debug for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultValue::Static(value) => f.debug_tuple("Static").field(value).finish(),
            DefaultValue::Generated(_) => f.write_str("Generated(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub logical: LogicalType,
    pub not_null: bool,
    pub default: Option<DefaultValue>,
    pub lww: bool,
    pub parent: bool,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub max_length: Option<u32>,
}

impl Column {
    pub(crate) fn new(name: impl Into<String>, logical: LogicalType) -> Self {
        Self {
            name: name.into(),
            logical,
            not_null: false,
            default: None,
            lww: false,
            parent: false,
            min: None,
            max: None,
            max_length: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Primary,
    Unique,
    Indexed,
}

#[derive(Debug, Clone)]
pub struct Key {
    pub columns: Vec<String>,
    pub kind: KeyKind,
}

#[derive(Debug, Clone)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    pub keys: Vec<Key>,
    /// System tables (`__files`, `__dirty_rows`) carry no derived columns
    /// and are not journaled.
    pub is_system: bool,
}

impl Table {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|column| column.name == name)
    }

    pub fn primary_key(&self) -> Option<&Key> {
        self.keys.iter().find(|key| key.kind == KeyKind::Primary)
    }

    pub fn lww_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|column| column.lww)
    }

    pub fn fileset_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns
            .iter()
            .filter(|column| column.logical == LogicalType::Fileset)
    }
}

/// A view is a named structured projection rendered to SQL at migration
/// time. Views are read-only unless a query over them is tagged
/// `for_update(target)`.
#[derive(Debug, Clone)]
pub struct View {
    pub name: String,
    pub query: Query,
}

#[derive(Debug, Clone)]
pub struct Schema {
    pub version: u32,
    pub tables: Vec<Table>,
    pub views: Vec<View>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::new()
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|table| table.name == name)
    }

    pub fn view(&self, name: &str) -> Option<&View> {
        self.views.iter().find(|view| view.name == name)
    }

    pub fn has_fileset_columns(&self) -> bool {
        self.tables
            .iter()
            .any(|table| table.fileset_columns().next().is_some())
    }
}

/// Name resolution seam for the dependency analyzer.
pub trait SchemaProvider {
    fn table(&self, name: &str) -> Option<&Table>;
    fn view(&self, name: &str) -> Option<&View>;
}

impl SchemaProvider for Schema {
    fn table(&self, name: &str) -> Option<&Table> {
        Schema::table(self, name)
    }

    fn view(&self, name: &str) -> Option<&View> {
        Schema::view(self, name)
    }
}

/// Metadata table backing fileset columns. Created on first use of a
/// fileset column anywhere in the schema.
pub(crate) fn files_table() -> Table {
    Table {
        name: FILES_TABLE.to_string(),
        columns: vec![
            Column::new("id", LogicalType::Guid),
            Column::new("fileset_id", LogicalType::Guid),
            Column::new("name", LogicalType::Text),
            Column::new("path", LogicalType::Text),
            Column::new("mime_type", LogicalType::Text),
            Column::new("size_bytes", LogicalType::Integer),
        ],
        keys: vec![
            Key {
                columns: vec!["id".to_string()],
                kind: KeyKind::Primary,
            },
            Key {
                columns: vec!["fileset_id".to_string()],
                kind: KeyKind::Indexed,
            },
        ],
        is_system: true,
    }
}

/// Persisted dirty-row journal. Pending mutations must survive restart for
/// offline-first sync, so the journal is an ordinary storage table written
/// in the same transaction as the mutation it records.
pub(crate) fn dirty_rows_table() -> Table {
    Table {
        name: DIRTY_ROWS_TABLE.to_string(),
        columns: vec![
            Column::new("id", LogicalType::Guid),
            Column::new("table_name", LogicalType::Text),
            Column::new("row_id", LogicalType::Guid),
            Column::new("kind", LogicalType::Text),
            Column::new("payload", LogicalType::Text),
            Column::new("hlc", LogicalType::Hlc),
        ],
        keys: vec![
            Key {
                columns: vec!["id".to_string()],
                kind: KeyKind::Primary,
            },
            Key {
                columns: vec!["table_name".to_string(), "row_id".to_string()],
                kind: KeyKind::Indexed,
            },
        ],
        is_system: true,
    }
}

pub(crate) fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

pub(crate) fn schema_mismatch(message: impl Into<String>) -> DbError {
    DbError::Migration {
        kind: MigrationFailureKind::SchemaMismatch,
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::{is_valid_identifier, LogicalType, PhysicalType};

    #[test]
    fn logical_types_map_to_physical_storage() {
        assert_eq!(LogicalType::Guid.physical(), PhysicalType::Text);
        assert_eq!(LogicalType::Date.physical(), PhysicalType::Text);
        assert_eq!(LogicalType::Fileset.physical(), PhysicalType::Text);
        assert_eq!(LogicalType::Hlc.physical(), PhysicalType::Text);
        assert_eq!(LogicalType::Integer.physical(), PhysicalType::Integer);
        assert_eq!(LogicalType::Real.physical(), PhysicalType::Real);
    }

    #[test]
    fn identifier_validation_rejects_sql_specials() {
        assert!(is_valid_identifier("users"));
        assert!(is_valid_identifier("__files"));
        assert!(is_valid_identifier("name__hlc"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("1users"));
        assert!(!is_valid_identifier("users; DROP TABLE"));
        assert!(!is_valid_identifier("user name"));
    }
}
