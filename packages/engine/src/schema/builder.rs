use std::collections::HashSet;
use std::sync::Arc;

use crate::error::DbError;
use crate::query::Query;
use crate::types::Value;

use super::{
    hlc_shadow_column, is_valid_identifier, schema_mismatch, Column, Key, KeyKind, LogicalType,
    Schema, Table, View, SYSTEM_CREATED_AT, SYSTEM_ID, SYSTEM_VERSION,
};

/// Fluent, purely in-memory schema construction.
///
/// ```
/// # use tidemark_engine::Schema;
/// let schema = Schema::builder()
///     .version(1)
///     .table("users", |t| {
///         t.guid("id");
///         t.text("name").lww().not_null();
///         t.integer("age").min(0.0);
///         t.key(&["id"]).unique();
///     })
///     .build()
///     .unwrap();
/// assert!(schema.table("users").is_some());
/// ```
pub struct SchemaBuilder {
    version: u32,
    tables: Vec<TableBuilder>,
    views: Vec<View>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self {
            version: 1,
            tables: Vec::new(),
            views: Vec::new(),
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn table(mut self, name: impl Into<String>, body: impl FnOnce(&mut TableBuilder)) -> Self {
        let mut table = TableBuilder::new(name.into());
        body(&mut table);
        self.tables.push(table);
        self
    }

    pub fn view(mut self, name: impl Into<String>, query: Query) -> Self {
        self.views.push(View {
            name: name.into(),
            query,
        });
        self
    }

    pub fn build(self) -> Result<Schema, DbError> {
        let mut tables = Vec::with_capacity(self.tables.len());
        for table in self.tables {
            tables.push(table.finish()?);
        }

        let mut seen = HashSet::new();
        for table in &tables {
            if !seen.insert(table.name.as_str()) {
                return Err(schema_mismatch(format!(
                    "duplicate table name {:?}",
                    table.name
                )));
            }
        }
        for view in &self.views {
            if !is_valid_identifier(&view.name) {
                return Err(schema_mismatch(format!(
                    "invalid view name {:?}",
                    view.name
                )));
            }
            if !seen.insert(view.name.as_str()) {
                return Err(schema_mismatch(format!(
                    "view name {:?} collides with another table or view",
                    view.name
                )));
            }
        }

        Ok(Schema {
            version: self.version,
            tables,
            views: self.views,
        })
    }
}

impl Default for SchemaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TableBuilder {
    name: String,
    columns: Vec<Column>,
    keys: Vec<KeyBuilder>,
}

impl TableBuilder {
    fn new(name: String) -> Self {
        Self {
            name,
            columns: Vec::new(),
            keys: Vec::new(),
        }
    }

    pub fn guid(&mut self, name: impl Into<String>) -> ColumnBuilder<'_> {
        self.column(name, LogicalType::Guid)
    }

    pub fn text(&mut self, name: impl Into<String>) -> ColumnBuilder<'_> {
        self.column(name, LogicalType::Text)
    }

    pub fn integer(&mut self, name: impl Into<String>) -> ColumnBuilder<'_> {
        self.column(name, LogicalType::Integer)
    }

    pub fn real(&mut self, name: impl Into<String>) -> ColumnBuilder<'_> {
        self.column(name, LogicalType::Real)
    }

    pub fn date(&mut self, name: impl Into<String>) -> ColumnBuilder<'_> {
        self.column(name, LogicalType::Date)
    }

    pub fn fileset(&mut self, name: impl Into<String>) -> ColumnBuilder<'_> {
        self.column(name, LogicalType::Fileset)
    }

    pub fn key(&mut self, columns: &[&str]) -> &mut KeyBuilder {
        self.keys.push(KeyBuilder {
            columns: columns.iter().map(|column| column.to_string()).collect(),
            kind: KeyKind::Indexed,
        });
        self.keys.last_mut().unwrap()
    }

    fn column(&mut self, name: impl Into<String>, logical: LogicalType) -> ColumnBuilder<'_> {
        self.columns.push(Column::new(name, logical));
        ColumnBuilder {
            column: self.columns.last_mut().unwrap(),
        }
    }

    /// Derives system columns and LWW shadow columns, synthesizes the
    /// primary key when none was declared, and validates the result.
    fn finish(self) -> Result<Table, DbError> {
        if !is_valid_identifier(&self.name) || self.name.starts_with("__") {
            return Err(schema_mismatch(format!(
                "invalid table name {:?}",
                self.name
            )));
        }

        let mut columns = Vec::with_capacity(self.columns.len() + 5);
        columns.push(system_column(SYSTEM_ID, LogicalType::Guid));
        columns.push(system_column(SYSTEM_CREATED_AT, LogicalType::Hlc));
        columns.push(system_column(SYSTEM_VERSION, LogicalType::Hlc));
        for column in &self.columns {
            if is_valid_identifier(&column.name)
                && !column.name.starts_with("system_")
                && !column.name.ends_with("__hlc")
            {
                continue;
            }
            return Err(schema_mismatch(format!(
                "invalid column name {:?} in table {:?}",
                column.name, self.name
            )));
        }
        columns.extend(self.columns.iter().cloned());
        for column in &self.columns {
            if column.lww {
                columns.push(Column::new(hlc_shadow_column(&column.name), LogicalType::Hlc));
            }
        }

        let mut seen = HashSet::new();
        for column in &columns {
            if !seen.insert(column.name.as_str()) {
                return Err(schema_mismatch(format!(
                    "duplicate column name {:?} in table {:?}",
                    column.name, self.name
                )));
            }
        }

        let mut keys: Vec<Key> = self
            .keys
            .into_iter()
            .map(|key| Key {
                columns: key.columns,
                kind: key.kind,
            })
            .collect();

        let primary_count = keys
            .iter()
            .filter(|key| key.kind == KeyKind::Primary)
            .count();
        if primary_count > 1 {
            return Err(schema_mismatch(format!(
                "table {:?} declares more than one primary key",
                self.name
            )));
        }
        if primary_count == 0 {
            keys.push(Key {
                columns: vec![SYSTEM_ID.to_string()],
                kind: KeyKind::Primary,
            });
        }

        for key in &keys {
            if key.columns.is_empty() {
                return Err(schema_mismatch(format!(
                    "empty key column list in table {:?}",
                    self.name
                )));
            }
            for column in &key.columns {
                if !columns.iter().any(|c| &c.name == column) {
                    return Err(schema_mismatch(format!(
                        "key references missing column {:?} in table {:?}",
                        column, self.name
                    )));
                }
            }
        }

        Ok(Table {
            name: self.name,
            columns,
            keys,
            is_system: false,
        })
    }
}

fn system_column(name: &str, logical: LogicalType) -> Column {
    let mut column = Column::new(name, logical);
    column.not_null = true;
    column
}

pub struct ColumnBuilder<'a> {
    column: &'a mut Column,
}

impl ColumnBuilder<'_> {
    pub fn not_null(&mut self) -> &mut Self {
        self.column.not_null = true;
        self
    }

    /// Marks the column for per-column Last-Writer-Wins merge; a shadow
    /// `<name>__hlc` column is derived automatically.
    pub fn lww(&mut self) -> &mut Self {
        self.column.lww = true;
        self
    }

    /// Relational-tooling hint that this column references a parent row.
    /// No constraint is enforced.
    pub fn parent(&mut self) -> &mut Self {
        self.column.parent = true;
        self
    }

    pub fn max_length(&mut self, length: u32) -> &mut Self {
        self.column.max_length = Some(length);
        self
    }

    pub fn min(&mut self, min: f64) -> &mut Self {
        self.column.min = Some(min);
        self
    }

    pub fn max(&mut self, max: f64) -> &mut Self {
        self.column.max = Some(max);
        self
    }

    pub fn default_to(&mut self, value: Value) -> &mut Self {
        self.column.default = Some(super::DefaultValue::Static(value));
        self
    }

    pub fn default_fn(
        &mut self,
        generate: impl Fn() -> Value + Send + Sync + 'static,
    ) -> &mut Self {
        self.column.default = Some(super::DefaultValue::Generated(Arc::new(generate)));
        self
    }
}

pub struct KeyBuilder {
    columns: Vec<String>,
    kind: KeyKind,
}

impl KeyBuilder {
    pub fn primary(&mut self) -> &mut Self {
        self.kind = KeyKind::Primary;
        self
    }

    pub fn unique(&mut self) -> &mut Self {
        self.kind = KeyKind::Unique;
        self
    }

    pub fn indexed(&mut self) -> &mut Self {
        self.kind = KeyKind::Indexed;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::super::{KeyKind, LogicalType, SYSTEM_ID};
    use super::SchemaBuilder;
    use crate::Value;

    fn users_schema() -> SchemaBuilder {
        SchemaBuilder::new().version(1).table("users", |t| {
            t.guid("id");
            t.text("name").lww();
            t.integer("age").default_to(Value::Integer(0));
            t.key(&["id"]).primary();
        })
    }

    #[test]
    fn tables_receive_system_and_shadow_columns() {
        let schema = users_schema().build().expect("schema should build");
        let users = schema.table("users").expect("users table");

        let names: Vec<&str> = users
            .columns
            .iter()
            .map(|column| column.name.as_str())
            .collect();
        assert_eq!(
            names,
            vec![
                "system_id",
                "system_created_at",
                "system_version",
                "id",
                "name",
                "age",
                "name__hlc",
            ]
        );
        assert_eq!(
            users.column("name__hlc").expect("shadow column").logical,
            LogicalType::Hlc
        );
        assert!(!users.column("name__hlc").unwrap().not_null);
    }

    #[test]
    fn missing_primary_key_defaults_to_system_id() {
        let schema = SchemaBuilder::new()
            .table("notes", |t| {
                t.text("body");
            })
            .build()
            .expect("schema should build");
        let key = schema
            .table("notes")
            .unwrap()
            .primary_key()
            .expect("primary key");
        assert_eq!(key.columns, vec![SYSTEM_ID.to_string()]);
        assert_eq!(key.kind, KeyKind::Primary);
    }

    #[test]
    fn duplicate_primary_keys_are_rejected() {
        let result = SchemaBuilder::new()
            .table("t", |t| {
                t.guid("a");
                t.guid("b");
                t.key(&["a"]).primary();
                t.key(&["b"]).primary();
            })
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn key_referencing_missing_column_is_rejected() {
        let result = SchemaBuilder::new()
            .table("t", |t| {
                t.guid("a");
                t.key(&["missing"]).indexed();
            })
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn reserved_column_names_are_rejected() {
        let result = SchemaBuilder::new()
            .table("t", |t| {
                t.text("system_id");
            })
            .build();
        assert!(result.is_err());

        let result = SchemaBuilder::new()
            .table("t", |t| {
                t.text("name__hlc");
            })
            .build();
        assert!(result.is_err());
    }
}
