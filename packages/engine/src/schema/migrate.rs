use std::collections::BTreeMap;

use crate::backend::StorageBackend;
use crate::error::{DbError, MigrationFailureKind};
use crate::query::render_select_inline;
use crate::types::Value;

use super::{dirty_rows_table, files_table, DefaultValue, Key, KeyKind, Schema, Table, View};

/// Introspected physical state: tables with their column names, explicitly
/// created indexes, and view definitions as stored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhysicalSchema {
    pub tables: BTreeMap<String, PhysicalTable>,
    pub indexes: BTreeMap<String, PhysicalIndex>,
    pub views: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhysicalTable {
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalIndex {
    pub table: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

/// Introspects, plans and applies in one step. Running against an
/// up-to-date database executes nothing.
pub async fn migrate(backend: &dyn StorageBackend, schema: &Schema) -> Result<(), DbError> {
    let physical = introspect(backend).await?;
    let statements = plan(schema, &physical)?;
    if statements.is_empty() {
        tracing::debug!("schema is up to date");
        return Ok(());
    }
    apply(backend, &statements).await
}

/// Reads the physical schema through `sqlite_master` and the table PRAGMAs.
pub async fn introspect(backend: &dyn StorageBackend) -> Result<PhysicalSchema, DbError> {
    let mut physical = PhysicalSchema::default();

    let master = backend
        .execute(
            "SELECT name, type, sql FROM sqlite_master WHERE name NOT LIKE 'sqlite_%'",
            &[],
        )
        .await?;

    let mut table_names = Vec::new();
    for row in &master.rows {
        let name = row_text(row, "name")?;
        match row_text(row, "type")?.as_str() {
            "table" => table_names.push(name),
            "view" => {
                let sql = row
                    .get("sql")
                    .and_then(Value::as_text)
                    .unwrap_or_default()
                    .to_string();
                physical.views.insert(name, sql);
            }
            _ => {}
        }
    }

    for table in table_names {
        let info = backend
            .execute(&format!("PRAGMA table_info({table})"), &[])
            .await?;
        let columns = info
            .rows
            .iter()
            .map(|row| row_text(row, "name"))
            .collect::<Result<Vec<_>, _>>()?;
        physical
            .tables
            .insert(table.clone(), PhysicalTable { columns });

        let index_list = backend
            .execute(&format!("PRAGMA index_list({table})"), &[])
            .await?;
        for row in &index_list.rows {
            let index_name = row_text(row, "name")?;
            // Only explicitly created indexes participate in
            // reconciliation; implicit pk/unique autoindexes stay as-is.
            if row.get("origin").and_then(Value::as_text) != Some("c") {
                continue;
            }
            let unique = row
                .get("unique")
                .and_then(Value::as_integer)
                .unwrap_or(0)
                != 0;
            let info = backend
                .execute(&format!("PRAGMA index_info({index_name})"), &[])
                .await?;
            // Expression indexes report NULL column names; they are never
            // ours, so they stay out of reconciliation.
            let columns: Option<Vec<String>> = info
                .rows
                .iter()
                .map(|row| {
                    row.get("name")
                        .and_then(Value::as_text)
                        .map(str::to_string)
                })
                .collect();
            let Some(columns) = columns else {
                continue;
            };
            physical.indexes.insert(
                index_name,
                PhysicalIndex {
                    table: table.clone(),
                    columns,
                    unique,
                },
            );
        }
    }

    Ok(physical)
}

/// Diffs the declared schema against the introspected physical state and
/// emits ordered DDL. Pure: no storage access. Absent-physically tables and
/// columns are created; extra physical columns are retained (no destructive
/// drops); indexes reconcile by (name, columns, uniqueness); views are
/// dropped and recreated when their rendered SQL differs.
pub fn plan(schema: &Schema, physical: &PhysicalSchema) -> Result<Vec<String>, DbError> {
    let mut statements = Vec::new();

    let mut tables: Vec<Table> = schema.tables.clone();
    if schema.has_fileset_columns() {
        tables.push(files_table());
    }
    tables.push(dirty_rows_table());

    for table in &tables {
        match physical.tables.get(&table.name) {
            None => {
                statements.push(create_table_sql(table));
                for key in &table.keys {
                    if key.kind != KeyKind::Primary {
                        statements.push(create_index_sql(&table.name, key));
                    }
                }
            }
            Some(existing) => {
                for column in &table.columns {
                    if !existing.columns.contains(&column.name) {
                        statements.push(add_column_sql(&table.name, column));
                    }
                }
                reconcile_indexes(table, physical, &mut statements);
            }
        }
    }

    for view in &schema.views {
        let rendered = create_view_sql(view)?;
        match physical.views.get(&view.name) {
            Some(existing) if *existing == rendered => {}
            Some(_) => {
                statements.push(format!("DROP VIEW {}", view.name));
                statements.push(rendered);
            }
            None => statements.push(rendered),
        }
    }

    Ok(statements)
}

/// Applies the planned DDL inside one transaction; any failure rolls the
/// whole migration back and the schema is considered unchanged.
pub async fn apply(backend: &dyn StorageBackend, statements: &[String]) -> Result<(), DbError> {
    let mut tx = backend.begin_transaction().await?;
    let result = async {
        for statement in statements {
            tracing::debug!(ddl = %statement, "applying migration step");
            tx.execute(statement, &[]).await?;
        }
        Ok::<(), DbError>(())
    }
    .await;

    match result {
        Ok(()) => {
            tx.commit().await?;
            tracing::info!(statements = statements.len(), "schema migration applied");
            Ok(())
        }
        Err(err) => {
            let _ = tx.rollback().await;
            Err(DbError::Migration {
                kind: MigrationFailureKind::SchemaMismatch,
                message: format!("migration DDL failed, rolled back: {err}"),
            })
        }
    }
}

fn create_table_sql(table: &Table) -> String {
    let mut parts: Vec<String> = table
        .columns
        .iter()
        .map(|column| {
            let mut part = format!("{} {}", column.name, column.logical.physical().sql());
            if column.not_null {
                part.push_str(" NOT NULL");
            }
            part
        })
        .collect();
    if let Some(primary) = table.primary_key() {
        parts.push(format!("PRIMARY KEY ({})", primary.columns.join(", ")));
    }
    format!("CREATE TABLE {} ({})", table.name, parts.join(", "))
}

fn add_column_sql(table: &str, column: &super::Column) -> String {
    let mut sql = format!(
        "ALTER TABLE {table} ADD COLUMN {} {}",
        column.name,
        column.logical.physical().sql()
    );
    // SQLite requires a default when adding NOT NULL to a populated table;
    // without a static default the column is added nullable and the write
    // path enforces the constraint.
    if column.not_null {
        if let Some(DefaultValue::Static(value)) = &column.default {
            if let Some(literal) = static_literal(value) {
                sql.push_str(&format!(" NOT NULL DEFAULT {literal}"));
            }
        }
    }
    sql
}

fn create_index_sql(table: &str, key: &Key) -> String {
    let unique = if key.kind == KeyKind::Unique {
        "UNIQUE "
    } else {
        ""
    };
    format!(
        "CREATE {unique}INDEX {} ON {table} ({})",
        index_name(table, key),
        key.columns.join(", ")
    )
}

fn create_view_sql(view: &View) -> Result<String, DbError> {
    Ok(format!(
        "CREATE VIEW {} AS {}",
        view.name,
        render_select_inline(&view.query)?
    ))
}

fn reconcile_indexes(table: &Table, physical: &PhysicalSchema, statements: &mut Vec<String>) {
    let mut declared: BTreeMap<String, &Key> = BTreeMap::new();
    for key in &table.keys {
        if key.kind != KeyKind::Primary {
            declared.insert(index_name(&table.name, key), key);
        }
    }

    for (name, key) in &declared {
        match physical.indexes.get(name) {
            Some(existing)
                if existing.table == table.name
                    && existing.columns == key.columns
                    && existing.unique == (key.kind == KeyKind::Unique) => {}
            Some(_) => {
                statements.push(format!("DROP INDEX {name}"));
                statements.push(create_index_sql(&table.name, key));
            }
            None => statements.push(create_index_sql(&table.name, key)),
        }
    }

    // Generated-name indexes on this table that are no longer declared.
    for (name, index) in &physical.indexes {
        if index.table == table.name
            && is_generated_index_name(name, &table.name)
            && !declared.contains_key(name)
        {
            statements.push(format!("DROP INDEX {name}"));
        }
    }
}

fn index_name(table: &str, key: &Key) -> String {
    let prefix = match key.kind {
        KeyKind::Unique => "uq",
        _ => "idx",
    };
    format!("{prefix}_{table}_{}", key.columns.join("_"))
}

fn is_generated_index_name(name: &str, table: &str) -> bool {
    name.starts_with(&format!("idx_{table}_")) || name.starts_with(&format!("uq_{table}_"))
}

fn static_literal(value: &Value) -> Option<String> {
    match value.clone().into_storage() {
        Value::Null => Some("NULL".to_string()),
        Value::Integer(value) => Some(value.to_string()),
        Value::Real(value) => Some(value.to_string()),
        Value::Text(text) => Some(format!("'{}'", text.replace('\'', "''"))),
        _ => None,
    }
}

fn row_text(row: &crate::types::Row, column: &str) -> Result<String, DbError> {
    row.get(column)
        .and_then(Value::as_text)
        .map(str::to_string)
        .ok_or_else(|| {
            DbError::invalid_data(format!("introspection row missing column {column:?}"))
        })
}

#[cfg(test)]
mod tests {
    use super::super::SchemaBuilder;
    use super::{plan, PhysicalIndex, PhysicalSchema, PhysicalTable};
    use crate::query::{Query, Where};
    use crate::Value;

    fn schema() -> crate::Schema {
        SchemaBuilder::new()
            .table("users", |t| {
                t.guid("id");
                t.text("name").lww();
                t.integer("age");
                t.key(&["id"]).unique();
            })
            .view(
                "adults",
                Query::from("users")
                    .select("name")
                    .filter(Where::gte("age", Value::Integer(18))),
            )
            .build()
            .expect("schema")
    }

    fn physical_for(schema: &crate::Schema) -> PhysicalSchema {
        let mut physical = PhysicalSchema::default();
        let users = schema.table("users").unwrap();
        physical.tables.insert(
            "users".to_string(),
            PhysicalTable {
                columns: users.columns.iter().map(|c| c.name.clone()).collect(),
            },
        );
        physical.tables.insert(
            "__dirty_rows".to_string(),
            PhysicalTable {
                columns: super::dirty_rows_table()
                    .columns
                    .iter()
                    .map(|c| c.name.clone())
                    .collect(),
            },
        );
        physical.indexes.insert(
            "uq_users_id".to_string(),
            PhysicalIndex {
                table: "users".to_string(),
                columns: vec!["id".to_string()],
                unique: true,
            },
        );
        physical.views.insert(
            "adults".to_string(),
            "CREATE VIEW adults AS SELECT name FROM users WHERE age >= 18".to_string(),
        );
        physical
    }

    #[test]
    fn fresh_database_creates_tables_indexes_and_views() {
        let schema = schema();
        let statements = plan(&schema, &PhysicalSchema::default()).expect("plan");

        assert!(statements
            .iter()
            .any(|sql| sql.starts_with("CREATE TABLE users (system_id TEXT NOT NULL")));
        assert!(statements
            .iter()
            .any(|sql| sql == "CREATE UNIQUE INDEX uq_users_id ON users (id)"));
        assert!(statements
            .iter()
            .any(|sql| sql.starts_with("CREATE TABLE __dirty_rows")));
        assert!(statements
            .iter()
            .any(|sql| sql == "CREATE VIEW adults AS SELECT name FROM users WHERE age >= 18"));
        // No fileset columns declared, so no metadata table.
        assert!(!statements.iter().any(|sql| sql.contains("__files")));
    }

    #[test]
    fn up_to_date_database_plans_nothing() {
        let schema = schema();
        let physical = physical_for(&schema);
        let statements = plan(&schema, &physical).expect("plan");
        assert_eq!(statements, Vec::<String>::new());
    }

    #[test]
    fn missing_column_is_added_without_touching_the_rest() {
        let schema = schema();
        let mut physical = physical_for(&schema);
        physical
            .tables
            .get_mut("users")
            .unwrap()
            .columns
            .retain(|column| column != "age");

        let statements = plan(&schema, &physical).expect("plan");
        assert_eq!(statements, vec!["ALTER TABLE users ADD COLUMN age INTEGER"]);
    }

    #[test]
    fn changed_view_is_dropped_and_recreated() {
        let schema = schema();
        let mut physical = physical_for(&schema);
        physical.views.insert(
            "adults".to_string(),
            "CREATE VIEW adults AS SELECT name FROM users".to_string(),
        );

        let statements = plan(&schema, &physical).expect("plan");
        assert_eq!(
            statements,
            vec![
                "DROP VIEW adults".to_string(),
                "CREATE VIEW adults AS SELECT name FROM users WHERE age >= 18".to_string(),
            ]
        );
    }

    #[test]
    fn index_with_changed_uniqueness_is_rebuilt() {
        let schema = schema();
        let mut physical = physical_for(&schema);
        physical.indexes.insert(
            "uq_users_id".to_string(),
            PhysicalIndex {
                table: "users".to_string(),
                columns: vec!["id".to_string()],
                unique: false,
            },
        );

        let statements = plan(&schema, &physical).expect("plan");
        assert_eq!(
            statements,
            vec![
                "DROP INDEX uq_users_id".to_string(),
                "CREATE UNIQUE INDEX uq_users_id ON users (id)".to_string(),
            ]
        );
    }

    #[test]
    fn undeclared_generated_index_is_dropped() {
        let schema = schema();
        let mut physical = physical_for(&schema);
        physical.indexes.insert(
            "idx_users_age".to_string(),
            PhysicalIndex {
                table: "users".to_string(),
                columns: vec!["age".to_string()],
                unique: false,
            },
        );

        let statements = plan(&schema, &physical).expect("plan");
        assert_eq!(statements, vec!["DROP INDEX idx_users_age".to_string()]);
    }

    #[test]
    fn fileset_columns_pull_in_the_files_table() {
        let schema = SchemaBuilder::new()
            .table("docs", |t| {
                t.text("title");
                t.fileset("attachments");
            })
            .build()
            .expect("schema");
        let statements = plan(&schema, &PhysicalSchema::default()).expect("plan");
        assert!(statements
            .iter()
            .any(|sql| sql.starts_with("CREATE TABLE __files")));
    }
}
