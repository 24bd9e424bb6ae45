use std::collections::BTreeSet;

use crate::schema::SchemaProvider;

use super::{ColumnRef, Query, QuerySource, SelectColumn, Where};

/// Structured dependency set of a built query: referenced tables, concrete
/// `(table, column)` pairs, and per-table wildcard markers. Every emitted
/// pair carries a physical table name, never a bare alias.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dependencies {
    pub tables: BTreeSet<String>,
    pub columns: BTreeSet<(String, String)>,
    pub wildcard_tables: BTreeSet<String>,
    pub has_raw_sql: bool,
}

impl Dependencies {
    pub fn uses_wildcard(&self) -> bool {
        !self.wildcard_tables.is_empty()
    }

    pub fn depends_on_table(&self, table: &str) -> bool {
        self.tables.contains(table)
    }

    pub fn depends_on_column(&self, table: &str, column: &str) -> bool {
        self.wildcard_tables.contains(table)
            || self
                .columns
                .contains(&(table.to_string(), column.to_string()))
    }

    fn merge(&mut self, other: Dependencies) {
        self.tables.extend(other.tables);
        self.columns.extend(other.columns);
        self.wildcard_tables.extend(other.wildcard_tables);
        self.has_raw_sql |= other.has_raw_sql;
    }

    fn add_column(&mut self, table: &str, column: &str) {
        self.tables.insert(table.to_string());
        self.columns
            .insert((table.to_string(), column.to_string()));
    }

    fn add_wildcard(&mut self, table: &str) {
        self.tables.insert(table.to_string());
        self.wildcard_tables.insert(table.to_string());
    }
}

/// Computes the dependency set of `query`.
///
/// Raw SQL contributes no structured dependencies; its presence marks every
/// named table as wildcard-watched so invalidation stays conservative.
pub fn analyze(query: &Query, schema: &dyn SchemaProvider) -> Dependencies {
    let mut deps = Dependencies::default();
    let mut context = AnalysisContext::default();
    analyze_query(query, schema, &mut context, &mut deps);

    if deps.has_raw_sql {
        for table in deps.tables.clone() {
            deps.wildcard_tables.insert(table);
        }
    }
    deps
}

/// Stack of name-resolution scopes; the innermost scope wins, matching SQL
/// lexical scoping for correlated subqueries.
#[derive(Default)]
struct AnalysisContext {
    scopes: Vec<Scope>,
}

#[derive(Default)]
struct Scope {
    /// alias-or-table-name → resolved physical table.
    entries: Vec<(String, String)>,
    primary: Option<String>,
}

impl AnalysisContext {
    fn push_scope(&mut self) {
        self.scopes.push(Scope::default());
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn add(&mut self, key: String, table: String) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.entries.push((key, table));
        }
    }

    fn set_primary(&mut self, table: String) {
        if let Some(scope) = self.scopes.last_mut() {
            if scope.primary.is_none() {
                scope.primary = Some(table);
            }
        }
    }

    fn resolve(&self, key: &str) -> Option<&str> {
        self.scopes.iter().rev().find_map(|scope| {
            scope
                .entries
                .iter()
                .find(|(entry_key, _)| entry_key == key)
                .map(|(_, table)| table.as_str())
        })
    }

    fn current_tables(&self) -> &[(String, String)] {
        self.scopes
            .last()
            .map(|scope| scope.entries.as_slice())
            .unwrap_or(&[])
    }

    fn innermost_primary(&self) -> Option<&str> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.primary.as_deref())
    }
}

fn analyze_query(
    query: &Query,
    schema: &dyn SchemaProvider,
    context: &mut AnalysisContext,
    deps: &mut Dependencies,
) {
    context.push_scope();

    let primary = register_source(&query.source, schema, context, deps);
    if let Some(primary) = primary {
        context.set_primary(primary);
    }

    for join in &query.joins {
        register_source(&join.source, schema, context, deps);
    }
    for join in &query.joins {
        if let Some(on) = &join.on {
            analyze_predicate(on, schema, context, deps);
        }
    }

    if query.projection.is_empty() {
        let tables: Vec<String> = context
            .current_tables()
            .iter()
            .map(|(_, table)| table.clone())
            .collect();
        for table in tables {
            deps.add_wildcard(&table);
        }
    }
    for column in &query.projection {
        match column {
            SelectColumn::Column { column, .. } => {
                resolve_column(column, schema, context, deps, false);
            }
            SelectColumn::Aggregate { arg, .. } => {
                // COUNT(*) depends on row visibility only, which the
                // filter columns already cover.
                if !matches!(arg, ColumnRef::Wildcard | ColumnRef::QualifiedWildcard(_)) {
                    resolve_column(arg, schema, context, deps, false);
                }
            }
            SelectColumn::Expression { sql, .. } => {
                for reference in extract_expression_refs(sql) {
                    resolve_column(&reference, schema, context, deps, true);
                }
            }
        }
    }

    if let Some(filter) = &query.filter {
        analyze_predicate(filter, schema, context, deps);
    }
    for column in &query.group_by {
        resolve_column(column, schema, context, deps, false);
    }
    if let Some(having) = &query.having {
        analyze_predicate(having, schema, context, deps);
    }
    for (column, _) in &query.order_by {
        resolve_column(column, schema, context, deps, false);
    }

    context.pop_scope();
}

/// Adds a FROM or JOIN source to the current scope and returns the physical
/// table backing it, if any.
fn register_source(
    source: &QuerySource,
    schema: &dyn SchemaProvider,
    context: &mut AnalysisContext,
    deps: &mut Dependencies,
) -> Option<String> {
    match source {
        QuerySource::Table { name, alias } => {
            let resolved = resolve_base_table(name, schema, deps);
            deps.tables.insert(resolved.clone());
            let key = alias.clone().unwrap_or_else(|| name.clone());
            context.add(key, resolved.clone());
            Some(resolved)
        }
        QuerySource::Subquery { query, alias } => {
            analyze_query(query, schema, context, deps);
            let inner_primary = match &query.source {
                QuerySource::Table { name, .. } => {
                    Some(resolve_base_table(name, schema, &mut Dependencies::default()))
                }
                QuerySource::Subquery { .. } => None,
            };
            if let Some(inner_primary) = inner_primary.clone() {
                context.add(alias.clone(), inner_primary);
            }
            inner_primary
        }
    }
}

/// Resolves a FROM name through view definitions: a view contributes its
/// full dependency set, and references through the view attribute to its
/// primary underlying table.
fn resolve_base_table(name: &str, schema: &dyn SchemaProvider, deps: &mut Dependencies) -> String {
    if schema.table(name).is_some() {
        return name.to_string();
    }
    if let Some(view) = schema.view(name) {
        let view_deps = analyze(&view.query, schema);
        deps.merge(view_deps);
        if let QuerySource::Table {
            name: underlying, ..
        } = &view.query.source
        {
            return resolve_base_table(underlying, schema, deps);
        }
    }
    name.to_string()
}

fn analyze_predicate(
    predicate: &Where,
    schema: &dyn SchemaProvider,
    context: &mut AnalysisContext,
    deps: &mut Dependencies,
) {
    match predicate {
        Where::Compare { column, .. } => resolve_column(column, schema, context, deps, false),
        Where::CompareColumns { left, right, .. } => {
            resolve_column(left, schema, context, deps, false);
            resolve_column(right, schema, context, deps, false);
        }
        Where::IsNull(column) | Where::IsNotNull(column) => {
            resolve_column(column, schema, context, deps, false)
        }
        Where::InList { column, .. } => resolve_column(column, schema, context, deps, false),
        Where::InSubquery { column, query } => {
            resolve_column(column, schema, context, deps, false);
            analyze_query(query, schema, context, deps);
        }
        Where::Exists(query) | Where::NotExists(query) => {
            analyze_query(query, schema, context, deps);
        }
        Where::And(children) | Where::Or(children) => {
            for child in children {
                analyze_predicate(child, schema, context, deps);
            }
        }
        Where::Raw { .. } => {
            deps.has_raw_sql = true;
        }
    }
}

/// Resolves one column reference against the scope stack.
///
/// With `lenient` set (expression extraction), unresolvable references are
/// dropped instead of falling back to the primary table.
fn resolve_column(
    column: &ColumnRef,
    schema: &dyn SchemaProvider,
    context: &mut AnalysisContext,
    deps: &mut Dependencies,
    lenient: bool,
) {
    match column {
        ColumnRef::Wildcard => {
            let tables: Vec<String> = context
                .current_tables()
                .iter()
                .map(|(_, table)| table.clone())
                .collect();
            for table in tables {
                deps.add_wildcard(&table);
            }
        }
        ColumnRef::QualifiedWildcard(table) => {
            let resolved = context
                .resolve(table)
                .unwrap_or(table.as_str())
                .to_string();
            deps.add_wildcard(&resolved);
        }
        ColumnRef::Qualified { table, column } => {
            let resolved = context
                .resolve(table)
                .unwrap_or(table.as_str())
                .to_string();
            deps.add_column(&resolved, column);
        }
        ColumnRef::Simple(column) => {
            let matches: Vec<String> = context
                .current_tables()
                .iter()
                .filter(|(_, table)| {
                    schema
                        .table(table)
                        .is_some_and(|def| def.column(column).is_some())
                })
                .map(|(_, table)| table.clone())
                .collect();
            match matches.as_slice() {
                [single] => deps.add_column(single, column),
                [first, rest @ ..] if rest.iter().all(|table| table == first) => {
                    deps.add_column(first, column)
                }
                _ if lenient => {}
                _ => {
                    if let Some(primary) = context.innermost_primary().map(str::to_string) {
                        deps.add_column(&primary, column);
                    }
                }
            }
        }
    }
}

/// Best-effort column extraction from a free-form SQL expression: dotted
/// identifier pairs and bare identifiers that are not keywords or function
/// calls.
fn extract_expression_refs(sql: &str) -> Vec<ColumnRef> {
    const KEYWORDS: &[&str] = &[
        "select", "from", "where", "and", "or", "not", "null", "is", "in", "like", "case", "when",
        "then", "else", "end", "as", "cast", "distinct", "between", "asc", "desc",
    ];

    let mut refs = Vec::new();
    let bytes = sql.as_bytes();
    let mut index = 0;
    while index < bytes.len() {
        let ch = bytes[index] as char;
        if ch.is_ascii_alphabetic() || ch == '_' {
            let start = index;
            while index < bytes.len()
                && ((bytes[index] as char).is_ascii_alphanumeric() || bytes[index] == b'_')
            {
                index += 1;
            }
            let word = &sql[start..index];

            // Dotted pair: qualified reference.
            if index < bytes.len() && bytes[index] == b'.' {
                let column_start = index + 1;
                let mut column_end = column_start;
                while column_end < bytes.len()
                    && ((bytes[column_end] as char).is_ascii_alphanumeric()
                        || bytes[column_end] == b'_')
                {
                    column_end += 1;
                }
                if column_end > column_start {
                    refs.push(ColumnRef::Qualified {
                        table: word.to_string(),
                        column: sql[column_start..column_end].to_string(),
                    });
                    index = column_end;
                    continue;
                }
            }

            // Function call or keyword: skip.
            let next_non_space = sql[index..].chars().find(|ch| !ch.is_whitespace());
            if next_non_space == Some('(') || KEYWORDS.contains(&word.to_lowercase().as_str()) {
                continue;
            }
            refs.push(ColumnRef::Simple(word.to_string()));
        } else {
            index += 1;
        }
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::super::{Query, Where};
    use super::analyze;
    use crate::schema::SchemaBuilder;
    use crate::{Schema, Value};

    fn test_schema() -> Schema {
        SchemaBuilder::new()
            .table("users", |t| {
                t.guid("id");
                t.text("name");
                t.text("status");
                t.integer("age");
            })
            .table("orders", |t| {
                t.guid("id");
                t.guid("user_id").parent();
                t.integer("total");
            })
            .view(
                "active_users",
                Query::from("users")
                    .select("system_id")
                    .select("name")
                    .filter(Where::eq("status", Value::text("active"))),
            )
            .build()
            .expect("test schema")
    }

    fn pair(table: &str, column: &str) -> (String, String) {
        (table.to_string(), column.to_string())
    }

    #[test]
    fn plain_select_attributes_projection_and_filter_columns() {
        let schema = test_schema();
        let query = Query::from("users")
            .select("name")
            .filter(Where::eq("status", Value::text("active")));
        let deps = analyze(&query, &schema);

        assert!(deps.tables.contains("users"));
        assert!(deps.columns.contains(&pair("users", "name")));
        assert!(deps.columns.contains(&pair("users", "status")));
        assert!(!deps.columns.contains(&pair("users", "age")));
        assert!(!deps.uses_wildcard());
    }

    #[test]
    fn aliases_resolve_to_physical_tables() {
        let schema = test_schema();
        let query = Query::from_alias("users", "u")
            .select("u.name")
            .join_alias("orders", "o", Where::column_eq("o.user_id", "u.id"))
            .select("o.total");
        let deps = analyze(&query, &schema);

        assert!(deps.columns.contains(&pair("users", "name")));
        assert!(deps.columns.contains(&pair("users", "id")));
        assert!(deps.columns.contains(&pair("orders", "user_id")));
        assert!(deps.columns.contains(&pair("orders", "total")));
        // No bare aliases escape the analyzer.
        assert!(deps.columns.iter().all(|(table, _)| table != "u" && table != "o"));
    }

    #[test]
    fn unqualified_column_in_join_resolves_by_schema_lookup() {
        let schema = test_schema();
        let query = Query::from("users")
            .join("orders", Where::column_eq("orders.user_id", "users.id"))
            .select("total");
        let deps = analyze(&query, &schema);
        assert!(deps.columns.contains(&pair("orders", "total")));
    }

    #[test]
    fn ambiguous_column_attributes_to_primary_table() {
        let schema = test_schema();
        // `id` exists in both tables; the FROM table wins.
        let query = Query::from("users")
            .join("orders", Where::column_eq("orders.user_id", "users.id"))
            .select("id");
        let deps = analyze(&query, &schema);
        assert!(deps.columns.contains(&pair("users", "id")));
        assert!(!deps.columns.contains(&pair("orders", "id")));
    }

    #[test]
    fn empty_projection_marks_wildcard_per_table() {
        let schema = test_schema();
        let query = Query::from("users");
        let deps = analyze(&query, &schema);
        assert!(deps.uses_wildcard());
        assert!(deps.wildcard_tables.contains("users"));
    }

    #[test]
    fn subqueries_push_a_fresh_scope() {
        let schema = test_schema();
        let inner = Query::from("orders")
            .select("user_id")
            .filter(Where::gt("total", Value::Integer(100)));
        let query = Query::from("users")
            .select("name")
            .filter(Where::in_subquery("id", inner));
        let deps = analyze(&query, &schema);

        assert!(deps.columns.contains(&pair("users", "id")));
        assert!(deps.columns.contains(&pair("orders", "user_id")));
        assert!(deps.columns.contains(&pair("orders", "total")));
    }

    #[test]
    fn raw_sql_forces_wildcard_on_named_tables() {
        let schema = test_schema();
        let query = Query::from("users")
            .select("name")
            .filter(Where::raw("length(name) > 3", Vec::new()));
        let deps = analyze(&query, &schema);
        assert!(deps.has_raw_sql);
        assert!(deps.wildcard_tables.contains("users"));
    }

    #[test]
    fn view_sources_contribute_underlying_table_dependencies() {
        let schema = test_schema();
        let query = Query::from("active_users").select("name");
        let deps = analyze(&query, &schema);

        assert!(deps.tables.contains("users"));
        assert!(deps.columns.contains(&pair("users", "status")));
        assert!(deps.columns.contains(&pair("users", "name")));
    }

    #[test]
    fn expression_projection_extracts_references_best_effort() {
        let schema = test_schema();
        let query = Query::from("users").select_expr("upper(users.name)", Some("n".into()));
        let deps = analyze(&query, &schema);
        assert!(deps.columns.contains(&pair("users", "name")));
        // The function name itself is not a column.
        assert!(!deps.columns.iter().any(|(_, column)| column == "upper"));
    }
}
