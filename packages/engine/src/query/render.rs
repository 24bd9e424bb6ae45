use crate::error::DbError;
use crate::types::Value;

use super::{ColumnRef, OrderDirection, Query, QuerySource, SelectColumn, Where};

/// Renders a query to parameterized SQL plus its positional parameter
/// vector. Parameters are lowered to their physical storage form.
pub fn render_select(query: &Query) -> Result<(String, Vec<Value>), DbError> {
    let mut renderer = Renderer {
        params: Some(Vec::new()),
    };
    let sql = renderer.query(query)?;
    Ok((sql, renderer.params.unwrap_or_default()))
}

/// Renders a query with all values inlined as SQL literals. Used for view
/// definitions, which cannot carry placeholders.
pub fn render_select_inline(query: &Query) -> Result<String, DbError> {
    let mut renderer = Renderer { params: None };
    renderer.query(query)
}

struct Renderer {
    /// `Some` collects positional parameters; `None` inlines literals.
    params: Option<Vec<Value>>,
}

impl Renderer {
    fn query(&mut self, query: &Query) -> Result<String, DbError> {
        let mut sql = String::from("SELECT ");
        sql.push_str(&self.projection(&query.projection)?);
        sql.push_str(" FROM ");
        sql.push_str(&self.source(&query.source)?);

        for join in &query.joins {
            sql.push(' ');
            sql.push_str(join.kind.sql());
            sql.push(' ');
            sql.push_str(&self.source(&join.source)?);
            if let Some(on) = &join.on {
                sql.push_str(" ON ");
                sql.push_str(&self.predicate(on)?);
            }
        }

        if let Some(filter) = &query.filter {
            sql.push_str(" WHERE ");
            sql.push_str(&self.predicate(filter)?);
        }

        if !query.group_by.is_empty() {
            sql.push_str(" GROUP BY ");
            let columns: Vec<String> = query.group_by.iter().map(column_ref).collect();
            sql.push_str(&columns.join(", "));
        }

        if let Some(having) = &query.having {
            sql.push_str(" HAVING ");
            sql.push_str(&self.predicate(having)?);
        }

        if !query.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            let terms: Vec<String> = query
                .order_by
                .iter()
                .map(|(column, direction)| {
                    let direction = match direction {
                        OrderDirection::Asc => "ASC",
                        OrderDirection::Desc => "DESC",
                    };
                    format!("{} {direction}", column_ref(column))
                })
                .collect();
            sql.push_str(&terms.join(", "));
        }

        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = query.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }

        Ok(sql)
    }

    fn projection(&mut self, projection: &[SelectColumn]) -> Result<String, DbError> {
        if projection.is_empty() {
            return Ok("*".to_string());
        }
        let mut rendered = Vec::with_capacity(projection.len());
        for column in projection {
            rendered.push(match column {
                SelectColumn::Column { column, alias } => {
                    with_alias(column_ref(column), alias.as_deref())
                }
                SelectColumn::Aggregate { func, arg, alias } => with_alias(
                    format!("{}({})", func.sql(), column_ref(arg)),
                    alias.as_deref(),
                ),
                SelectColumn::Expression { sql, alias } => {
                    with_alias(sql.clone(), alias.as_deref())
                }
            });
        }
        Ok(rendered.join(", "))
    }

    fn source(&mut self, source: &QuerySource) -> Result<String, DbError> {
        Ok(match source {
            QuerySource::Table { name, alias } => match alias {
                Some(alias) => format!("{name} AS {alias}"),
                None => name.clone(),
            },
            QuerySource::Subquery { query, alias } => {
                format!("({}) AS {alias}", self.query(query)?)
            }
        })
    }

    fn predicate(&mut self, predicate: &Where) -> Result<String, DbError> {
        Ok(match predicate {
            Where::Compare { column, op, value } => {
                format!("{} {} {}", column_ref(column), op.sql(), self.value(value)?)
            }
            Where::CompareColumns { left, op, right } => {
                format!("{} {} {}", column_ref(left), op.sql(), column_ref(right))
            }
            Where::IsNull(column) => format!("{} IS NULL", column_ref(column)),
            Where::IsNotNull(column) => format!("{} IS NOT NULL", column_ref(column)),
            Where::InList { column, values } => {
                if values.is_empty() {
                    // An empty IN list never matches.
                    return Ok("1 = 0".to_string());
                }
                let rendered: Result<Vec<String>, DbError> =
                    values.iter().map(|value| self.value(value)).collect();
                format!("{} IN ({})", column_ref(column), rendered?.join(", "))
            }
            Where::InSubquery { column, query } => {
                format!("{} IN ({})", column_ref(column), self.query(query)?)
            }
            Where::Exists(query) => format!("EXISTS ({})", self.query(query)?),
            Where::NotExists(query) => format!("NOT EXISTS ({})", self.query(query)?),
            Where::And(children) => self.logical("AND", children)?,
            Where::Or(children) => self.logical("OR", children)?,
            Where::Raw { sql, params } => {
                match &mut self.params {
                    Some(collected) => {
                        collected.extend(params.iter().cloned().map(Value::into_storage));
                    }
                    None if !params.is_empty() => {
                        return Err(DbError::invalid_query(
                            "raw SQL with parameters cannot appear in a view definition",
                        ));
                    }
                    None => {}
                }
                format!("({sql})")
            }
        })
    }

    fn logical(&mut self, op: &str, children: &[Where]) -> Result<String, DbError> {
        if children.is_empty() {
            return Err(DbError::invalid_query(format!(
                "{op} requires at least one predicate"
            )));
        }
        if children.len() == 1 {
            return self.predicate(&children[0]);
        }
        let rendered: Result<Vec<String>, DbError> = children
            .iter()
            .map(|child| Ok(format!("({})", self.predicate(child)?)))
            .collect();
        Ok(rendered?.join(&format!(" {op} ")))
    }

    fn value(&mut self, value: &Value) -> Result<String, DbError> {
        match &mut self.params {
            Some(params) => {
                params.push(value.clone().into_storage());
                Ok("?".to_string())
            }
            None => literal(value),
        }
    }
}

fn with_alias(rendered: String, alias: Option<&str>) -> String {
    match alias {
        Some(alias) => format!("{rendered} AS {alias}"),
        None => rendered,
    }
}

fn column_ref(column: &ColumnRef) -> String {
    match column {
        ColumnRef::Simple(name) => name.clone(),
        ColumnRef::Qualified { table, column } => format!("{table}.{column}"),
        ColumnRef::Wildcard => "*".to_string(),
        ColumnRef::QualifiedWildcard(table) => format!("{table}.*"),
    }
}

fn literal(value: &Value) -> Result<String, DbError> {
    Ok(match value.clone().into_storage() {
        Value::Null => "NULL".to_string(),
        Value::Integer(value) => value.to_string(),
        Value::Real(value) => value.to_string(),
        Value::Text(text) => format!("'{}'", text.replace('\'', "''")),
        Value::Blob(_) => {
            return Err(DbError::invalid_query(
                "blob literals cannot be inlined into SQL",
            ))
        }
        // into_storage only produces the physical subset.
        _ => unreachable!("logical value survived storage lowering"),
    })
}

#[cfg(test)]
mod tests {
    use super::super::{AggregateFunc, OrderDirection, Query, Where};
    use super::{render_select, render_select_inline};
    use crate::Value;

    #[test]
    fn renders_plain_select_with_parameters() {
        let query = Query::from("users")
            .select("name")
            .filter(Where::eq("status", Value::text("active")))
            .order_by("name", OrderDirection::Asc)
            .limit(10);

        let (sql, params) = render_select(&query).expect("render");
        assert_eq!(
            sql,
            "SELECT name FROM users WHERE status = ? ORDER BY name ASC LIMIT 10"
        );
        assert_eq!(params, vec![Value::text("active")]);
    }

    #[test]
    fn empty_projection_renders_wildcard() {
        let (sql, params) = render_select(&Query::from("users")).expect("render");
        assert_eq!(sql, "SELECT * FROM users");
        assert!(params.is_empty());
    }

    #[test]
    fn joins_and_aggregates_render_in_order() {
        let query = Query::from_alias("orders", "o")
            .select("o.user_id")
            .aggregate(AggregateFunc::Count, "*", Some("n".to_string()))
            .left_join("users", Where::column_eq("users.id", "o.user_id"))
            .group_by("o.user_id")
            .having(Where::gt("n", Value::Integer(1)));

        let (sql, params) = render_select(&query).expect("render");
        assert_eq!(
            sql,
            "SELECT o.user_id, COUNT(*) AS n FROM orders AS o \
             LEFT JOIN users ON users.id = o.user_id \
             GROUP BY o.user_id HAVING n > ?"
        );
        assert_eq!(params, vec![Value::Integer(1)]);
    }

    #[test]
    fn subqueries_nest_with_their_parameters_in_order() {
        let inner = Query::from("orders")
            .select("user_id")
            .filter(Where::gt("total", Value::Integer(100)));
        let query = Query::from("users")
            .select("name")
            .filter(Where::eq("status", Value::text("active")))
            .filter(Where::in_subquery("id", inner));

        let (sql, params) = render_select(&query).expect("render");
        assert_eq!(
            sql,
            "SELECT name FROM users WHERE (status = ?) AND \
             (id IN (SELECT user_id FROM orders WHERE total > ?))"
        );
        assert_eq!(params, vec![Value::text("active"), Value::Integer(100)]);
    }

    #[test]
    fn empty_in_list_never_matches() {
        let query = Query::from("users").filter(Where::in_list("id", Vec::new()));
        let (sql, _) = render_select(&query).expect("render");
        assert_eq!(sql, "SELECT * FROM users WHERE 1 = 0");
    }

    #[test]
    fn inline_rendering_quotes_text_literals() {
        let query = Query::from("users")
            .select("name")
            .filter(Where::eq("name", Value::text("O'Brien")));
        let sql = render_select_inline(&query).expect("render");
        assert_eq!(sql, "SELECT name FROM users WHERE name = 'O''Brien'");
    }

    #[test]
    fn raw_sql_passes_through_with_parameters() {
        let query = Query::from("users").filter(Where::raw(
            "length(name) > ?",
            vec![Value::Integer(3)],
        ));
        let (sql, params) = render_select(&query).expect("render");
        assert_eq!(sql, "SELECT * FROM users WHERE (length(name) > ?)");
        assert_eq!(params, vec![Value::Integer(3)]);

        let inline = render_select_inline(&Query::from("users").filter(Where::raw(
            "length(name) > ?",
            vec![Value::Integer(3)],
        )));
        assert!(inline.is_err());
    }
}
