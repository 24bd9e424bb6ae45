use crate::types::Value;

pub mod deps;
mod render;

pub use deps::{analyze, Dependencies};
pub use render::{render_select, render_select_inline};

/// Column reference inside a query. Dotted input (`"u.name"`) parses to a
/// qualified reference; `"*"` and `"t.*"` to wildcards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnRef {
    Simple(String),
    Qualified { table: String, column: String },
    Wildcard,
    QualifiedWildcard(String),
}

impl ColumnRef {
    pub fn parse(input: &str) -> Self {
        if input == "*" {
            return ColumnRef::Wildcard;
        }
        match input.split_once('.') {
            Some((table, "*")) => ColumnRef::QualifiedWildcard(table.to_string()),
            Some((table, column)) => ColumnRef::Qualified {
                table: table.to_string(),
                column: column.to_string(),
            },
            None => ColumnRef::Simple(input.to_string()),
        }
    }

    pub fn column_name(&self) -> Option<&str> {
        match self {
            ColumnRef::Simple(column) => Some(column),
            ColumnRef::Qualified { column, .. } => Some(column),
            ColumnRef::Wildcard | ColumnRef::QualifiedWildcard(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunc {
    pub(crate) fn sql(self) -> &'static str {
        match self {
            AggregateFunc::Count => "COUNT",
            AggregateFunc::Sum => "SUM",
            AggregateFunc::Avg => "AVG",
            AggregateFunc::Min => "MIN",
            AggregateFunc::Max => "MAX",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectColumn {
    Column {
        column: ColumnRef,
        alias: Option<String>,
    },
    Aggregate {
        func: AggregateFunc,
        arg: ColumnRef,
        alias: Option<String>,
    },
    /// Free-form SQL expression. Opaque to rendering; dependency analysis
    /// extracts column references from it best-effort.
    Expression { sql: String, alias: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum QuerySource {
    Table {
        name: String,
        alias: Option<String>,
    },
    Subquery {
        query: Box<Query>,
        alias: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    FullOuter,
    Cross,
}

impl JoinKind {
    pub(crate) fn sql(self) -> &'static str {
        match self {
            JoinKind::Inner => "JOIN",
            JoinKind::Left => "LEFT JOIN",
            JoinKind::Right => "RIGHT JOIN",
            JoinKind::FullOuter => "FULL OUTER JOIN",
            JoinKind::Cross => "CROSS JOIN",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    pub source: QuerySource,
    pub on: Option<Where>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
}

impl CompareOp {
    pub(crate) fn sql(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
            CompareOp::Like => "LIKE",
        }
    }
}

/// Predicate tree for WHERE and HAVING clauses.
#[derive(Debug, Clone, PartialEq)]
pub enum Where {
    Compare {
        column: ColumnRef,
        op: CompareOp,
        value: Value,
    },
    /// Column-to-column comparison, the usual shape of join predicates.
    CompareColumns {
        left: ColumnRef,
        op: CompareOp,
        right: ColumnRef,
    },
    IsNull(ColumnRef),
    IsNotNull(ColumnRef),
    InList {
        column: ColumnRef,
        values: Vec<Value>,
    },
    InSubquery {
        column: ColumnRef,
        query: Box<Query>,
    },
    Exists(Box<Query>),
    NotExists(Box<Query>),
    And(Vec<Where>),
    Or(Vec<Where>),
    /// Opaque SQL fragment. Forces conservative invalidation: any write to
    /// a table the query names re-runs its watches.
    Raw { sql: String, params: Vec<Value> },
}

impl Where {
    pub fn eq(column: &str, value: Value) -> Self {
        Self::compare(column, CompareOp::Eq, value)
    }

    pub fn ne(column: &str, value: Value) -> Self {
        Self::compare(column, CompareOp::Ne, value)
    }

    pub fn gt(column: &str, value: Value) -> Self {
        Self::compare(column, CompareOp::Gt, value)
    }

    pub fn gte(column: &str, value: Value) -> Self {
        Self::compare(column, CompareOp::Gte, value)
    }

    pub fn lt(column: &str, value: Value) -> Self {
        Self::compare(column, CompareOp::Lt, value)
    }

    pub fn lte(column: &str, value: Value) -> Self {
        Self::compare(column, CompareOp::Lte, value)
    }

    pub fn like(column: &str, pattern: impl Into<String>) -> Self {
        Self::compare(column, CompareOp::Like, Value::Text(pattern.into()))
    }

    pub fn column_eq(left: &str, right: &str) -> Self {
        Where::CompareColumns {
            left: ColumnRef::parse(left),
            op: CompareOp::Eq,
            right: ColumnRef::parse(right),
        }
    }

    pub fn is_null(column: &str) -> Self {
        Where::IsNull(ColumnRef::parse(column))
    }

    pub fn is_not_null(column: &str) -> Self {
        Where::IsNotNull(ColumnRef::parse(column))
    }

    pub fn in_list(column: &str, values: Vec<Value>) -> Self {
        Where::InList {
            column: ColumnRef::parse(column),
            values,
        }
    }

    pub fn in_subquery(column: &str, query: Query) -> Self {
        Where::InSubquery {
            column: ColumnRef::parse(column),
            query: Box::new(query),
        }
    }

    pub fn exists(query: Query) -> Self {
        Where::Exists(Box::new(query))
    }

    pub fn not_exists(query: Query) -> Self {
        Where::NotExists(Box::new(query))
    }

    pub fn and(predicates: Vec<Where>) -> Self {
        Where::And(predicates)
    }

    pub fn or(predicates: Vec<Where>) -> Self {
        Where::Or(predicates)
    }

    pub fn raw(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Where::Raw {
            sql: sql.into(),
            params,
        }
    }

    fn compare(column: &str, op: CompareOp, value: Value) -> Self {
        Where::Compare {
            column: ColumnRef::parse(column),
            op,
            value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDirection {
    Asc,
    Desc,
}

/// Structured SELECT assembly. An empty projection renders as `*`.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub projection: Vec<SelectColumn>,
    pub source: QuerySource,
    pub joins: Vec<Join>,
    pub filter: Option<Where>,
    pub group_by: Vec<ColumnRef>,
    pub having: Option<Where>,
    pub order_by: Vec<(ColumnRef, OrderDirection)>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// CRUD-enabled materialization target; see the typed record layer.
    pub for_update: Option<String>,
}

impl Query {
    pub fn from(table: impl Into<String>) -> Self {
        Self::with_source(QuerySource::Table {
            name: table.into(),
            alias: None,
        })
    }

    pub fn from_alias(table: impl Into<String>, alias: impl Into<String>) -> Self {
        Self::with_source(QuerySource::Table {
            name: table.into(),
            alias: Some(alias.into()),
        })
    }

    pub fn from_subquery(query: Query, alias: impl Into<String>) -> Self {
        Self::with_source(QuerySource::Subquery {
            query: Box::new(query),
            alias: alias.into(),
        })
    }

    fn with_source(source: QuerySource) -> Self {
        Self {
            projection: Vec::new(),
            source,
            joins: Vec::new(),
            filter: None,
            group_by: Vec::new(),
            having: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
            for_update: None,
        }
    }

    pub fn select(mut self, column: &str) -> Self {
        self.projection.push(SelectColumn::Column {
            column: ColumnRef::parse(column),
            alias: None,
        });
        self
    }

    pub fn select_as(mut self, column: &str, alias: impl Into<String>) -> Self {
        self.projection.push(SelectColumn::Column {
            column: ColumnRef::parse(column),
            alias: Some(alias.into()),
        });
        self
    }

    pub fn select_expr(mut self, sql: impl Into<String>, alias: Option<String>) -> Self {
        self.projection.push(SelectColumn::Expression {
            sql: sql.into(),
            alias,
        });
        self
    }

    pub fn aggregate(mut self, func: AggregateFunc, column: &str, alias: Option<String>) -> Self {
        self.projection.push(SelectColumn::Aggregate {
            func,
            arg: ColumnRef::parse(column),
            alias,
        });
        self
    }

    pub fn join(self, table: impl Into<String>, on: Where) -> Self {
        self.join_source(JoinKind::Inner, table, None, Some(on))
    }

    pub fn join_alias(self, table: impl Into<String>, alias: impl Into<String>, on: Where) -> Self {
        self.join_source(JoinKind::Inner, table, Some(alias.into()), Some(on))
    }

    pub fn left_join(self, table: impl Into<String>, on: Where) -> Self {
        self.join_source(JoinKind::Left, table, None, Some(on))
    }

    pub fn right_join(self, table: impl Into<String>, on: Where) -> Self {
        self.join_source(JoinKind::Right, table, None, Some(on))
    }

    pub fn full_outer_join(self, table: impl Into<String>, on: Where) -> Self {
        self.join_source(JoinKind::FullOuter, table, None, Some(on))
    }

    pub fn cross_join(self, table: impl Into<String>) -> Self {
        self.join_source(JoinKind::Cross, table, None, None)
    }

    fn join_source(
        mut self,
        kind: JoinKind,
        table: impl Into<String>,
        alias: Option<String>,
        on: Option<Where>,
    ) -> Self {
        self.joins.push(Join {
            kind,
            source: QuerySource::Table {
                name: table.into(),
                alias,
            },
            on,
        });
        self
    }

    /// Adds a predicate, AND-merging with any existing filter.
    pub fn filter(mut self, predicate: Where) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(Where::And(mut children)) => {
                children.push(predicate);
                Where::And(children)
            }
            Some(existing) => Where::And(vec![existing, predicate]),
            None => predicate,
        });
        self
    }

    pub fn group_by(mut self, column: &str) -> Self {
        self.group_by.push(ColumnRef::parse(column));
        self
    }

    pub fn having(mut self, predicate: Where) -> Self {
        self.having = Some(predicate);
        self
    }

    pub fn order_by(mut self, column: &str, direction: OrderDirection) -> Self {
        self.order_by.push((ColumnRef::parse(column), direction));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Tags the query for CRUD-enabled materialization against `target`.
    /// Records constructed from the result may write back to that table
    /// provided the projection surfaces its identity columns.
    pub fn for_update(mut self, target: impl Into<String>) -> Self {
        self.for_update = Some(target.into());
        self
    }

    /// Tables named directly by this query, joins and subqueries included.
    pub fn named_tables(&self) -> Vec<String> {
        let mut tables = Vec::new();
        collect_named_tables(self, &mut tables);
        tables
    }
}

fn collect_named_tables(query: &Query, out: &mut Vec<String>) {
    fn visit_source(source: &QuerySource, out: &mut Vec<String>) {
        match source {
            QuerySource::Table { name, .. } => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            QuerySource::Subquery { query, .. } => collect_named_tables(query, out),
        }
    }
    visit_source(&query.source, out);
    for join in &query.joins {
        visit_source(&join.source, out);
    }
    for predicate in query.filter.iter().chain(query.having.iter()) {
        collect_named_tables_from_where(predicate, out);
    }
}

fn collect_named_tables_from_where(predicate: &Where, out: &mut Vec<String>) {
    match predicate {
        Where::InSubquery { query, .. } | Where::Exists(query) | Where::NotExists(query) => {
            collect_named_tables(query, out)
        }
        Where::And(children) | Where::Or(children) => {
            for child in children {
                collect_named_tables_from_where(child, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::{ColumnRef, Query, Value, Where};

    #[test]
    fn column_ref_parsing() {
        assert_eq!(ColumnRef::parse("name"), ColumnRef::Simple("name".into()));
        assert_eq!(
            ColumnRef::parse("u.name"),
            ColumnRef::Qualified {
                table: "u".into(),
                column: "name".into()
            }
        );
        assert_eq!(ColumnRef::parse("*"), ColumnRef::Wildcard);
        assert_eq!(
            ColumnRef::parse("users.*"),
            ColumnRef::QualifiedWildcard("users".into())
        );
    }

    #[test]
    fn filter_merges_with_and() {
        let query = Query::from("users")
            .filter(Where::eq("a", Value::Integer(1)))
            .filter(Where::eq("b", Value::Integer(2)))
            .filter(Where::eq("c", Value::Integer(3)));
        match query.filter {
            Some(Where::And(children)) => assert_eq!(children.len(), 3),
            other => panic!("expected AND of three predicates, got {other:?}"),
        }
    }

    #[test]
    fn named_tables_cover_joins_and_subqueries() {
        let query = Query::from("orders")
            .join("users", Where::column_eq("users.id", "orders.user_id"))
            .filter(Where::exists(Query::from("audit")));
        assert_eq!(query.named_tables(), vec!["orders", "users", "audit"]);
    }
}
