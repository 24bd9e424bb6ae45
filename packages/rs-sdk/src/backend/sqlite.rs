use async_trait::async_trait;
use rusqlite::{params_from_iter, Connection, ErrorCode};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use tidemark_engine::{
    ConnectionFailureKind, DbError, EngineErrorKind, QueryResult, Row, StorageBackend,
    StorageTransaction, Value,
};

/// `rusqlite`-backed storage engine. The connection is mutex-guarded;
/// transactions hold the guard for their whole lifetime, which serializes
/// writes exactly as the core's concurrency model requires.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

struct SqliteTransaction<'a> {
    conn: MutexGuard<'a, Connection>,
    finalized: bool,
}

impl SqliteBackend {
    pub fn in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory().map_err(map_sqlite_error)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let conn = Connection::open(path).map_err(map_sqlite_error)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Connection {
            kind: ConnectionFailureKind::Unreachable,
            message: "sqlite connection mutex poisoned".to_string(),
        })
    }
}

#[async_trait(?Send)]
impl StorageBackend for SqliteBackend {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<QueryResult, DbError> {
        let conn = self.lock()?;
        execute_sql(&conn, sql, params)
    }

    async fn begin_transaction(&self) -> Result<Box<dyn StorageTransaction + '_>, DbError> {
        let conn = self.lock()?;
        conn.execute_batch("BEGIN IMMEDIATE TRANSACTION")
            .map_err(map_sqlite_error)?;
        Ok(Box::new(SqliteTransaction {
            conn,
            finalized: false,
        }))
    }
}

#[async_trait(?Send)]
impl StorageTransaction for SqliteTransaction<'_> {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult, DbError> {
        execute_sql(&self.conn, sql, params)
    }

    async fn commit(mut self: Box<Self>) -> Result<(), DbError> {
        self.conn.execute_batch("COMMIT").map_err(map_sqlite_error)?;
        self.finalized = true;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), DbError> {
        self.conn
            .execute_batch("ROLLBACK")
            .map_err(map_sqlite_error)?;
        self.finalized = true;
        Ok(())
    }
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if !self.finalized && !std::thread::panicking() {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}

fn execute_sql(conn: &Connection, sql: &str, params: &[Value]) -> Result<QueryResult, DbError> {
    if params.is_empty() && sql.contains(';') {
        conn.execute_batch(sql).map_err(map_sqlite_error)?;
        return Ok(QueryResult::default());
    }

    let mut stmt = conn.prepare(sql).map_err(map_sqlite_error)?;
    let columns: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(|name| name.to_string())
        .collect();
    let bound = params.iter().cloned().map(to_sql_value);
    let mut rows = stmt
        .query(params_from_iter(bound))
        .map_err(map_sqlite_error)?;

    let mut result_rows = Vec::new();
    while let Some(row) = rows.next().map_err(map_sqlite_error)? {
        result_rows.push(map_row(&columns, row)?);
    }
    Ok(QueryResult {
        columns,
        rows: result_rows,
    })
}

fn map_row(columns: &[String], row: &rusqlite::Row<'_>) -> Result<Row, DbError> {
    let mut mapped = Row::new();
    for (index, column) in columns.iter().enumerate() {
        let value = row.get_ref(index).map_err(map_sqlite_error)?;
        mapped.set(
            column,
            match value {
                rusqlite::types::ValueRef::Null => Value::Null,
                rusqlite::types::ValueRef::Integer(value) => Value::Integer(value),
                rusqlite::types::ValueRef::Real(value) => Value::Real(value),
                rusqlite::types::ValueRef::Text(value) => {
                    Value::Text(String::from_utf8_lossy(value).to_string())
                }
                rusqlite::types::ValueRef::Blob(value) => Value::Blob(value.to_vec()),
            },
        );
    }
    Ok(mapped)
}

fn to_sql_value(value: Value) -> rusqlite::types::Value {
    match value.into_storage() {
        Value::Null => rusqlite::types::Value::Null,
        Value::Integer(value) => rusqlite::types::Value::Integer(value),
        Value::Real(value) => rusqlite::types::Value::Real(value),
        Value::Text(value) => rusqlite::types::Value::Text(value),
        Value::Blob(value) => rusqlite::types::Value::Blob(value),
        // into_storage lowers every logical variant.
        _ => rusqlite::types::Value::Null,
    }
}

fn map_sqlite_error(err: rusqlite::Error) -> DbError {
    let kind = match &err {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::ConstraintViolation => EngineErrorKind::ConstraintViolation,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => EngineErrorKind::Locked,
            _ => EngineErrorKind::Other,
        },
        _ => EngineErrorKind::Other,
    };
    DbError::engine(kind, err.to_string())
}
