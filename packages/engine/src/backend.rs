use async_trait::async_trait;

use crate::{DbError, QueryResult, Value};

/// Storage engine seam. The data layer owns exactly one backend and routes
/// every SQL statement through it; implementations may use worker threads
/// internally but must expose this async surface.
///
/// Parameters arrive pre-lowered to the physical value subset
/// (`Null | Integer | Real | Text | Blob`).
#[async_trait(?Send)]
pub trait StorageBackend: Send + Sync {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<QueryResult, DbError>;

    async fn begin_transaction(&self) -> Result<Box<dyn StorageTransaction + '_>, DbError>;
}

#[async_trait(?Send)]
pub trait StorageTransaction {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult, DbError>;

    async fn commit(self: Box<Self>) -> Result<(), DbError>;

    async fn rollback(self: Box<Self>) -> Result<(), DbError>;
}
