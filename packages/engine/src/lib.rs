mod backend;
mod database;
mod error;
mod files;
mod hlc;
mod journal;
mod query;
mod reactive;
mod records;
mod schema;
mod sync;
mod types;
mod watch;
mod write;

pub use backend::{StorageBackend, StorageTransaction};
pub use database::{Database, DatabaseConfig};
pub use error::{
    ConnectionFailureKind, CreateFailureKind, DbError, DeleteFailureKind, EngineErrorKind,
    MigrationFailureKind, ReadFailureKind, SyncFailureKind, UpdateFailureKind,
};
pub use files::{BytesContent, ContentReader, FileRepository, Files, GcReport};
pub use hlc::{Hlc, HlcClock};
pub use journal::{DirtyKind, DirtyRow};
pub use query::{
    analyze, render_select, AggregateFunc, ColumnRef, CompareOp, Dependencies, Join, JoinKind,
    OrderDirection, Query, QuerySource, SelectColumn, Where,
};
pub use reactive::{ChangeBatch, ChangeDescriptor, ChangeKind, ChangeStream, WatchFilter};
pub use records::{FactoryRegistry, Record, RecordsWatch};
pub use schema::{
    migrate, Column, ColumnBuilder, DefaultValue, Key, KeyBuilder, KeyKind, LogicalType,
    PhysicalType, Schema, SchemaBuilder, SchemaProvider, Table, TableBuilder, View,
    DIRTY_ROWS_TABLE, FILES_TABLE, SYSTEM_CREATED_AT, SYSTEM_ID, SYSTEM_VERSION,
};
pub use sync::{
    ApplyReport, RemoteBatch, RemoteRow, RetryPolicy, SyncEvent, SyncEventKind, SyncManager,
    SyncManagerConfig, SyncSummary, SyncTransport,
};
pub use types::{QueryResult, Row, Value};
pub use watch::{Watch, WatchEvent, WatchOwned};
