mod backend;
mod files;

use std::path::PathBuf;

use tidemark_engine::{DatabaseConfig, FactoryRegistry, FileRepository, StorageBackend};

pub struct OpenDatabaseConfig {
    pub schema: Schema,
    /// SQLite file path; `None` opens an in-memory database.
    pub path: Option<PathBuf>,
    /// Blob storage root; `None` keeps blobs in memory.
    pub files_dir: Option<PathBuf>,
    /// Fixed HLC node id, mainly for tests.
    pub node_id: Option<String>,
    pub factories: FactoryRegistry,
}

impl OpenDatabaseConfig {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            path: None,
            files_dir: None,
            node_id: None,
            factories: FactoryRegistry::new(),
        }
    }
}

/// Opens (migrating as needed) a database backed by SQLite and a file
/// repository backed by the filesystem or memory.
pub async fn open_database(config: OpenDatabaseConfig) -> Result<Database, DbError> {
    let storage: Box<dyn StorageBackend> = match &config.path {
        Some(path) => Box::new(SqliteBackend::from_path(path)?),
        None => Box::new(SqliteBackend::in_memory()?),
    };
    let repository: Box<dyn FileRepository> = match &config.files_dir {
        Some(dir) => Box::new(FsFileRepository::new(dir)?),
        None => Box::new(MemoryFileRepository::new()),
    };

    let mut database_config = DatabaseConfig::new(config.schema);
    database_config.node_id = config.node_id;
    database_config.factories = config.factories;

    Database::open(storage, Some(repository), database_config).await
}

pub use backend::sqlite::SqliteBackend;
pub use files::{FsFileRepository, MemoryFileRepository};
pub use tidemark_engine::{
    Database, DbError, Query, QueryResult, Row, Schema, SchemaBuilder, Value, Where,
};
