use std::sync::Arc;

use crate::backend::StorageBackend;
use crate::error::DbError;
use crate::files::{FileRepository, Files};
use crate::hlc::{Hlc, HlcClock};
use crate::query::{analyze, render_select, Query};
use crate::reactive::{ChangeBus, WatchFilter};
use crate::records::FactoryRegistry;
use crate::schema::{migrate, Schema};
use crate::types::QueryResult;
use crate::watch::{Watch, WatchOwned, WatchState};

pub struct DatabaseConfig {
    pub schema: Schema,
    /// Overrides the process node id; tests use fixed ids for reproducible
    /// HLC arbitration.
    pub node_id: Option<String>,
    pub factories: FactoryRegistry,
}

impl DatabaseConfig {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            node_id: None,
            factories: FactoryRegistry::new(),
        }
    }
}

/// The data access surface. Owns the storage handle, the declared schema,
/// the HLC clock, the watch registry, and the optional file repository;
/// every read, write, watch, fileset and sync operation goes through here.
pub struct Database {
    pub(crate) backend: Box<dyn StorageBackend>,
    pub(crate) file_repository: Option<Box<dyn FileRepository>>,
    pub(crate) schema: Schema,
    pub(crate) clock: HlcClock,
    pub(crate) bus: Arc<ChangeBus>,
    pub(crate) factories: FactoryRegistry,
}

impl Database {
    /// Migrates storage to the declared schema and constructs the access
    /// surface. The schema is immutable afterwards.
    pub async fn open(
        backend: Box<dyn StorageBackend>,
        file_repository: Option<Box<dyn FileRepository>>,
        config: DatabaseConfig,
    ) -> Result<Self, DbError> {
        migrate::migrate(backend.as_ref(), &config.schema).await?;

        let clock = match config.node_id {
            Some(node_id) => HlcClock::with_node_id(node_id),
            None => HlcClock::new(),
        };

        Ok(Self {
            backend,
            file_repository,
            schema: config.schema,
            clock,
            bus: Arc::new(ChangeBus::default()),
            factories: config.factories,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn node_id(&self) -> &str {
        self.clock.node_id()
    }

    pub fn hlc_now(&self) -> Hlc {
        self.clock.now()
    }

    /// Executes a structured query and materializes the full result.
    pub async fn query(&self, query: &Query) -> Result<QueryResult, DbError> {
        let (sql, params) = render_select(query)?;
        self.backend.execute(&sql, &params).await
    }

    /// Registers a watch: a lazy sequence of result snapshots re-computed
    /// only when a committed mutation intersects the query's dependency
    /// set.
    pub fn watch(&self, query: Query) -> Result<Watch<'_>, DbError> {
        let state = self.build_watch_state(query)?;
        Ok(Watch::new(self, state))
    }

    /// Arc-owning variant for watches that outlive a borrow of the
    /// database.
    pub fn watch_owned(self: &Arc<Self>, query: Query) -> Result<WatchOwned, DbError> {
        let state = self.build_watch_state(query)?;
        Ok(WatchOwned::new(Arc::clone(self), state))
    }

    /// Fileset surface; fails when no file repository was configured.
    pub fn files(&self) -> Result<Files<'_>, DbError> {
        match self.file_repository.as_deref() {
            Some(repository) => Ok(Files::new(self, repository)),
            None => Err(DbError::invalid_query(
                "no file repository configured for this database",
            )),
        }
    }

    fn build_watch_state(&self, query: Query) -> Result<WatchState, DbError> {
        // Render up front so builder misuse surfaces at registration, not
        // on first poll.
        let (sql, params) = render_select(&query)?;
        let deps = analyze(&query, &self.schema);
        if deps.tables.is_empty() {
            return Err(DbError::invalid_query(
                "watched query references no tables",
            ));
        }
        tracing::debug!(sql = %sql, tables = ?deps.tables, "registering watch");
        let stream = self.bus.subscribe(WatchFilter::from_dependencies(&deps));
        Ok(WatchState::new(sql, params, stream))
    }
}
