use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::database::Database;
use crate::error::DbError;
use crate::reactive::ChangeStream;
use crate::types::{QueryResult, Value};

/// One emission of a watch: a full result snapshot plus the change batch
/// that triggered it (`None` for the initial snapshot).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub sequence: u64,
    pub rows: QueryResult,
    pub change_sequence: Option<u64>,
}

/// A registered watch borrowing the database. `next().await` yields the
/// initial snapshot, then re-executes whenever a matching mutation commits,
/// suppressing emissions whose snapshot equals the previous one.
///
/// A failed re-execution surfaces as one `Err` item; the watch stays
/// registered and the next call continues from the pending change queue.
pub struct Watch<'a> {
    database: &'a Database,
    state: WatchState,
}

/// Arc-owning variant of [`Watch`].
pub struct WatchOwned {
    database: Arc<Database>,
    state: WatchState,
}

pub(crate) struct WatchState {
    sql: String,
    params: Vec<Value>,
    changes: ChangeStream,
    last_result: Option<QueryResult>,
    emitted_initial: bool,
    next_sequence: u64,
    closed: bool,
}

impl<'a> Watch<'a> {
    pub(crate) fn new(database: &'a Database, state: WatchState) -> Self {
        Self { database, state }
    }

    pub async fn next(&mut self) -> Result<Option<WatchEvent>, DbError> {
        self.state.next_with_database(self.database).await
    }

    pub fn close(&mut self) {
        self.state.close();
    }
}

impl Drop for Watch<'_> {
    fn drop(&mut self) {
        self.close();
    }
}

impl WatchOwned {
    pub(crate) fn new(database: Arc<Database>, state: WatchState) -> Self {
        Self { database, state }
    }

    pub async fn next(&mut self) -> Result<Option<WatchEvent>, DbError> {
        self.state.next_with_database(self.database.as_ref()).await
    }

    pub fn close(&mut self) {
        self.state.close();
    }
}

impl Drop for WatchOwned {
    fn drop(&mut self) {
        self.close();
    }
}

impl WatchState {
    pub(crate) fn new(sql: String, params: Vec<Value>, changes: ChangeStream) -> Self {
        Self {
            sql,
            params,
            changes,
            last_result: None,
            emitted_initial: false,
            next_sequence: 0,
            closed: false,
        }
    }

    async fn next_with_database(
        &mut self,
        database: &Database,
    ) -> Result<Option<WatchEvent>, DbError> {
        if self.closed {
            return Ok(None);
        }

        if !self.emitted_initial {
            self.emitted_initial = true;
            let rows = self.execute(database).await?;
            self.last_result = Some(rows.clone());
            return Ok(Some(self.make_event(rows, None)));
        }

        loop {
            let Some(batch) = self.changes.next().await else {
                self.closed = true;
                return Ok(None);
            };

            // Coalesce: everything already queued is covered by one
            // re-execution against current state.
            let mut change_sequence = batch.sequence;
            while let Some(pending) = self.changes.try_next() {
                change_sequence = pending.sequence;
            }

            let rows = self.execute(database).await?;
            if self
                .last_result
                .as_ref()
                .is_some_and(|previous| *previous == rows)
            {
                continue;
            }

            self.last_result = Some(rows.clone());
            return Ok(Some(self.make_event(rows, Some(change_sequence))));
        }
    }

    async fn execute(&self, database: &Database) -> Result<QueryResult, DbError> {
        database.backend.execute(&self.sql, &self.params).await
    }

    fn make_event(&mut self, rows: QueryResult, change_sequence: Option<u64>) -> WatchEvent {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.saturating_add(1);
        WatchEvent {
            sequence,
            rows,
            change_sequence,
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.changes.close();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use futures_util::FutureExt;

    use crate::backend::{StorageBackend, StorageTransaction};
    use crate::database::Database;
    use crate::error::DbError;
    use crate::hlc::HlcClock;
    use crate::query::{Query, Where};
    use crate::reactive::{ChangeBus, ChangeDescriptor};
    use crate::records::FactoryRegistry;
    use crate::schema::SchemaBuilder;
    use crate::types::{QueryResult, Row, Value};

    /// Backend that replays a script of responses; lets the watch machine
    /// be driven without a real engine.
    struct ScriptedBackend {
        responses: Mutex<VecDeque<Result<QueryResult, DbError>>>,
    }

    impl ScriptedBackend {
        fn new(responses: Vec<Result<QueryResult, DbError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
            }
        }
    }

    #[async_trait(?Send)]
    impl StorageBackend for ScriptedBackend {
        async fn execute(&self, _sql: &str, _params: &[Value]) -> Result<QueryResult, DbError> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(QueryResult::default()))
        }

        async fn begin_transaction(
            &self,
        ) -> Result<Box<dyn StorageTransaction + '_>, DbError> {
            Err(DbError::invalid_query("scripted backend has no transactions"))
        }
    }

    fn snapshot(name: &str) -> QueryResult {
        QueryResult {
            columns: vec!["name".to_string()],
            rows: vec![Row::new().with("name", Value::text(name))],
        }
    }

    fn scripted_database(responses: Vec<Result<QueryResult, DbError>>) -> Database {
        Database {
            backend: Box::new(ScriptedBackend::new(responses)),
            file_repository: None,
            schema: SchemaBuilder::new()
                .table("users", |t| {
                    t.text("name");
                    t.text("status");
                })
                .build()
                .expect("schema"),
            clock: HlcClock::new(),
            bus: Arc::new(ChangeBus::default()),
            factories: FactoryRegistry::new(),
        }
    }

    fn name_update() -> ChangeDescriptor {
        ChangeDescriptor::update(
            "users",
            "R1",
            ["name".to_string(), "system_version".to_string()]
                .into_iter()
                .collect(),
        )
    }

    #[tokio::test]
    async fn failed_reexecution_emits_one_error_and_keeps_the_registration() {
        let db = scripted_database(vec![
            Ok(snapshot("a")),
            Err(DbError::invalid_query("simulated read failure")),
            Ok(snapshot("b")),
        ]);
        let mut watch = db
            .watch(
                Query::from("users")
                    .select("name")
                    .filter(Where::eq("status", Value::text("active"))),
            )
            .expect("watch");

        watch.next().await.expect("initial").expect("snapshot");

        db.bus.emit(vec![name_update()]);
        watch
            .next()
            .await
            .expect_err("the invalidation surfaces one failure item");

        // Still registered: the next matching commit re-executes normally.
        db.bus.emit(vec![name_update()]);
        let event = watch.next().await.expect("recovered").expect("snapshot");
        assert_eq!(event.rows, snapshot("b"));
    }

    #[tokio::test]
    async fn unchanged_snapshots_are_not_re_emitted() {
        let db = scripted_database(vec![
            Ok(snapshot("same")),
            Ok(snapshot("same")),
            Ok(snapshot("different")),
        ]);
        let mut watch = db
            .watch(Query::from("users").select("name"))
            .expect("watch");
        watch.next().await.expect("initial").expect("snapshot");

        // First re-execution returns an identical snapshot: suppressed.
        db.bus.emit(vec![name_update()]);
        assert!(watch.next().now_or_never().is_none());

        db.bus.emit(vec![name_update()]);
        let event = watch.next().await.expect("next").expect("snapshot");
        assert_eq!(event.rows, snapshot("different"));
        assert_eq!(event.sequence, 1);
    }
}
