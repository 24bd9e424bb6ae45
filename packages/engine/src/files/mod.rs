use std::collections::BTreeSet;

use async_trait::async_trait;
use uuid::Uuid;

use crate::database::Database;
use crate::error::DbError;
use crate::reactive::ChangeDescriptor;
use crate::schema::FILES_TABLE;
use crate::types::Value;

/// Blob storage seam. A fileset is a directory-like container owned by one
/// row; files are addressed by `(fileset_id, file_id)`. Mutations must be
/// idempotent under retry; concurrent reads are safe.
#[async_trait(?Send)]
pub trait FileRepository: Send + Sync {
    async fn write_file(
        &self,
        fileset_id: &str,
        file_id: &str,
        content: &[u8],
    ) -> Result<(), DbError>;

    async fn read_file(&self, fileset_id: &str, file_id: &str) -> Result<Vec<u8>, DbError>;

    async fn delete_file(&self, fileset_id: &str, file_id: &str) -> Result<(), DbError>;

    /// Removes a container and everything in it.
    async fn delete_fileset(&self, fileset_id: &str) -> Result<(), DbError>;

    async fn list_filesets(&self) -> Result<Vec<String>, DbError>;

    async fn list_files(&self, fileset_id: &str) -> Result<Vec<String>, DbError>;
}

/// Chunked content source for [`Files::add_file`].
#[async_trait(?Send)]
pub trait ContentReader {
    /// Returns the next chunk, or `None` at end of stream.
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, DbError>;
}

/// Single-buffer [`ContentReader`].
pub struct BytesContent {
    remaining: Option<Vec<u8>>,
}

impl BytesContent {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            remaining: Some(data.into()),
        }
    }
}

#[async_trait(?Send)]
impl ContentReader for BytesContent {
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, DbError> {
        Ok(self.remaining.take())
    }
}

/// Outcome of a garbage-collection sweep. Sweeps are best-effort:
/// individual deletion failures are counted and logged, never aborting the
/// pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    pub filesets_removed: u64,
    pub files_removed: u64,
    pub failures: u64,
}

impl GcReport {
    fn absorb(&mut self, other: GcReport) {
        self.filesets_removed += other.filesets_removed;
        self.files_removed += other.files_removed;
        self.failures += other.failures;
    }
}

/// Fileset surface of a database, bound to its configured repository.
pub struct Files<'a> {
    database: &'a Database,
    repository: &'a dyn FileRepository,
}

impl<'a> Files<'a> {
    pub(crate) fn new(database: &'a Database, repository: &'a dyn FileRepository) -> Self {
        Self {
            database,
            repository,
        }
    }

    /// Streams content into the repository and records the metadata row.
    /// Returns the fresh file id.
    pub async fn add_file(
        &self,
        fileset_id: &str,
        filename: &str,
        mime_type: Option<&str>,
        content: &mut dyn ContentReader,
    ) -> Result<String, DbError> {
        let file_id = Uuid::new_v4().to_string();

        let mut bytes = Vec::new();
        while let Some(chunk) = content.read_chunk().await? {
            bytes.extend_from_slice(&chunk);
        }
        let size = bytes.len() as i64;

        self.repository
            .write_file(fileset_id, &file_id, &bytes)
            .await?;

        let insert = self
            .database
            .backend
            .execute(
                &format!(
                    "INSERT INTO {FILES_TABLE} (id, fileset_id, name, path, mime_type, size_bytes) \
                     VALUES (?, ?, ?, ?, ?, ?)"
                ),
                &[
                    Value::text(&file_id),
                    Value::text(fileset_id),
                    Value::text(filename),
                    Value::Text(format!("{fileset_id}/{file_id}")),
                    mime_type.map(Value::text).unwrap_or(Value::Null),
                    Value::Integer(size),
                ],
            )
            .await;
        if let Err(err) = insert {
            // Orphaned blob cleanup; GC would catch it anyway.
            let _ = self.repository.delete_file(fileset_id, &file_id).await;
            return Err(err.into_create_failure());
        }

        self.database
            .bus
            .emit(vec![ChangeDescriptor::insert(FILES_TABLE, &file_id)]);
        Ok(file_id)
    }

    pub async fn get_content(&self, file_id: &str) -> Result<Vec<u8>, DbError> {
        let fileset_id = self.owner_of(file_id).await?;
        self.repository.read_file(&fileset_id, file_id).await
    }

    pub async fn delete_file(&self, file_id: &str) -> Result<(), DbError> {
        let fileset_id = self.owner_of(file_id).await?;
        self.database
            .backend
            .execute(
                &format!("DELETE FROM {FILES_TABLE} WHERE id = ?"),
                &[Value::text(file_id)],
            )
            .await
            .map_err(DbError::into_delete_failure)?;
        self.repository.delete_file(&fileset_id, file_id).await?;
        self.database
            .bus
            .emit(vec![ChangeDescriptor::delete(FILES_TABLE, file_id)]);
        Ok(())
    }

    /// Removes repository containers whose id is in neither `valid` nor
    /// `preserve`. New containers created after the snapshot was taken are
    /// untouched because they cannot appear in the listing twice.
    pub async fn gc_filesets(
        &self,
        valid: &BTreeSet<String>,
        preserve: &[&str],
    ) -> Result<GcReport, DbError> {
        let mut report = GcReport::default();
        for fileset_id in self.repository.list_filesets().await? {
            if valid.contains(&fileset_id) || preserve.contains(&fileset_id.as_str()) {
                continue;
            }
            match self.repository.delete_fileset(&fileset_id).await {
                Ok(()) => report.filesets_removed += 1,
                Err(err) => {
                    tracing::warn!(fileset_id = %fileset_id, error = %err, "fileset gc failed");
                    report.failures += 1;
                }
            }
        }
        tracing::info!(
            removed = report.filesets_removed,
            failures = report.failures,
            "fileset container sweep finished"
        );
        Ok(report)
    }

    /// Removes files under `fileset_id` that are not in `valid`.
    pub async fn gc_files(
        &self,
        fileset_id: &str,
        valid: &BTreeSet<String>,
    ) -> Result<GcReport, DbError> {
        let mut report = GcReport::default();
        for file_id in self.repository.list_files(fileset_id).await? {
            if valid.contains(&file_id) {
                continue;
            }
            match self.repository.delete_file(fileset_id, &file_id).await {
                Ok(()) => report.files_removed += 1,
                Err(err) => {
                    tracing::warn!(
                        fileset_id = %fileset_id,
                        file_id = %file_id,
                        error = %err,
                        "file gc failed"
                    );
                    report.failures += 1;
                }
            }
        }
        Ok(report)
    }

    /// Full sweep against the authoritative identifier sets: owners are
    /// every fileset id known to `__files` or referenced by a fileset
    /// column; per-owner valid files come from `__files`.
    pub async fn gc_all(&self) -> Result<GcReport, DbError> {
        let mut owners: BTreeSet<String> = BTreeSet::new();

        let known = self
            .database
            .backend
            .execute(
                &format!("SELECT DISTINCT fileset_id FROM {FILES_TABLE}"),
                &[],
            )
            .await?;
        for row in &known.rows {
            if let Some(id) = row.get("fileset_id").and_then(Value::as_text) {
                owners.insert(id.to_string());
            }
        }

        for table in &self.database.schema.tables {
            for column in table.fileset_columns() {
                let referenced = self
                    .database
                    .backend
                    .execute(
                        &format!(
                            "SELECT {column} FROM {table} WHERE {column} IS NOT NULL",
                            column = column.name,
                            table = table.name
                        ),
                        &[],
                    )
                    .await?;
                for row in &referenced.rows {
                    if let Some(id) = row.get(&column.name).and_then(Value::as_text) {
                        owners.insert(id.to_string());
                    }
                }
            }
        }

        let mut report = self.gc_filesets(&owners, &[]).await?;

        for owner in &owners {
            let files = self
                .database
                .backend
                .execute(
                    &format!("SELECT id FROM {FILES_TABLE} WHERE fileset_id = ?"),
                    &[Value::text(owner)],
                )
                .await?;
            let valid: BTreeSet<String> = files
                .rows
                .iter()
                .filter_map(|row| row.get("id").and_then(Value::as_text))
                .map(str::to_string)
                .collect();
            report.absorb(self.gc_files(owner, &valid).await?);
        }

        Ok(report)
    }

    async fn owner_of(&self, file_id: &str) -> Result<String, DbError> {
        let result = self
            .database
            .backend
            .execute(
                &format!("SELECT fileset_id FROM {FILES_TABLE} WHERE id = ?"),
                &[Value::text(file_id)],
            )
            .await?;
        result
            .rows
            .first()
            .and_then(|row| row.get("fileset_id"))
            .and_then(Value::as_text)
            .map(str::to_string)
            .ok_or_else(|| DbError::not_found(format!("unknown file {file_id:?}")))
    }
}
