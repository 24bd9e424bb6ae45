use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tidemark_engine::{DbError, EngineErrorKind, FileRepository};

/// Filesystem blob store: one directory per fileset, one file per blob.
/// Deletes are idempotent so sync and GC retries are safe.
pub struct FsFileRepository {
    root: PathBuf,
}

impl FsFileRepository {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, DbError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(map_io_error)?;
        Ok(Self { root })
    }

    fn fileset_dir(&self, fileset_id: &str) -> PathBuf {
        self.root.join(fileset_id)
    }
}

#[async_trait(?Send)]
impl FileRepository for FsFileRepository {
    async fn write_file(
        &self,
        fileset_id: &str,
        file_id: &str,
        content: &[u8],
    ) -> Result<(), DbError> {
        let dir = self.fileset_dir(fileset_id);
        std::fs::create_dir_all(&dir).map_err(map_io_error)?;
        std::fs::write(dir.join(file_id), content).map_err(map_io_error)
    }

    async fn read_file(&self, fileset_id: &str, file_id: &str) -> Result<Vec<u8>, DbError> {
        std::fs::read(self.fileset_dir(fileset_id).join(file_id)).map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                DbError::not_found(format!("file {fileset_id}/{file_id} not in repository"))
            } else {
                map_io_error(err)
            }
        })
    }

    async fn delete_file(&self, fileset_id: &str, file_id: &str) -> Result<(), DbError> {
        match std::fs::remove_file(self.fileset_dir(fileset_id).join(file_id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(map_io_error(err)),
        }
    }

    async fn delete_fileset(&self, fileset_id: &str) -> Result<(), DbError> {
        match std::fs::remove_dir_all(self.fileset_dir(fileset_id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(map_io_error(err)),
        }
    }

    async fn list_filesets(&self) -> Result<Vec<String>, DbError> {
        let mut filesets = Vec::new();
        for entry in std::fs::read_dir(&self.root).map_err(map_io_error)? {
            let entry = entry.map_err(map_io_error)?;
            if entry.file_type().map_err(map_io_error)?.is_dir() {
                filesets.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        filesets.sort();
        Ok(filesets)
    }

    async fn list_files(&self, fileset_id: &str) -> Result<Vec<String>, DbError> {
        let dir = self.fileset_dir(fileset_id);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(map_io_error(err)),
        };
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(map_io_error)?;
            if entry.file_type().map_err(map_io_error)?.is_file() {
                files.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        files.sort();
        Ok(files)
    }
}

fn map_io_error(err: std::io::Error) -> DbError {
    DbError::engine(EngineErrorKind::Other, format!("file repository: {err}"))
}
