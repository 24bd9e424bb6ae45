use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tidemark_engine::{DbError, FileRepository};

/// In-memory blob store for tests and ephemeral databases.
#[derive(Default)]
pub struct MemoryFileRepository {
    filesets: Mutex<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryFileRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait(?Send)]
impl FileRepository for MemoryFileRepository {
    async fn write_file(
        &self,
        fileset_id: &str,
        file_id: &str,
        content: &[u8],
    ) -> Result<(), DbError> {
        self.filesets
            .lock()
            .unwrap()
            .entry(fileset_id.to_string())
            .or_default()
            .insert(file_id.to_string(), content.to_vec());
        Ok(())
    }

    async fn read_file(&self, fileset_id: &str, file_id: &str) -> Result<Vec<u8>, DbError> {
        self.filesets
            .lock()
            .unwrap()
            .get(fileset_id)
            .and_then(|files| files.get(file_id))
            .cloned()
            .ok_or_else(|| {
                DbError::not_found(format!("file {fileset_id}/{file_id} not in repository"))
            })
    }

    async fn delete_file(&self, fileset_id: &str, file_id: &str) -> Result<(), DbError> {
        if let Some(files) = self.filesets.lock().unwrap().get_mut(fileset_id) {
            files.remove(file_id);
        }
        Ok(())
    }

    async fn delete_fileset(&self, fileset_id: &str) -> Result<(), DbError> {
        self.filesets.lock().unwrap().remove(fileset_id);
        Ok(())
    }

    async fn list_filesets(&self) -> Result<Vec<String>, DbError> {
        Ok(self.filesets.lock().unwrap().keys().cloned().collect())
    }

    async fn list_files(&self, fileset_id: &str) -> Result<Vec<String>, DbError> {
        Ok(self
            .filesets
            .lock()
            .unwrap()
            .get(fileset_id)
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default())
    }
}
