use serde::{Deserialize, Serialize};

use crate::database::Database;
use crate::error::DbError;
use crate::hlc::Hlc;
use crate::journal::{self, DirtyRow};
use crate::reactive::ChangeDescriptor;
use crate::schema::{
    hlc_shadow_column, is_hlc_shadow_column, is_system_column, SYSTEM_CREATED_AT, SYSTEM_ID,
    SYSTEM_VERSION,
};
use crate::types::{Row, Value};
use crate::write::serialize_value;

mod manager;

pub use manager::{
    RemoteBatch, RetryPolicy, SyncEvent, SyncEventKind, SyncManager, SyncManagerConfig,
    SyncSummary, SyncTransport,
};

/// One row as delivered by the server: its field values plus the server's
/// `updated_at` stamp, which arbitrates non-LWW fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRow {
    pub values: Row,
    pub updated_at: Hlc,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl Database {
    /// Enumerates pending journal entries, each carrying exactly the fields
    /// committed by its mutation.
    pub async fn dirty_rows(&self) -> Result<Vec<DirtyRow>, DbError> {
        journal::list(self.backend.as_ref(), None).await
    }

    /// Journal entries after a sync checkpoint.
    pub async fn dirty_rows_since(&self, checkpoint: &Hlc) -> Result<Vec<DirtyRow>, DbError> {
        journal::list(self.backend.as_ref(), Some(checkpoint)).await
    }

    /// Clears acknowledged entries after a successful upload.
    pub async fn mark_synced(&self, ids: &[String]) -> Result<(), DbError> {
        journal::clear(self.backend.as_ref(), ids).await
    }

    /// Drops entries without acknowledgement (permanent server rejection).
    pub async fn discard(&self, ids: &[String]) -> Result<(), DbError> {
        journal::clear(self.backend.as_ref(), ids).await
    }

    /// Applies server rows: unknown `system_id`s insert verbatim, known
    /// ones merge per-column (LWW columns by shadow clock, other columns by
    /// the server `updated_at` against local `system_version`, ties going
    /// to the server). Remote applications emit change descriptors but are
    /// never journaled, so they cannot echo back on the next push.
    pub async fn apply_remote(
        &self,
        table: &str,
        rows: &[RemoteRow],
    ) -> Result<ApplyReport, DbError> {
        let def = self
            .schema
            .table(table)
            .filter(|def| !def.is_system)
            .ok_or_else(|| DbError::not_found(format!("unknown table {table:?}")))?;

        let mut report = ApplyReport::default();
        for remote in rows {
            self.clock.observe(&remote.updated_at);

            let system_id = remote
                .values
                .get(SYSTEM_ID)
                .and_then(Value::as_text)
                .map(str::to_string)
                .ok_or_else(|| {
                    DbError::invalid_data("remote rows must carry a system_id")
                })?;

            // Validate and lower every incoming field before touching
            // storage.
            let mut fields = Row::new();
            for (column, value) in remote.values.iter() {
                if column == SYSTEM_ID {
                    continue;
                }
                if column == SYSTEM_CREATED_AT || column == SYSTEM_VERSION {
                    let stamp = value.as_text().ok_or_else(|| {
                        DbError::invalid_data(format!("remote {column} must be an HLC"))
                    })?;
                    Hlc::parse(stamp)?;
                    fields.set(column, Value::text(stamp));
                    continue;
                }
                if is_hlc_shadow_column(column) {
                    let stamp = value.as_text().ok_or_else(|| {
                        DbError::invalid_data(format!("remote {column} must be an HLC"))
                    })?;
                    self.clock.observe(&Hlc::parse(stamp)?);
                    fields.set(column, Value::text(stamp));
                    continue;
                }
                let column_def = def.column(column).ok_or_else(|| {
                    DbError::invalid_data(format!(
                        "remote row references unknown column {column:?} in {table:?}"
                    ))
                })?;
                fields.set(column, serialize_value(table, column_def, value)?);
            }

            match self.get_by_system_id(table, &system_id).await? {
                None => {
                    self.apply_remote_insert(table, &system_id, fields, remote)
                        .await?;
                    report.inserted += 1;
                }
                Some(local) => {
                    if self
                        .apply_remote_merge(table, &system_id, &local, fields, remote)
                        .await?
                    {
                        report.updated += 1;
                    } else {
                        report.unchanged += 1;
                    }
                }
            }
        }
        Ok(report)
    }

    async fn apply_remote_insert(
        &self,
        table: &str,
        system_id: &str,
        fields: Row,
        remote: &RemoteRow,
    ) -> Result<(), DbError> {
        let def = self.schema.table(table).ok_or_else(|| {
            DbError::not_found(format!("unknown table {table:?}"))
        })?;
        let stamp = remote.updated_at.to_string();

        let mut row = Row::new();
        row.set(SYSTEM_ID, Value::text(system_id));
        row.set(SYSTEM_CREATED_AT, Value::text(&stamp));
        row.set(SYSTEM_VERSION, Value::text(&stamp));
        for (column, value) in fields.iter() {
            row.set(column, value.clone());
        }
        // LWW columns delivered without a shadow take the server stamp.
        for column in def.lww_columns() {
            let shadow = hlc_shadow_column(&column.name);
            if row.contains(&column.name) && !row.contains(&shadow) {
                row.set(shadow, Value::text(&stamp));
            }
        }

        let placeholders = vec!["?"; row.len()].join(", ");
        let params: Vec<Value> = row.iter().map(|(_, value)| value.clone()).collect();
        self.backend
            .execute(
                &format!(
                    "INSERT INTO {table} ({}) VALUES ({placeholders})",
                    row.columns().join(", ")
                ),
                &params,
            )
            .await
            .map_err(DbError::into_create_failure)?;

        self.bus
            .emit(vec![ChangeDescriptor::insert(table, system_id)]);
        Ok(())
    }

    async fn apply_remote_merge(
        &self,
        table: &str,
        system_id: &str,
        local: &Row,
        fields: Row,
        remote: &RemoteRow,
    ) -> Result<bool, DbError> {
        let def = self.schema.table(table).ok_or_else(|| {
            DbError::not_found(format!("unknown table {table:?}"))
        })?;

        let local_version = local
            .get(SYSTEM_VERSION)
            .and_then(Value::as_text)
            .map(Hlc::parse)
            .transpose()?
            .ok_or_else(|| {
                DbError::invalid_data(format!("local row in {table:?} has no system_version"))
            })?;

        let mut committed: Vec<(String, Value)> = Vec::new();
        for (column, value) in fields.iter() {
            if is_system_column(column) || is_hlc_shadow_column(column) {
                continue;
            }
            let column_def = def.column(column).ok_or_else(|| {
                DbError::invalid_data(format!("unknown column {column:?} in {table:?}"))
            })?;

            if column_def.lww {
                let shadow = hlc_shadow_column(column);
                let remote_stamp = match fields.get(&shadow).and_then(Value::as_text) {
                    Some(stamp) => Hlc::parse(stamp)?,
                    None => remote.updated_at.clone(),
                };
                let local_stamp = local
                    .get(&shadow)
                    .and_then(Value::as_text)
                    .map(Hlc::parse)
                    .transpose()?;
                let remote_wins = local_stamp
                    .as_ref()
                    .map_or(true, |stamp| remote_stamp > *stamp);
                if remote_wins {
                    committed.push((column.to_string(), value.clone()));
                    committed.push((shadow, Value::Text(remote_stamp.to_string())));
                }
            } else if remote.updated_at >= local_version {
                // Equal stamps go to the server.
                committed.push((column.to_string(), value.clone()));
            }
        }

        if committed.is_empty() {
            return Ok(false);
        }

        // Stamped after observing the remote clock, so the merged row
        // orders after both writers.
        let version = self.clock.now();
        committed.push((SYSTEM_VERSION.to_string(), Value::Text(version.to_string())));

        let assignments: Vec<String> = committed
            .iter()
            .map(|(column, _)| format!("{column} = ?"))
            .collect();
        let mut params: Vec<Value> = committed.iter().map(|(_, value)| value.clone()).collect();
        params.push(Value::text(system_id));
        self.backend
            .execute(
                &format!(
                    "UPDATE {table} SET {} WHERE {SYSTEM_ID} = ?",
                    assignments.join(", ")
                ),
                &params,
            )
            .await
            .map_err(DbError::into_update_failure)?;

        let columns = committed.into_iter().map(|(column, _)| column).collect();
        self.bus
            .emit(vec![ChangeDescriptor::update(table, system_id, columns)]);
        Ok(true)
    }
}
