use std::collections::BTreeSet;

use chrono::DateTime;
use uuid::Uuid;

use crate::backend::StorageTransaction;
use crate::database::Database;
use crate::error::{CreateFailureKind, DbError, UpdateFailureKind};
use crate::hlc::Hlc;
use crate::journal::{self, DirtyKind, DirtyRow};
use crate::query::{render_select, Query, Where};
use crate::reactive::ChangeDescriptor;
use crate::schema::{
    hlc_shadow_column, is_hlc_shadow_column, is_system_column, Column, LogicalType, Table,
    SYSTEM_CREATED_AT, SYSTEM_ID, SYSTEM_VERSION,
};
use crate::types::{Row, Value};

impl Database {
    /// Inserts a row and returns its `system_id`.
    ///
    /// Missing columns receive their declared defaults; the row is stamped
    /// with a fresh HLC (`system_created_at == system_version`, every
    /// provided LWW column's shadow set to the same stamp).
    pub async fn insert(&self, table: &str, values: Row) -> Result<String, DbError> {
        self.insert_with_hlc(table, values, None).await
    }

    /// Insert with an explicit HLC stamp, as supplied by sync replay.
    pub async fn insert_with_hlc(
        &self,
        table: &str,
        mut values: Row,
        stamp: Option<Hlc>,
    ) -> Result<String, DbError> {
        let def = self.writable_table(table)?;

        let provided_id = match values.remove(SYSTEM_ID) {
            Some(value) => Some(
                value
                    .as_text()
                    .map(str::to_string)
                    .ok_or_else(|| DbError::invalid_data("system_id must be a guid"))?,
            ),
            None => None,
        };
        validate_caller_columns(def, &values)?;

        let hlc = stamp.unwrap_or_else(|| self.clock.now());
        let system_id = provided_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        // Effective values: caller values first, then declared defaults.
        let mut effective = Row::new();
        for column in &def.columns {
            if is_system_column(&column.name) || is_hlc_shadow_column(&column.name) {
                continue;
            }
            if let Some(value) = values.get(&column.name) {
                effective.set(&column.name, serialize_value(table, column, value)?);
            } else if let Some(default) = &column.default {
                let value = default.resolve();
                effective.set(&column.name, serialize_value(table, column, &value)?);
            } else if column.not_null {
                return Err(DbError::Create {
                    kind: CreateFailureKind::ConstraintViolation,
                    message: format!("column {table}.{} is not nullable", column.name),
                    cause: None,
                });
            }
        }

        let mut row = Row::new();
        row.set(SYSTEM_ID, Value::Text(system_id.clone()));
        row.set(SYSTEM_CREATED_AT, Value::Text(hlc.to_string()));
        row.set(SYSTEM_VERSION, Value::Text(hlc.to_string()));
        for (column, value) in effective.iter() {
            row.set(column, value.clone());
        }
        for column in def.lww_columns() {
            if effective.contains(&column.name) {
                row.set(
                    hlc_shadow_column(&column.name),
                    Value::Text(hlc.to_string()),
                );
            }
        }

        let payload = journal::payload_from_fields(
            row.iter().filter(|(column, _)| !is_system_column(column)),
        )?;
        let entry = DirtyRow::new(table, &system_id, DirtyKind::Insert, payload, hlc);

        let sql = insert_sql(table, row.columns());
        let params: Vec<Value> = row.iter().map(|(_, value)| value.clone()).collect();

        let mut tx = self.backend.begin_transaction().await?;
        let result = async {
            tx.execute(&sql, &params)
                .await
                .map_err(DbError::into_create_failure)?;
            journal::append(tx.as_mut(), &entry).await?;
            Ok::<(), DbError>(())
        }
        .await;

        match result {
            Ok(()) => {
                tx.commit().await.map_err(DbError::into_create_failure)?;
                self.bus
                    .emit(vec![ChangeDescriptor::insert(table, &system_id)]);
                Ok(system_id)
            }
            Err(err) => abort(tx, err).await,
        }
    }

    /// Updates matching rows, merging LWW columns per their shadow clocks.
    /// Returns the number of rows that actually changed; rows where every
    /// candidate column lost arbitration are left untouched.
    pub async fn update(&self, table: &str, values: Row, filter: Where) -> Result<usize, DbError> {
        self.update_inner(table, values, filter, None).await
    }

    pub async fn update_with_hlc(
        &self,
        table: &str,
        values: Row,
        filter: Where,
        stamp: Hlc,
    ) -> Result<usize, DbError> {
        self.update_inner(table, values, filter, Some(stamp)).await
    }

    /// Like [`Database::update`], but reports `ConcurrencyConflict` when
    /// rows matched and none of them accepted the write.
    pub async fn update_expecting_win(
        &self,
        table: &str,
        values: Row,
        filter: Where,
        stamp: Option<Hlc>,
    ) -> Result<usize, DbError> {
        let outcome = self.update_outcome(table, values, filter, stamp).await?;
        if outcome.matched > 0 && outcome.changed == 0 {
            return Err(DbError::Update {
                kind: UpdateFailureKind::ConcurrencyConflict,
                message: "every matched row carried a newer writer for the given fields"
                    .to_string(),
                cause: None,
            });
        }
        Ok(outcome.changed)
    }

    pub async fn update_by_system_id(
        &self,
        table: &str,
        system_id: &str,
        values: Row,
    ) -> Result<usize, DbError> {
        self.update(
            table,
            values,
            Where::eq(SYSTEM_ID, Value::text(system_id)),
        )
        .await
    }

    pub async fn update_by_system_id_with_hlc(
        &self,
        table: &str,
        system_id: &str,
        values: Row,
        stamp: Hlc,
    ) -> Result<usize, DbError> {
        self.update_with_hlc(
            table,
            values,
            Where::eq(SYSTEM_ID, Value::text(system_id)),
            stamp,
        )
        .await
    }

    pub async fn get_by_system_id(
        &self,
        table: &str,
        system_id: &str,
    ) -> Result<Option<Row>, DbError> {
        let query = Query::from(table)
            .filter(Where::eq(SYSTEM_ID, Value::text(system_id)))
            .limit(1);
        let result = self.query(&query).await?;
        Ok(result.rows.into_iter().next())
    }

    /// Deletes matching rows, journaling a tombstone per row.
    pub async fn delete(&self, table: &str, filter: Where) -> Result<usize, DbError> {
        self.delete_with_hlc(table, filter, None).await
    }

    pub async fn delete_with_hlc(
        &self,
        table: &str,
        filter: Where,
        stamp: Option<Hlc>,
    ) -> Result<usize, DbError> {
        let _ = self.writable_table(table)?;

        let (select_sql, select_params) = render_select(
            &Query::from(table).select(SYSTEM_ID).filter(filter),
        )?;

        let hlc = stamp.unwrap_or_else(|| self.clock.now());
        let mut tx = self.backend.begin_transaction().await?;
        let result = async {
            let matched = tx.execute(&select_sql, &select_params).await?;
            let ids: Vec<String> = matched
                .rows
                .iter()
                .filter_map(|row| row.get(SYSTEM_ID))
                .filter_map(|value| value.as_text().map(str::to_string))
                .collect();
            if ids.is_empty() {
                return Ok::<_, DbError>((Vec::new(), Vec::new()));
            }

            let mut descriptors = Vec::with_capacity(ids.len());
            for id in &ids {
                let entry = DirtyRow::new(
                    table,
                    id,
                    DirtyKind::Delete,
                    serde_json::Map::new(),
                    hlc.clone(),
                );
                journal::append(tx.as_mut(), &entry).await?;
                descriptors.push(ChangeDescriptor::delete(table, id));
            }

            let placeholders = vec!["?"; ids.len()].join(", ");
            let params: Vec<Value> = ids.iter().map(|id| Value::text(id)).collect();
            tx.execute(
                &format!("DELETE FROM {table} WHERE {SYSTEM_ID} IN ({placeholders})"),
                &params,
            )
            .await
            .map_err(DbError::into_delete_failure)?;

            Ok((ids, descriptors))
        }
        .await;

        match result {
            Ok((ids, descriptors)) => {
                tx.commit().await.map_err(DbError::into_delete_failure)?;
                self.bus.emit(descriptors);
                Ok(ids.len())
            }
            Err(err) => abort(tx, err).await,
        }
    }

    pub async fn delete_by_system_id(&self, table: &str, system_id: &str) -> Result<usize, DbError> {
        self.delete(table, Where::eq(SYSTEM_ID, Value::text(system_id)))
            .await
    }

    async fn update_inner(
        &self,
        table: &str,
        values: Row,
        filter: Where,
        stamp: Option<Hlc>,
    ) -> Result<usize, DbError> {
        Ok(self
            .update_outcome(table, values, filter, stamp)
            .await?
            .changed)
    }

    async fn update_outcome(
        &self,
        table: &str,
        values: Row,
        filter: Where,
        stamp: Option<Hlc>,
    ) -> Result<UpdateOutcome, DbError> {
        let def = self.writable_table(table)?;
        validate_caller_columns(def, &values)?;
        if values.is_empty() {
            return Err(DbError::invalid_data("update requires at least one column"));
        }

        let mut incoming: Vec<(String, Value, bool)> = Vec::with_capacity(values.len());
        for (column, value) in values.iter() {
            let column_def = def.column(column).ok_or_else(|| {
                DbError::invalid_data(format!("unknown column {column:?} in table {table:?}"))
            })?;
            incoming.push((
                column.to_string(),
                serialize_value(table, column_def, value)?,
                column_def.lww,
            ));
        }

        let hlc = stamp.unwrap_or_else(|| self.clock.now());
        let (select_sql, select_params) =
            render_select(&Query::from(table).filter(filter))?;

        let mut tx = self.backend.begin_transaction().await?;
        let result = async {
            let current = tx.execute(&select_sql, &select_params).await?;
            let matched = current.rows.len();
            let mut descriptors = Vec::new();

            for row in &current.rows {
                let system_id = row
                    .get(SYSTEM_ID)
                    .and_then(|value| value.as_text())
                    .map(str::to_string)
                    .ok_or_else(|| {
                        DbError::invalid_query(format!(
                            "table {table} rows carry no {SYSTEM_ID}"
                        ))
                    })?;

                let mut committed: Vec<(String, Value)> = Vec::new();
                for (column, value, lww) in &incoming {
                    if *lww && !caller_wins(row, column, &hlc)? {
                        continue;
                    }
                    committed.push((column.clone(), value.clone()));
                    if *lww {
                        committed.push((
                            hlc_shadow_column(column),
                            Value::Text(hlc.to_string()),
                        ));
                    }
                }
                if committed.is_empty() {
                    continue;
                }
                committed.push((SYSTEM_VERSION.to_string(), Value::Text(hlc.to_string())));

                let assignments: Vec<String> = committed
                    .iter()
                    .map(|(column, _)| format!("{column} = ?"))
                    .collect();
                let mut params: Vec<Value> =
                    committed.iter().map(|(_, value)| value.clone()).collect();
                params.push(Value::text(&system_id));
                tx.execute(
                    &format!(
                        "UPDATE {table} SET {} WHERE {SYSTEM_ID} = ?",
                        assignments.join(", ")
                    ),
                    &params,
                )
                .await
                .map_err(DbError::into_update_failure)?;

                let payload = journal::payload_from_fields(
                    committed
                        .iter()
                        .map(|(column, value)| (column.as_str(), value)),
                )?;
                journal::append(
                    tx.as_mut(),
                    &DirtyRow::new(table, &system_id, DirtyKind::Update, payload, hlc.clone()),
                )
                .await?;

                let columns: BTreeSet<String> =
                    committed.into_iter().map(|(column, _)| column).collect();
                descriptors.push(ChangeDescriptor::update(table, &system_id, columns));
            }

            Ok::<_, DbError>((matched, descriptors))
        }
        .await;

        match result {
            Ok((matched, descriptors)) => {
                tx.commit().await.map_err(DbError::into_update_failure)?;
                let changed = descriptors.len();
                self.bus.emit(descriptors);
                Ok(UpdateOutcome { matched, changed })
            }
            Err(err) => abort(tx, err).await,
        }
    }

    fn writable_table(&self, name: &str) -> Result<&Table, DbError> {
        match self.schema.table(name) {
            Some(table) if table.is_system => Err(DbError::Create {
                kind: CreateFailureKind::AccessDenied,
                message: format!("system table {name} cannot be written directly"),
                cause: None,
            }),
            Some(table) => Ok(table),
            None if self.schema.view(name).is_some() => Err(DbError::invalid_data(format!(
                "{name} is a view; write through a for_update query instead"
            ))),
            None => Err(DbError::not_found(format!("unknown table {name:?}"))),
        }
    }
}

struct UpdateOutcome {
    matched: usize,
    changed: usize,
}

/// True when the caller's stamp is strictly greater than the row's shadow
/// clock for `column`. Absent shadows always lose to the incoming write.
fn caller_wins(row: &Row, column: &str, stamp: &Hlc) -> Result<bool, DbError> {
    let shadow = hlc_shadow_column(column);
    match row.get(&shadow).and_then(|value| value.as_text()) {
        Some(existing) => Ok(*stamp > Hlc::parse(existing)?),
        None => Ok(true),
    }
}

async fn abort<T>(
    tx: Box<dyn StorageTransaction + '_>,
    err: DbError,
) -> Result<T, DbError> {
    match tx.rollback().await {
        Ok(()) => Err(err),
        Err(rollback_err) => Err(DbError::rollback(
            format!("rollback failed: {rollback_err}"),
            err,
        )),
    }
}

fn insert_sql(table: &str, columns: &[String]) -> String {
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT INTO {table} ({}) VALUES ({placeholders})",
        columns.join(", ")
    )
}

fn validate_caller_columns(def: &Table, values: &Row) -> Result<(), DbError> {
    for (column, _) in values.iter() {
        if is_system_column(column) || is_hlc_shadow_column(column) {
            return Err(DbError::invalid_data(format!(
                "column {column:?} is maintained by the data layer and cannot be set directly"
            )));
        }
        if def.column(column).is_none() {
            return Err(DbError::invalid_data(format!(
                "unknown column {column:?} in table {:?}",
                def.name
            )));
        }
    }
    Ok(())
}

/// Type-checks a caller value against the column's logical type and lowers
/// it to physical form. Range and length constraints apply here so invalid
/// data never reaches the engine.
pub(crate) fn serialize_value(
    table: &str,
    column: &Column,
    value: &Value,
) -> Result<Value, DbError> {
    if value.is_null() {
        if column.not_null {
            return Err(DbError::invalid_data(format!(
                "column {table}.{} is not nullable",
                column.name
            )));
        }
        return Ok(Value::Null);
    }

    let mismatch = || {
        DbError::invalid_data(format!(
            "column {table}.{} expects {:?}, got incompatible value",
            column.name, column.logical
        ))
    };

    match column.logical {
        LogicalType::Guid | LogicalType::Fileset => value
            .as_text()
            .map(|text| Value::Text(text.to_string()))
            .ok_or_else(mismatch),
        LogicalType::Text => match value {
            Value::Text(text) => {
                if let Some(max_length) = column.max_length {
                    if text.chars().count() > max_length as usize {
                        return Err(DbError::invalid_data(format!(
                            "column {table}.{} exceeds max length {max_length}",
                            column.name
                        )));
                    }
                }
                Ok(Value::Text(text.clone()))
            }
            _ => Err(mismatch()),
        },
        LogicalType::Integer => match value {
            Value::Integer(int) => {
                check_range(table, column, *int as f64)?;
                Ok(Value::Integer(*int))
            }
            _ => Err(mismatch()),
        },
        LogicalType::Real => match value {
            Value::Real(real) => {
                check_range(table, column, *real)?;
                Ok(Value::Real(*real))
            }
            Value::Integer(int) => {
                check_range(table, column, *int as f64)?;
                Ok(Value::Real(*int as f64))
            }
            _ => Err(mismatch()),
        },
        LogicalType::Date => match value {
            Value::Date(_) => Ok(value.clone().into_storage()),
            Value::Text(text) => {
                DateTime::parse_from_rfc3339(text).map_err(|_| mismatch())?;
                Ok(Value::Text(text.clone()))
            }
            _ => Err(mismatch()),
        },
        LogicalType::Hlc => match value {
            Value::Hlc(hlc) => Ok(Value::Text(hlc.to_string())),
            Value::Text(text) => {
                Hlc::parse(text)?;
                Ok(Value::Text(text.clone()))
            }
            _ => Err(mismatch()),
        },
    }
}

fn check_range(table: &str, column: &Column, value: f64) -> Result<(), DbError> {
    if let Some(min) = column.min {
        if value < min {
            return Err(DbError::invalid_data(format!(
                "column {table}.{} is below the declared minimum {min}",
                column.name
            )));
        }
    }
    if let Some(max) = column.max {
        if value > max {
            return Err(DbError::invalid_data(format!(
                "column {table}.{} is above the declared maximum {max}",
                column.name
            )));
        }
    }
    Ok(())
}
