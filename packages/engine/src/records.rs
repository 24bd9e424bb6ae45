use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;

use chrono::{DateTime, Utc};

use crate::database::Database;
use crate::error::DbError;
use crate::hlc::Hlc;
use crate::query::{Query, QuerySource};
use crate::schema::{
    is_hlc_shadow_column, is_system_column, LogicalType, Table, SYSTEM_ID, SYSTEM_VERSION,
};
use crate::types::{Row, Value};
use crate::watch::Watch;

/// Explicit factory context for typed records. A process may host several
/// databases, each with its own registry; there is no global state.
#[derive(Default)]
pub struct FactoryRegistry {
    factories: HashMap<TypeId, Box<dyn Fn(Record) -> Box<dyn Any> + Send + Sync>>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: 'static>(&mut self, factory: impl Fn(Record) -> T + Send + Sync + 'static) {
        self.factories.insert(
            TypeId::of::<T>(),
            Box::new(move |record| Box::new(factory(record)) as Box<dyn Any>),
        );
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.factories.contains_key(&TypeId::of::<T>())
    }

    fn create<T: 'static>(&self, record: Record) -> Option<T> {
        let factory = self.factories.get(&TypeId::of::<T>())?;
        factory(record).downcast::<T>().ok().map(|boxed| *boxed)
    }
}

/// Value-typed view over one materialized row with per-field change
/// tracking.
///
/// A record is writable when it has a CRUD target (a plain table query, or
/// a view query tagged `for_update`) and its projection surfaced the
/// target's `system_id` and `system_version`. Anything else is read-only
/// and `set`/`save` fail with an invalid-data error.
#[derive(Debug)]
pub struct Record {
    target: Option<Table>,
    row: Row,
    dirty: Row,
}

impl Record {
    pub(crate) fn new(target: Option<Table>, row: Row) -> Self {
        let writable = target.is_some()
            && row.contains(SYSTEM_ID)
            && row.contains(SYSTEM_VERSION);
        Self {
            target: if writable { target } else { None },
            row,
            dirty: Row::new(),
        }
    }

    pub fn is_writable(&self) -> bool {
        self.target.is_some()
    }

    pub fn system_id(&self) -> Option<&str> {
        self.row.get(SYSTEM_ID).and_then(Value::as_text)
    }

    pub fn system_version(&self) -> Result<Option<Hlc>, DbError> {
        self.row
            .get(SYSTEM_VERSION)
            .and_then(Value::as_text)
            .map(Hlc::parse)
            .transpose()
    }

    /// Raw value with the dirty overlay applied.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.dirty.get(column).or_else(|| self.row.get(column))
    }

    pub fn get_text(&self, column: &str) -> Result<Option<&str>, DbError> {
        self.check_logical(column, &[LogicalType::Text])?;
        Ok(self.get(column).and_then(Value::as_text))
    }

    pub fn get_guid(&self, column: &str) -> Result<Option<&str>, DbError> {
        self.check_logical(column, &[LogicalType::Guid])?;
        Ok(self.get(column).and_then(Value::as_text))
    }

    pub fn get_fileset_id(&self, column: &str) -> Result<Option<&str>, DbError> {
        self.check_logical(column, &[LogicalType::Fileset])?;
        Ok(self.get(column).and_then(Value::as_text))
    }

    pub fn get_integer(&self, column: &str) -> Result<Option<i64>, DbError> {
        self.check_logical(column, &[LogicalType::Integer])?;
        Ok(self.get(column).and_then(Value::as_integer))
    }

    pub fn get_real(&self, column: &str) -> Result<Option<f64>, DbError> {
        self.check_logical(column, &[LogicalType::Real, LogicalType::Integer])?;
        Ok(self.get(column).and_then(Value::as_real))
    }

    pub fn get_date(&self, column: &str) -> Result<Option<DateTime<Utc>>, DbError> {
        self.check_logical(column, &[LogicalType::Date])?;
        match self.get(column) {
            Some(Value::Date(date)) => Ok(Some(*date)),
            Some(Value::Text(text)) => DateTime::parse_from_rfc3339(text)
                .map(|date| Some(date.with_timezone(&Utc)))
                .map_err(|err| DbError::invalid_data(format!("malformed date value: {err}"))),
            Some(Value::Null) | None => Ok(None),
            Some(other) => Err(DbError::invalid_data(format!(
                "column {column:?} holds a non-date value {other:?}"
            ))),
        }
    }

    pub fn get_hlc(&self, column: &str) -> Result<Option<Hlc>, DbError> {
        match self.get(column) {
            Some(Value::Hlc(hlc)) => Ok(Some(hlc.clone())),
            Some(Value::Text(text)) => Hlc::parse(text).map(Some),
            Some(Value::Null) | None => Ok(None),
            Some(other) => Err(DbError::invalid_data(format!(
                "column {column:?} holds a non-HLC value {other:?}"
            ))),
        }
    }

    /// Stages a field change. Fails on read-only records and on columns the
    /// target table does not own.
    pub fn set(&mut self, column: &str, value: Value) -> Result<(), DbError> {
        let target = self.target.as_ref().ok_or_else(|| {
            DbError::invalid_data(
                "record is read-only; materialize it from a for_update query to write",
            )
        })?;
        if is_system_column(column) || is_hlc_shadow_column(column) {
            return Err(DbError::invalid_data(format!(
                "column {column:?} is maintained by the data layer"
            )));
        }
        let column_def = target.column(column).ok_or_else(|| {
            DbError::invalid_data(format!(
                "column {column:?} does not belong to target table {:?}",
                target.name
            ))
        })?;
        let serialized = crate::write::serialize_value(&target.name, column_def, &value)?;
        self.dirty.set(column, serialized);
        Ok(())
    }

    pub fn dirty_columns(&self) -> Vec<&str> {
        self.dirty.columns().iter().map(String::as_str).collect()
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Flushes staged changes through the write path and folds them into
    /// the local snapshot. A clean record is a no-op.
    pub async fn save(&mut self, database: &Database) -> Result<(), DbError> {
        if self.dirty.is_empty() {
            return Ok(());
        }
        let (table, system_id) = self.write_target()?;
        database
            .update_by_system_id(&table, &system_id, self.dirty.clone())
            .await?;
        let staged = std::mem::take(&mut self.dirty);
        for (column, value) in staged.iter() {
            self.row.set(column, value.clone());
        }
        Ok(())
    }

    /// Re-reads the row from storage, dropping staged changes.
    pub async fn reload(&mut self, database: &Database) -> Result<(), DbError> {
        let (table, system_id) = self.write_target()?;
        self.row = database
            .get_by_system_id(&table, &system_id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("row {system_id:?} no longer exists")))?;
        self.dirty = Row::new();
        Ok(())
    }

    pub async fn delete(self, database: &Database) -> Result<(), DbError> {
        let (table, system_id) = self.write_target()?;
        database.delete_by_system_id(&table, &system_id).await?;
        Ok(())
    }

    fn write_target(&self) -> Result<(String, String), DbError> {
        let target = self.target.as_ref().ok_or_else(|| {
            DbError::invalid_data(
                "record is read-only; materialize it from a for_update query to write",
            )
        })?;
        let system_id = self.system_id().ok_or_else(|| {
            DbError::invalid_data(
                "record projection did not surface the target's system_id",
            )
        })?;
        Ok((target.name.clone(), system_id.to_string()))
    }

    fn check_logical(&self, column: &str, expected: &[LogicalType]) -> Result<(), DbError> {
        let Some(target) = self.target.as_ref() else {
            // View-shaped records have no table definition to check
            // against; values answer for themselves.
            return Ok(());
        };
        if let Some(column_def) = target.column(column) {
            if !expected.contains(&column_def.logical) {
                return Err(DbError::invalid_data(format!(
                    "column {:?}.{column} is {:?}, not one of {expected:?}",
                    target.name, column_def.logical
                )));
            }
        }
        Ok(())
    }
}

impl Database {
    /// Resolves the CRUD target of a query: the `for_update` annotation, or
    /// the source table for plain table queries. View queries without
    /// `for_update` have no target and materialize read-only records.
    pub(crate) fn record_target(&self, query: &Query) -> Option<Table> {
        if let Some(target) = &query.for_update {
            return self
                .schema
                .table(target)
                .filter(|table| !table.is_system)
                .cloned();
        }
        match &query.source {
            QuerySource::Table { name, .. } => self
                .schema
                .table(name)
                .filter(|table| !table.is_system)
                .cloned(),
            QuerySource::Subquery { .. } => None,
        }
    }

    /// Materializes records with change tracking.
    pub async fn query_record_rows(&self, query: &Query) -> Result<Vec<Record>, DbError> {
        let target = self.record_target(query);
        let result = self.query(query).await?;
        Ok(result
            .rows
            .into_iter()
            .map(|row| Record::new(target.clone(), row))
            .collect())
    }

    /// Typed variant; requires a factory registered for `T`.
    pub async fn query_records<T: 'static>(&self, query: &Query) -> Result<Vec<T>, DbError> {
        if !self.factories.contains::<T>() {
            return Err(DbError::invalid_query(
                "no record factory registered for the requested type",
            ));
        }
        let records = self.query_record_rows(query).await?;
        Ok(records
            .into_iter()
            .filter_map(|record| self.factories.create::<T>(record))
            .collect())
    }

    /// Watch variant of [`Database::query_records`].
    pub fn watch_records<T: 'static>(&self, query: Query) -> Result<RecordsWatch<'_, T>, DbError> {
        if !self.factories.contains::<T>() {
            return Err(DbError::invalid_query(
                "no record factory registered for the requested type",
            ));
        }
        let target = self.record_target(&query);
        let watch = self.watch(query)?;
        Ok(RecordsWatch {
            database: self,
            watch,
            target,
            _marker: PhantomData,
        })
    }
}

/// Lazy sequence of typed record snapshots.
pub struct RecordsWatch<'a, T> {
    database: &'a Database,
    watch: Watch<'a>,
    target: Option<Table>,
    _marker: PhantomData<T>,
}

impl<T: 'static> RecordsWatch<'_, T> {
    pub async fn next(&mut self) -> Result<Option<Vec<T>>, DbError> {
        let Some(event) = self.watch.next().await? else {
            return Ok(None);
        };
        let records = event
            .rows
            .rows
            .into_iter()
            .map(|row| Record::new(self.target.clone(), row))
            .filter_map(|record| self.database.factories.create::<T>(record))
            .collect();
        Ok(Some(records))
    }

    pub fn close(&mut self) {
        self.watch.close();
    }
}
