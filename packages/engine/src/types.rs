use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::hlc::Hlc;

/// Tagged value carried through the data layer.
///
/// The logical variants (`Date`, `Guid`, `Hlc`, `Fileset`) exist so the typed
/// record layer and the serializer can enforce logical column types. Storage
/// backends only ever observe the physical subset `Null | Integer | Real |
/// Text | Blob`; [`Value::into_storage`] performs the lowering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Date(DateTime<Utc>),
    Guid(String),
    Hlc(Hlc),
    Fileset(String),
}

impl Value {
    pub fn text(value: impl Into<String>) -> Self {
        Value::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Lowers a logical value to its physical storage form.
    ///
    /// Dates become ISO-8601 text, guids and fileset identifiers their
    /// canonical string, HLCs their fixed-width text encoding.
    pub fn into_storage(self) -> Value {
        match self {
            Value::Date(dt) => Value::Text(dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
            Value::Guid(id) => Value::Text(id),
            Value::Hlc(hlc) => Value::Text(hlc.to_string()),
            Value::Fileset(id) => Value::Text(id),
            other => other,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) | Value::Guid(text) | Value::Fileset(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Real(value) => Some(*value),
            Value::Integer(value) => Some(*value as f64),
            _ => None,
        }
    }
}

/// Ordered mapping from column name to [`Value`].
///
/// Preserves projection order; lookups are by name. Rows are small, so linear
/// scans beat a map here.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, Value)>) -> Self {
        let mut row = Self::new();
        for (column, value) in pairs {
            row.set(column, value);
        }
        row
    }

    /// Sets a column, replacing any existing value under the same name.
    pub fn set(&mut self, column: impl Into<String>, value: Value) -> &mut Self {
        let column = column.into();
        if let Some(index) = self.index_of(&column) {
            self.values[index] = value;
        } else {
            self.columns.push(column);
            self.values.push(value);
        }
        self
    }

    pub fn with(mut self, column: impl Into<String>, value: Value) -> Self {
        self.set(column, value);
        self
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.index_of(column).map(|index| &self.values[index])
    }

    pub fn remove(&mut self, column: &str) -> Option<Value> {
        let index = self.index_of(column)?;
        self.columns.remove(index);
        Some(self.values.remove(index))
    }

    pub fn contains(&self, column: &str) -> bool {
        self.index_of(column).is_some()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    fn index_of(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|name| name == column)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl QueryResult {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
