use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use uuid::Uuid;

use crate::backend::{StorageBackend, StorageTransaction};
use crate::error::DbError;
use crate::hlc::Hlc;
use crate::schema::DIRTY_ROWS_TABLE;
use crate::types::{Row, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirtyKind {
    Insert,
    Update,
    Delete,
}

impl DirtyKind {
    fn as_str(self) -> &'static str {
        match self {
            DirtyKind::Insert => "insert",
            DirtyKind::Update => "update",
            DirtyKind::Delete => "delete",
        }
    }

    fn parse(input: &str) -> Result<Self, DbError> {
        match input {
            "insert" => Ok(DirtyKind::Insert),
            "update" => Ok(DirtyKind::Update),
            "delete" => Ok(DirtyKind::Delete),
            other => Err(DbError::invalid_data(format!(
                "unknown dirty journal kind {other:?}"
            ))),
        }
    }
}

/// One journaled, sync-pending mutation. The payload is the minimum diff
/// the sync layer needs to replay the mutation remotely: all user columns
/// for an insert, exactly the committed fields for an update, nothing for a
/// delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirtyRow {
    pub id: String,
    pub table: String,
    pub row_id: String,
    pub kind: DirtyKind,
    pub payload: JsonMap<String, JsonValue>,
    pub hlc: Hlc,
}

impl DirtyRow {
    pub(crate) fn new(
        table: impl Into<String>,
        row_id: impl Into<String>,
        kind: DirtyKind,
        payload: JsonMap<String, JsonValue>,
        hlc: Hlc,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            table: table.into(),
            row_id: row_id.into(),
            kind,
            payload,
            hlc,
        }
    }
}

/// Appends an entry inside the mutation's own storage transaction, so a
/// rollback leaves no journal trace.
pub(crate) async fn append(
    tx: &mut (dyn StorageTransaction + '_),
    entry: &DirtyRow,
) -> Result<(), DbError> {
    let payload = serde_json::to_string(&entry.payload)
        .map_err(|err| DbError::invalid_data(format!("journal payload serialization: {err}")))?;
    tx.execute(
        &format!(
            "INSERT INTO {DIRTY_ROWS_TABLE} (id, table_name, row_id, kind, payload, hlc) \
             VALUES (?, ?, ?, ?, ?, ?)"
        ),
        &[
            Value::Text(entry.id.clone()),
            Value::Text(entry.table.clone()),
            Value::Text(entry.row_id.clone()),
            Value::Text(entry.kind.as_str().to_string()),
            Value::Text(payload),
            Value::Text(entry.hlc.to_string()),
        ],
    )
    .await?;
    Ok(())
}

/// Enumerates pending entries in commit order, optionally after a sync
/// checkpoint. HLC text ordering equals temporal ordering, so the cursor is
/// a plain string comparison in SQL.
pub(crate) async fn list(
    backend: &dyn StorageBackend,
    since: Option<&Hlc>,
) -> Result<Vec<DirtyRow>, DbError> {
    let base =
        format!("SELECT id, table_name, row_id, kind, payload, hlc FROM {DIRTY_ROWS_TABLE}");
    let (sql, params) = match since {
        Some(checkpoint) => (
            format!("{base} WHERE hlc > ? ORDER BY hlc, id"),
            vec![Value::Text(checkpoint.to_string())],
        ),
        None => (format!("{base} ORDER BY hlc, id"), Vec::new()),
    };

    let result = backend.execute(&sql, &params).await?;
    result.rows.iter().map(parse_entry).collect()
}

/// Removes acknowledged (or discarded) entries by id.
pub(crate) async fn clear(backend: &dyn StorageBackend, ids: &[String]) -> Result<(), DbError> {
    if ids.is_empty() {
        return Ok(());
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let params: Vec<Value> = ids.iter().map(|id| Value::Text(id.clone())).collect();
    backend
        .execute(
            &format!("DELETE FROM {DIRTY_ROWS_TABLE} WHERE id IN ({placeholders})"),
            &params,
        )
        .await?;
    Ok(())
}

fn parse_entry(row: &Row) -> Result<DirtyRow, DbError> {
    let text = |column: &str| -> Result<String, DbError> {
        row.get(column)
            .and_then(|value| value.as_text())
            .map(str::to_string)
            .ok_or_else(|| {
                DbError::invalid_data(format!("journal row missing text column {column:?}"))
            })
    };

    let payload_text = text("payload")?;
    let payload: JsonMap<String, JsonValue> = serde_json::from_str(&payload_text)
        .map_err(|err| DbError::invalid_data(format!("journal payload deserialization: {err}")))?;

    Ok(DirtyRow {
        id: text("id")?,
        table: text("table_name")?,
        row_id: text("row_id")?,
        kind: DirtyKind::parse(&text("kind")?)?,
        payload,
        hlc: Hlc::parse(&text("hlc")?)?,
    })
}

/// Converts row fields to a JSON payload object.
pub(crate) fn payload_from_fields<'a>(
    fields: impl Iterator<Item = (&'a str, &'a Value)>,
) -> Result<JsonMap<String, JsonValue>, DbError> {
    let mut payload = JsonMap::new();
    for (column, value) in fields {
        payload.insert(column.to_string(), value_to_json(value)?);
    }
    Ok(payload)
}

pub(crate) fn value_to_json(value: &Value) -> Result<JsonValue, DbError> {
    Ok(match value.clone().into_storage() {
        Value::Null => JsonValue::Null,
        Value::Integer(value) => JsonValue::from(value),
        Value::Real(value) => serde_json::Number::from_f64(value)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        Value::Text(text) => JsonValue::String(text),
        Value::Blob(_) => {
            return Err(DbError::invalid_data(
                "blob values cannot enter the dirty journal",
            ))
        }
        _ => unreachable!("logical value survived storage lowering"),
    })
}

#[cfg(test)]
mod tests {
    use super::{payload_from_fields, value_to_json, DirtyKind};
    use crate::Value;

    #[test]
    fn dirty_kind_round_trips() {
        for kind in [DirtyKind::Insert, DirtyKind::Update, DirtyKind::Delete] {
            assert_eq!(DirtyKind::parse(kind.as_str()).expect("parse"), kind);
        }
        assert!(DirtyKind::parse("upsert").is_err());
    }

    #[test]
    fn payload_preserves_field_values() {
        let name = Value::text("Ada");
        let age = Value::Integer(36);
        let fields = vec![("name", &name), ("age", &age)];
        let payload = payload_from_fields(fields.into_iter()).expect("payload");

        assert_eq!(payload["name"], serde_json::json!("Ada"));
        assert_eq!(payload["age"], serde_json::json!(36));
    }

    #[test]
    fn blob_payloads_are_rejected() {
        assert!(value_to_json(&Value::Blob(vec![1, 2, 3])).is_err());
    }
}
