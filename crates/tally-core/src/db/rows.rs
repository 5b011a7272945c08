//! Mapping between `SyncRecord` and entity table rows

use libsql::{Row, Value};
use serde_json::{Map, Value as JsonValue};

use crate::error::{Error, Result};
use crate::models::{EntityKind, OwnerId, SyncRecord};

/// Columns shared by every entity table, in storage order
const BASE_COLUMNS: [&str; 9] = [
    "id",
    "owner_id",
    "sync_status",
    "local_updated_at",
    "server_updated_at",
    "version",
    "is_deleted",
    "last_error",
    "data",
];

/// All columns of a kind's table: base columns then index columns
pub fn columns(kind: EntityKind) -> Vec<&'static str> {
    let mut columns = BASE_COLUMNS.to_vec();
    columns.extend_from_slice(kind.index_columns());
    columns
}

/// `SELECT <base columns> FROM <table> WHERE <filter>`
pub fn select_sql(kind: EntityKind, filter: &str) -> String {
    format!(
        "SELECT {} FROM {} WHERE {filter}",
        BASE_COLUMNS.join(", "),
        kind.table()
    )
}

/// `INSERT INTO <table> (...) VALUES (?, ...)`
pub fn insert_sql(kind: EntityKind) -> String {
    let columns = columns(kind);
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({placeholders})",
        kind.table(),
        columns.join(", ")
    )
}

/// Insert that replaces an existing row unless that row is locally pending
pub fn upsert_sql(kind: EntityKind) -> String {
    let table = kind.table();
    let assignments = columns(kind)
        .into_iter()
        .filter(|column| *column != "id")
        .map(|column| format!("{column} = excluded.{column}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "{} ON CONFLICT(id) DO UPDATE SET {assignments} WHERE {table}.sync_status <> 'pending'",
        insert_sql(kind)
    )
}

/// `UPDATE <table> SET <every column but id> = ? WHERE id = ?`
pub fn update_sql(kind: EntityKind) -> String {
    let assignments = columns(kind)
        .into_iter()
        .filter(|column| *column != "id")
        .map(|column| format!("{column} = ?"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("UPDATE {} SET {assignments} WHERE id = ?", kind.table())
}

fn text_or_null(value: Option<String>) -> Value {
    value.map_or(Value::Null, Value::Text)
}

/// Row values in `columns(kind)` order
pub fn record_values(record: &SyncRecord) -> Result<Vec<Value>> {
    let mut values = vec![
        Value::Text(record.id.to_string()),
        Value::Text(record.owner_id.as_str()),
        Value::Text(record.sync_status.as_str().to_string()),
        Value::Integer(record.local_updated_at),
        record.server_updated_at.map_or(Value::Null, Value::Integer),
        Value::Integer(record.version),
        Value::Integer(i64::from(record.is_deleted)),
        text_or_null(record.last_error.clone()),
        Value::Text(serde_json::to_string(&record.data)?),
    ];
    values.extend(
        record
            .kind
            .index_columns()
            .iter()
            .map(|column| text_or_null(record.index_value(column))),
    );
    Ok(values)
}

/// Row values for `update_sql`: every column except id, then the id
pub fn update_values(record: &SyncRecord) -> Result<Vec<Value>> {
    let mut values = record_values(record)?;
    let id = values.remove(0);
    values.push(id);
    Ok(values)
}

/// Parse a row selected with `select_sql`
pub fn parse_record(kind: EntityKind, row: &Row) -> Result<SyncRecord> {
    let id: String = row.get(0)?;
    let owner_id: String = row.get(1)?;
    let sync_status: String = row.get(2)?;
    let data: String = row.get(8)?;

    let owner_id = owner_id
        .parse::<OwnerId>()
        .map_err(|error| Error::Database(format!("invalid owner_id {owner_id}: {error}")))?;
    let data = serde_json::from_str::<Map<String, JsonValue>>(&data)?;

    Ok(SyncRecord {
        id: id.parse()?,
        owner_id,
        kind,
        sync_status: sync_status.parse()?,
        local_updated_at: row.get(3)?,
        server_updated_at: row.get(4)?,
        version: row.get(5)?,
        is_deleted: row.get::<i32>(6)? != 0,
        last_error: row.get(7)?,
        data,
    })
}
