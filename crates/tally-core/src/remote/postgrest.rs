//! Supabase PostgREST client for the remote authority.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde_json::{Map, Value};

use super::{
    ensure_authority_id, Identity, ListRequest, RemoteAuthority, RemoteError, RemoteRecord,
    RemoteResult, WriteAck,
};
use crate::auth::parse_api_error;
use crate::models::{EntityKind, RecordId, SyncRecord};
use crate::util::normalize_text_option;

/// Column holding the owner id on every remote table
const OWNER_COLUMN: &str = "user_id";

/// Columns the authority manages itself; never part of `data`
const SYSTEM_COLUMNS: [&str; 5] = ["id", OWNER_COLUMN, "updated_at", "created_at", "version"];

#[derive(Clone)]
pub struct SupabaseRemote {
    rest_url: String,
    anon_key: String,
    client: Client,
}

impl SupabaseRemote {
    pub fn new(
        url: impl AsRef<str>,
        anon_key: impl Into<String>,
        timeout: Duration,
    ) -> RemoteResult<Self> {
        let rest_url = normalize_rest_url(url.as_ref())?;
        let anon_key = anon_key.into().trim().to_string();
        if anon_key.is_empty() {
            return Err(RemoteError::InvalidPayload(
                "Supabase anon key must not be empty".to_string(),
            ));
        }

        Ok(Self {
            rest_url,
            anon_key,
            client: Client::builder().timeout(timeout).build()?,
        })
    }

    fn request(&self, method: Method, kind: EntityKind, identity: &Identity) -> RequestBuilder {
        self.client
            .request(method, format!("{}/{}", self.rest_url, kind.remote_table()))
            .header("apikey", &self.anon_key)
            .bearer_auth(identity.access_token())
            .query(&[(OWNER_COLUMN, format!("eq.{}", identity.owner_id))])
    }

    async fn send_rows(&self, request: RequestBuilder) -> RemoteResult<Vec<Map<String, Value>>> {
        let response = check_status(request.send().await?).await?;
        Ok(response.json::<Vec<Map<String, Value>>>().await?)
    }

    async fn write(&self, request: RequestBuilder, what: &str) -> RemoteResult<WriteAck> {
        let rows = self
            .send_rows(request.header("Prefer", "return=representation"))
            .await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::NotFound(what.to_string()))?;
        let record = parse_row(row)?;
        Ok(WriteAck {
            id: record.id,
            updated_at: record.updated_at,
        })
    }
}

impl RemoteAuthority for SupabaseRemote {
    async fn insert(&self, identity: &Identity, record: &SyncRecord) -> RemoteResult<WriteAck> {
        let mut body = record.data.clone();
        body.insert(
            OWNER_COLUMN.to_string(),
            Value::String(identity.owner_id.to_string()),
        );
        body.insert("version".to_string(), Value::from(record.version));

        let request = self.request(Method::POST, record.kind, identity).json(&body);
        self.write(request, &format!("{} insert", record.kind)).await
    }

    async fn update(&self, identity: &Identity, record: &SyncRecord) -> RemoteResult<WriteAck> {
        ensure_authority_id(&record.id)?;

        let mut body = record.data.clone();
        body.insert("version".to_string(), Value::from(record.version));

        let request = self
            .request(Method::PATCH, record.kind, identity)
            .query(&[("id", format!("eq.{}", record.id))])
            .json(&body);
        self.write(request, &format!("{} {}", record.kind, record.id))
            .await
    }

    async fn delete(
        &self,
        identity: &Identity,
        kind: EntityKind,
        id: &RecordId,
    ) -> RemoteResult<()> {
        ensure_authority_id(id)?;

        let request = self
            .request(Method::DELETE, kind, identity)
            .query(&[("id", format!("eq.{id}"))])
            .header("Prefer", "return=minimal");

        // 204 whether or not a row matched, so an absent row is success
        check_status(request.send().await?).await?;
        Ok(())
    }

    async fn list(
        &self,
        identity: &Identity,
        kind: EntityKind,
        request: &ListRequest,
    ) -> RemoteResult<Vec<RemoteRecord>> {
        let mut builder = self.request(Method::GET, kind, identity).query(&[
            ("select", "*".to_string()),
            ("order", "updated_at.desc,id.asc".to_string()),
            ("limit", request.limit.to_string()),
            ("offset", request.offset.to_string()),
        ]);
        if let Some(updated_after) = request.updated_after {
            let updated_after = format_timestamp_micros(updated_after)?;
            builder = builder.query(&[("updated_at", format!("gt.{updated_after}"))]);
        }

        self.send_rows(builder)
            .await?
            .into_iter()
            .map(parse_row)
            .collect()
    }
}

fn normalize_rest_url(url: &str) -> RemoteResult<String> {
    let trimmed = normalize_text_option(Some(url.to_string()))
        .ok_or_else(|| RemoteError::InvalidPayload("Supabase URL must not be empty".to_string()))?;
    let trimmed = trimmed.trim_end_matches('/');
    if !crate::util::is_http_url(trimmed) {
        return Err(RemoteError::InvalidPayload(
            "Supabase URL must include http:// or https://".to_string(),
        ));
    }
    if trimmed.ends_with("/rest/v1") {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("{trimmed}/rest/v1"))
    }
}

async fn check_status(response: Response) -> RemoteResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = parse_api_error(status, &body);
    Err(match status {
        StatusCode::NOT_FOUND => RemoteError::NotFound(message),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            RemoteError::Unavailable(message)
        }
        status if status.is_server_error() => RemoteError::Unavailable(message),
        _ => RemoteError::Api(message),
    })
}

/// Split a PostgREST row into system columns and domain data
fn parse_row(mut row: Map<String, Value>) -> RemoteResult<RemoteRecord> {
    let id = match row.get("id") {
        Some(Value::String(id)) if !id.trim().is_empty() => id.trim().to_string(),
        Some(Value::Number(id)) => id.to_string(),
        _ => {
            return Err(RemoteError::InvalidPayload(
                "row did not include an id".to_string(),
            ))
        }
    };
    let owner_id = row
        .get(OWNER_COLUMN)
        .and_then(Value::as_str)
        .map(str::to_string);
    let updated_at_micros = match row.get("updated_at") {
        Some(Value::String(raw)) => parse_timestamp_micros(raw)?,
        Some(Value::Number(ms)) => ms
            .as_i64()
            .and_then(|ms| ms.checked_mul(1_000))
            .ok_or_else(|| {
                RemoteError::InvalidPayload(format!("row {id} has a non-integer updated_at"))
            })?,
        _ => {
            return Err(RemoteError::InvalidPayload(format!(
                "row {id} did not include updated_at"
            )))
        }
    };
    let version = row.get("version").and_then(Value::as_i64);

    for column in SYSTEM_COLUMNS {
        row.remove(column);
    }

    Ok(RemoteRecord {
        id,
        owner_id,
        updated_at: updated_at_micros.div_euclid(1_000),
        updated_at_micros,
        version,
        data: row,
    })
}

/// RFC 3339 to Unix µs, the precision Postgres keeps
fn parse_timestamp_micros(raw: &str) -> RemoteResult<i64> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|timestamp| timestamp.timestamp_micros())
        .map_err(|error| RemoteError::InvalidPayload(format!("invalid timestamp {raw}: {error}")))
}

fn format_timestamp_micros(micros: i64) -> RemoteResult<String> {
    DateTime::from_timestamp_micros(micros)
        .map(|timestamp| timestamp.to_rfc3339_opts(SecondsFormat::Micros, true))
        .ok_or_else(|| RemoteError::InvalidPayload(format!("timestamp {micros} is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PullCursor;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn normalize_rest_url_appends_rest_path() {
        assert_eq!(
            normalize_rest_url("https://demo.supabase.co/").unwrap(),
            "https://demo.supabase.co/rest/v1"
        );
        assert_eq!(
            normalize_rest_url("https://demo.supabase.co/rest/v1").unwrap(),
            "https://demo.supabase.co/rest/v1"
        );
        assert!(normalize_rest_url("demo.supabase.co").is_err());
        assert!(normalize_rest_url("  ").is_err());
    }

    #[test]
    fn parse_row_splits_system_columns() {
        let row = json!({
            "id": "7d1c",
            "user_id": "0192f0c1-7a4e-7cc2-9a51-3f1f2b9d6e10",
            "updated_at": "2026-10-18T09:30:00.123456+00:00",
            "created_at": "2026-10-01T00:00:00+00:00",
            "version": 3,
            "name": "Groceries",
            "color": null
        });
        let record = parse_row(row.as_object().cloned().unwrap()).unwrap();

        assert_eq!(record.id, "7d1c");
        assert_eq!(record.version, Some(3));
        assert_eq!(record.updated_at, 1_792_315_800_123);
        assert_eq!(record.updated_at_micros, 1_792_315_800_123_456);
        assert_eq!(
            Value::Object(record.data),
            json!({"name": "Groceries", "color": null})
        );
    }

    #[test]
    fn parse_row_requires_id_and_timestamp() {
        assert!(parse_row(json!({"updated_at": 1}).as_object().cloned().unwrap()).is_err());
        assert!(parse_row(json!({"id": "x"}).as_object().cloned().unwrap()).is_err());
    }

    #[test]
    fn cursor_filter_keeps_microsecond_precision() {
        let row = json!({
            "id": "7d1c",
            "updated_at": "2026-10-18T09:30:00.123456+00:00",
        });
        let record = parse_row(row.as_object().cloned().unwrap()).unwrap();
        let cursor = PullCursor::new(record.updated_at_micros, record.id);

        let filter = format_timestamp_micros(cursor.updated_at).unwrap();
        assert_eq!(filter, "2026-10-18T09:30:00.123456Z");
        // The newest row seen is not strictly after the cursor
        assert_eq!(parse_timestamp_micros(&filter).unwrap(), record.updated_at_micros);
    }

    #[test]
    fn numeric_updated_at_is_read_as_milliseconds() {
        let row = json!({"id": "7d1c", "updated_at": 1_000});
        let record = parse_row(row.as_object().cloned().unwrap()).unwrap();
        assert_eq!(record.updated_at, 1_000);
        assert_eq!(record.updated_at_micros, 1_000_000);
    }

    #[test]
    fn new_rejects_blank_anon_key() {
        let remote = SupabaseRemote::new("https://demo.supabase.co", " ", Duration::from_secs(5));
        assert!(remote.is_err());
    }
}
