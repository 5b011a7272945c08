use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tally_core::auth::AuthError;
use tally_core::config::EngineConfig;
use tally_core::models::{QueuedOperation, SyncConflict, SyncStatus};
use tally_core::network::{probe_reachable, NetworkStatus};
use tally_core::remote::SupabaseRemote;
use tally_core::sync::{SyncResult, SyncState};
use tally_core::{
    EntityKind, LedgerService, OwnerId, RecordId, StoreService, SyncRecord, SyncService,
};

use crate::auth::{auth_client, CliAuthClient};
use crate::error::CliError;

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const SHORT_ID_LEN: usize = 13;

pub type CliLedger = LedgerService<SupabaseRemote, CliAuthClient>;

/// Settings every command runs with
pub struct CliContext {
    pub config: EngineConfig,
    pub db_path: PathBuf,
    pub offline: bool,
}

impl CliContext {
    pub fn new(config: EngineConfig, cli_db_path: Option<PathBuf>, offline: bool) -> Self {
        let db_path = resolve_db_path(cli_db_path, config.db_path.clone());
        Self {
            config,
            db_path,
            offline,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RecordListItem {
    pub id: String,
    pub kind: EntityKind,
    pub summary: String,
    pub sync_status: SyncStatus,
    pub version: i64,
    pub local_updated_at: i64,
    pub server_updated_at: Option<i64>,
    pub relative_time: String,
    pub last_error: Option<String>,
    pub data: Map<String, Value>,
}

#[derive(Debug, Serialize)]
pub struct SyncConflictItem {
    pub id: i64,
    pub kind: EntityKind,
    pub record_id: String,
    pub local_updated_at: i64,
    pub incoming_updated_at: i64,
    pub resolved_at: i64,
    pub resolved_at_iso: String,
    pub strategy: String,
}

#[derive(Debug, Serialize)]
pub struct QueueItem {
    pub id: String,
    pub kind: EntityKind,
    pub record_id: String,
    pub operation: String,
    pub attempts: u32,
    pub error: Option<String>,
    pub queued_at_iso: String,
}

/// Ledger of the signed-in user, able to reach the remote.
///
/// The remote is considered reachable only when `--offline` is not set and a
/// quick TCP probe to the Supabase host succeeds.
pub async fn open_ledger(ctx: &CliContext) -> Result<CliLedger, CliError> {
    let online = match ctx.config.supabase.as_ref() {
        Some(supabase) if !ctx.offline => probe_reachable(&supabase.url, PROBE_TIMEOUT).await,
        _ => false,
    };
    if !online {
        tracing::info!("Working offline; changes stay queued until the next sync");
    }
    build_ledger(ctx, online).await
}

/// Ledger of the signed-in user for commands that only read the local store
pub async fn open_local_ledger(ctx: &CliContext) -> Result<CliLedger, CliError> {
    build_ledger(ctx, false).await
}

async fn build_ledger(ctx: &CliContext, online: bool) -> Result<CliLedger, CliError> {
    let supabase = ctx
        .config
        .supabase
        .as_ref()
        .ok_or(CliError::SyncNotConfigured)?;
    let auth = auth_client(&ctx.config)?;
    let owner = signed_in_owner(&auth)?;

    let store = StoreService::open_path(ctx.db_path.clone())
        .await?
        .with_max_retries(ctx.config.sync.max_retries);
    let remote = SupabaseRemote::new(
        &supabase.url,
        supabase.anon_key.clone(),
        ctx.config.sync.http_timeout,
    )?;

    let sync = SyncService::new(
        store,
        remote,
        auth,
        Arc::new(NetworkStatus::new(online)),
        ctx.config.sync,
    );
    Ok(LedgerService::new(owner, sync))
}

/// Owner of the stored session. An expired session still names its owner, so
/// local work continues until the next refresh.
fn signed_in_owner(auth: &CliAuthClient) -> Result<OwnerId, CliError> {
    let session = auth.stored_session()?.ok_or(CliError::NotSignedIn)?;
    session.user.id.parse::<OwnerId>().map_err(|error| {
        CliError::Auth(AuthError::InvalidSession(format!(
            "malformed owner id: {error}"
        )))
    })
}

/// Find a live record by full id or unique id prefix
pub async fn resolve_record(
    ledger: &CliLedger,
    kind: EntityKind,
    query: &str,
) -> Result<SyncRecord, CliError> {
    let id = normalize_record_id(query)?;
    if let Some(record) = ledger.get_entity(kind, &id).await? {
        return Ok(record);
    }

    let mut matches = ledger
        .list_entities(kind)
        .await?
        .into_iter()
        .filter(|record| record.id.as_str().starts_with(id.as_str()))
        .take(3)
        .collect::<Vec<_>>();

    match matches.len() {
        0 => Err(CliError::RecordNotFound(format!("{kind} {query}"))),
        1 => Ok(matches.remove(0)),
        _ => {
            let options = matches
                .iter()
                .map(|record| short_id(&record.id))
                .collect::<Vec<_>>()
                .join(", ");
            Err(CliError::AmbiguousRecordId(format!(
                "ID prefix '{query}' is ambiguous; matches: {options}"
            )))
        }
    }
}

pub fn normalize_record_id(id: &str) -> Result<RecordId, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        return Err(CliError::EmptyRecordId);
    }
    Ok(trimmed.parse()?)
}

/// Parse `12`, `12.5` or `12.50` into cents
pub fn parse_amount_cents(raw: &str) -> Result<i64, CliError> {
    let invalid = || CliError::InvalidAmount(raw.to_string());
    let trimmed = raw.trim();
    let (negative, digits) = trimmed
        .strip_prefix('-')
        .map_or((false, trimmed), |rest| (true, rest));
    let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));

    if whole.is_empty() || !whole.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    if fraction.len() > 2 || !fraction.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }

    let whole: i64 = whole.parse().map_err(|_| invalid())?;
    let fraction: i64 = if fraction.is_empty() {
        0
    } else {
        format!("{fraction:0<2}").parse().map_err(|_| invalid())?
    };
    let cents = whole
        .checked_mul(100)
        .and_then(|cents| cents.checked_add(fraction))
        .ok_or_else(invalid)?;

    Ok(if negative { -cents } else { cents })
}

pub fn parse_date(raw: &str) -> Result<NaiveDate, CliError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| CliError::InvalidDate(raw.to_string()))
}

/// Split `FIELD=VALUE`; the value is JSON when it parses, a string otherwise
pub fn parse_assignment(raw: &str) -> Result<(String, Value), CliError> {
    let (field, value) = split_assignment(raw)?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((field, value))
}

pub fn split_assignment(raw: &str) -> Result<(String, &str), CliError> {
    let invalid = || CliError::InvalidAssignment(raw.to_string());
    let (field, value) = raw.split_once('=').ok_or_else(invalid)?;
    let field = field.trim();
    if field.is_empty() {
        return Err(invalid());
    }
    Ok((field.to_string(), value.trim()))
}

pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

pub fn short_id(id: &RecordId) -> String {
    id.as_str().chars().take(SHORT_ID_LEN).collect()
}

fn text_field<'a>(data: &'a Map<String, Value>, key: &str) -> &'a str {
    data.get(key).and_then(Value::as_str).unwrap_or("")
}

fn cents_field(data: &Map<String, Value>, key: &str) -> String {
    data.get(key)
        .and_then(Value::as_i64)
        .map_or_else(|| "?".to_string(), format_cents)
}

/// One-line description of a record's data
pub fn record_summary(record: &SyncRecord) -> String {
    let data = &record.data;
    match record.kind {
        EntityKind::Entry => {
            let sign = if text_field(data, "direction") == "income" {
                "+"
            } else {
                "-"
            };
            let mut summary = format!(
                "{sign}{}  {}",
                cents_field(data, "amount_cents"),
                text_field(data, "occurred_on")
            );
            let note = text_field(data, "note");
            if !note.is_empty() {
                summary.push_str("  ");
                summary.push_str(note);
            }
            summary
        }
        EntityKind::Debt => {
            let mut summary = format!(
                "{}  {}",
                text_field(data, "counterparty"),
                cents_field(data, "amount_cents")
            );
            let due = text_field(data, "due_date");
            if !due.is_empty() {
                summary.push_str(&format!("  due {due}"));
            }
            if data.get("settled").and_then(Value::as_bool) == Some(true) {
                summary.push_str("  settled");
            }
            summary
        }
        EntityKind::Goal => format!(
            "{}  {}/{}",
            text_field(data, "name"),
            data.get("saved_cents")
                .and_then(Value::as_i64)
                .map_or_else(|| "0.00".to_string(), format_cents),
            cents_field(data, "target_cents")
        ),
        EntityKind::Category => text_field(data, "name").to_string(),
        EntityKind::HiddenCategory => format!("hides {}", text_field(data, "category_id")),
        EntityKind::CategoryOrder => format!(
            "{} at {}",
            text_field(data, "category_id"),
            data.get("position").map_or_else(String::new, Value::to_string)
        ),
    }
}

pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut truncated = text
            .chars()
            .take(max_chars.saturating_sub(3))
            .collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

pub fn format_record_lines(records: &[SyncRecord]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    records
        .iter()
        .map(|record| {
            let id = record.id.as_str();
            let summary = truncate(&record_summary(record), 40);
            let relative_time = format_relative_time(record.local_updated_at, now_ms);
            if record.is_pending() {
                format!("{id:<40}  {summary:<40}  {relative_time:<10}  (pending)")
            } else {
                format!("{id:<40}  {summary:<40}  {relative_time}")
            }
        })
        .collect()
}

pub fn record_to_list_item(record: &SyncRecord) -> RecordListItem {
    let now_ms = Utc::now().timestamp_millis();
    RecordListItem {
        id: record.id.to_string(),
        kind: record.kind,
        summary: record_summary(record),
        sync_status: record.sync_status,
        version: record.version,
        local_updated_at: record.local_updated_at,
        server_updated_at: record.server_updated_at,
        relative_time: format_relative_time(record.local_updated_at, now_ms),
        last_error: record.last_error.clone(),
        data: record.data.clone(),
    }
}

pub fn sync_conflict_to_item(conflict: &SyncConflict) -> SyncConflictItem {
    SyncConflictItem {
        id: conflict.id,
        kind: conflict.entity_kind,
        record_id: conflict.record_id.clone(),
        local_updated_at: conflict.local_updated_at,
        incoming_updated_at: conflict.incoming_updated_at,
        resolved_at: conflict.resolved_at,
        resolved_at_iso: format_sync_timestamp(conflict.resolved_at),
        strategy: conflict.strategy.clone(),
    }
}

pub fn format_sync_conflict_lines(conflicts: &[SyncConflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "{}  {}  {}={}  local={} incoming={}",
                format_sync_timestamp(conflict.resolved_at),
                conflict.strategy,
                conflict.entity_kind,
                conflict.record_id,
                conflict.local_updated_at,
                conflict.incoming_updated_at
            )
        })
        .collect()
}

pub fn queued_operation_to_item(operation: &QueuedOperation) -> QueueItem {
    QueueItem {
        id: operation.id.to_string(),
        kind: operation.entity_kind,
        record_id: operation.entity_id.to_string(),
        operation: operation.operation.as_str().to_string(),
        attempts: operation.retry_count,
        error: operation.error.clone(),
        queued_at_iso: format_sync_timestamp(operation.timestamp),
    }
}

pub fn format_queue_lines(operations: &[QueuedOperation]) -> Vec<String> {
    operations
        .iter()
        .map(|operation| {
            format!(
                "{}  {:<6}  {}={}  attempts={}  {}",
                format_sync_timestamp(operation.timestamp),
                operation.operation.as_str(),
                operation.entity_kind,
                operation.entity_id,
                operation.retry_count,
                operation.error.as_deref().unwrap_or("")
            )
        })
        .collect()
}

/// Human summary of a sync run
pub fn format_sync_result_lines(result: &SyncResult) -> Vec<String> {
    let mut lines = Vec::new();
    let totals = result.totals();
    let headline = match result.outcome {
        SyncState::Success => "Sync completed",
        SyncState::PartialFailure => "Sync completed with errors",
        SyncState::Blocked => "Sync blocked",
        SyncState::Idle | SyncState::Syncing => "Sync finished",
    };
    lines.push(format!(
        "{headline}: pushed={} deleted={} pulled={} kept_local={} reconciled={}",
        totals.pushed, totals.deleted, totals.pulled, totals.kept_local, totals.reconciled
    ));

    for (kind, counts) in &result.synced_counts {
        if counts.is_empty() {
            continue;
        }
        lines.push(format!(
            "  {kind:<16} pushed={} deleted={} purged={} pulled={} kept_local={} reconciled={}",
            counts.pushed,
            counts.deleted,
            counts.purged,
            counts.pulled,
            counts.kept_local,
            counts.reconciled
        ));
    }
    for error in &result.errors {
        lines.push(format!("  error: {error}"));
    }
    lines
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;
    let month = 30 * day;
    let year = 365 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else if diff < month {
        format!("{}w ago", diff / week)
    } else if diff < year {
        format!("{}mo ago", diff / month)
    } else {
        format!("{}y ago", diff / year)
    }
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>, config_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or(config_db_path)
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tally")
        .join("tally.db")
}
