use serde::Serialize;
use tally_core::EntityKind;

use crate::commands::common::{format_sync_timestamp, open_local_ledger, CliContext};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub owner_id: String,
    pub db_path: String,
    pub live_records: u64,
    pub pending_sync: u64,
    pub conflicts: u64,
    pub queue_retrying: u64,
    pub queue_exhausted: u64,
    /// Most recent completed sync across all kinds
    pub last_sync_at: Option<i64>,
}

pub async fn run_status(ctx: &CliContext, as_json: bool) -> Result<(), CliError> {
    let ledger = open_local_ledger(ctx).await?;
    let stats = ledger.stats().await?;
    let queue = ledger.queue_status().await?;

    let store = ledger.sync_service().store();
    let mut last_sync_at = None;
    for kind in EntityKind::SYNC_ORDER {
        let meta = store.load_meta(ledger.owner(), kind).await?;
        last_sync_at = last_sync_at.max(meta.last_sync_at);
    }

    let report = StatusReport {
        owner_id: ledger.owner().to_string(),
        db_path: ctx.db_path.display().to_string(),
        live_records: stats.live_records,
        pending_sync: stats.pending_sync,
        conflicts: stats.conflicts,
        queue_retrying: queue.counts.retryable,
        queue_exhausted: queue.counts.exhausted,
        last_sync_at,
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for line in format_status_lines(&report) {
            println!("{line}");
        }
    }
    Ok(())
}

pub fn format_status_lines(report: &StatusReport) -> Vec<String> {
    vec![
        format!("Database:     {}", report.db_path),
        format!("Records:      {}", report.live_records),
        format!("Pending sync: {}", report.pending_sync),
        format!(
            "Queue:        {} retrying, {} exhausted",
            report.queue_retrying, report.queue_exhausted
        ),
        format!("Conflicts:    {}", report.conflicts),
        format!(
            "Last sync:    {}",
            report
                .last_sync_at
                .map_or_else(|| "never".to_string(), format_sync_timestamp)
        ),
    ]
}
