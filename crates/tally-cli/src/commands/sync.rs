use tally_core::sync::SyncState;

use crate::commands::common::{
    format_queue_lines, format_sync_conflict_lines, format_sync_result_lines, open_ledger,
    open_local_ledger, queued_operation_to_item, sync_conflict_to_item, CliContext, QueueItem,
    SyncConflictItem,
};
use crate::error::CliError;

pub async fn run_sync(ctx: &CliContext, full: bool) -> Result<(), CliError> {
    let ledger = open_ledger(ctx).await?;
    let result = if full {
        ledger.trigger_full_sync().await
    } else {
        ledger.trigger_sync().await
    };

    for line in format_sync_result_lines(&result) {
        println!("{line}");
    }

    if result.outcome == SyncState::Blocked {
        let reasons = result
            .errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        return Err(CliError::SyncBlocked(reasons));
    }
    Ok(())
}

pub async fn run_sync_conflicts(
    ctx: &CliContext,
    limit: usize,
    as_json: bool,
) -> Result<(), CliError> {
    let ledger = open_local_ledger(ctx).await?;
    let conflicts = ledger.list_conflicts(limit).await?;

    if as_json {
        let json_items = conflicts
            .iter()
            .map(sync_conflict_to_item)
            .collect::<Vec<SyncConflictItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }

    for line in format_sync_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_sync_queue(ctx: &CliContext, as_json: bool) -> Result<(), CliError> {
    let ledger = open_local_ledger(ctx).await?;
    let status = ledger.queue_status().await?;

    if as_json {
        let json_items = status
            .exhausted
            .iter()
            .map(queued_operation_to_item)
            .collect::<Vec<QueueItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    println!(
        "Queued: {} retrying, {} exhausted",
        status.counts.retryable, status.counts.exhausted
    );
    for line in format_queue_lines(&status.exhausted) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_sync_cleanup(ctx: &CliContext) -> Result<(), CliError> {
    let ledger = open_local_ledger(ctx).await?;
    let removed = ledger.cleanup_queue().await?;
    println!("Removed {removed} exhausted queue entries");
    Ok(())
}
