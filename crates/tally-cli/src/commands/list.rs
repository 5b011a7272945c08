use tally_core::EntityKind;

use crate::commands::common::{
    format_record_lines, open_local_ledger, record_to_list_item, resolve_record, split_assignment,
    CliContext, RecordListItem,
};
use crate::error::CliError;

pub async fn run_list(
    ctx: &CliContext,
    kind: EntityKind,
    limit: usize,
    filter: Option<&str>,
    as_json: bool,
) -> Result<(), CliError> {
    let ledger = open_local_ledger(ctx).await?;
    let mut records = if let Some(filter) = filter {
        let (field, value) = split_assignment(filter)?;
        ledger.list_by_field(kind, &field, value).await?
    } else {
        ledger.list_entities(kind).await?
    };
    records.truncate(limit);

    if as_json {
        let json_items = records
            .iter()
            .map(record_to_list_item)
            .collect::<Vec<RecordListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
    } else if records.is_empty() {
        println!("No {kind} records.");
    } else {
        for line in format_record_lines(&records) {
            println!("{line}");
        }
    }

    Ok(())
}

pub async fn run_show(ctx: &CliContext, kind: EntityKind, id: &str) -> Result<(), CliError> {
    let ledger = open_local_ledger(ctx).await?;
    let record = resolve_record(&ledger, kind, id).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&record_to_list_item(&record))?
    );
    Ok(())
}
