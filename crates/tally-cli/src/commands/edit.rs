use serde_json::{Map, Value};
use tally_core::EntityKind;

use crate::commands::common::{open_ledger, parse_assignment, resolve_record, CliContext};
use crate::error::CliError;

pub async fn run_edit(
    ctx: &CliContext,
    kind: EntityKind,
    id: &str,
    assignments: &[String],
) -> Result<(), CliError> {
    let patch = build_patch(assignments)?;
    let ledger = open_ledger(ctx).await?;
    let record = resolve_record(&ledger, kind, id).await?;

    if patch
        .iter()
        .all(|(field, value)| record.data.get(field) == Some(value))
    {
        println!("{}", record.id);
        return Ok(());
    }

    let updated = ledger.update_entity(kind, &record.id, patch).await?;
    println!("{}", updated.id);
    Ok(())
}

/// Later assignments to the same field win
pub fn build_patch(assignments: &[String]) -> Result<Map<String, Value>, CliError> {
    let mut patch = Map::new();
    for assignment in assignments {
        let (field, value) = parse_assignment(assignment)?;
        patch.insert(field, value);
    }
    Ok(patch)
}
